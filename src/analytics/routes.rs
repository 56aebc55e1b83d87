//! REST endpoints for the dashboard and for operator actions on contacts.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::queries;
use crate::contacts::ContactStatus;
use crate::dispatch::{DispatchEngine, DripScheduler, FollowUpOutcome};
use crate::error::{DatabaseError, FunnelError};
use crate::store::ContactFilter;

const DEFAULT_ACTIVITY_DAYS: u32 = 7;
const DEFAULT_RECENT_LIMIT: usize = 20;
const MAX_RECENT_LIMIT: usize = 200;
const SEARCH_LIMIT: usize = 50;

/// Shared state for analytics routes.
#[derive(Clone)]
pub struct AnalyticsState {
    pub engine: Arc<DispatchEngine>,
    pub drip: Arc<DripScheduler>,
}

#[derive(Debug, Deserialize)]
pub struct ActivityParams {
    days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    query: Option<String>,
    status: Option<String>,
    city: Option<String>,
    specialty: Option<String>,
}

fn failure(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.to_string() })),
    )
        .into_response()
}

fn store_failure(e: DatabaseError) -> Response {
    tracing::error!(error = %e, "Analytics query failed");
    failure(StatusCode::INTERNAL_SERVER_ERROR, e)
}

fn funnel_failure(e: FunnelError) -> Response {
    match e {
        FunnelError::ContactUnavailable {
            source: DatabaseError::NotFound { .. },
            ..
        } => failure(StatusCode::NOT_FOUND, e),
        FunnelError::ConcurrentUpdate { .. } => failure(StatusCode::CONFLICT, e),
        other => {
            tracing::error!(error = %other, "Contact action failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, other)
        }
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// GET /api/analytics/dashboard
async fn get_dashboard(State(state): State<AnalyticsState>) -> Response {
    match queries::dashboard(state.engine.store().as_ref()).await {
        Ok(stats) => Json(json!({ "success": true, "stats": stats })).into_response(),
        Err(e) => store_failure(e),
    }
}

/// GET /api/analytics/funnel
async fn get_funnel(State(state): State<AnalyticsState>) -> Response {
    match queries::funnel(state.engine.store().as_ref()).await {
        Ok(stages) => Json(json!({ "success": true, "funnel": { "stages": stages } })).into_response(),
        Err(e) => store_failure(e),
    }
}

/// GET /api/analytics/activity/daily?days=N
async fn get_daily_activity(
    State(state): State<AnalyticsState>,
    Query(params): Query<ActivityParams>,
) -> Response {
    let days = params.days.filter(|d| *d > 0).unwrap_or(DEFAULT_ACTIVITY_DAYS);
    match queries::daily_activity(state.engine.store().as_ref(), state.engine.now(), days).await {
        Ok(activity) => Json(json!({ "success": true, "activity": activity })).into_response(),
        Err(e) => store_failure(e),
    }
}

/// GET /api/analytics/contacts/recent?limit=N
async fn get_recent_contacts(
    State(state): State<AnalyticsState>,
    Query(params): Query<RecentParams>,
) -> Response {
    let limit = params
        .limit
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .min(MAX_RECENT_LIMIT);
    match state.engine.store().recent_contacts(limit).await {
        Ok(contacts) => Json(json!({ "success": true, "contacts": contacts })).into_response(),
        Err(e) => store_failure(e),
    }
}

/// GET /api/analytics/contacts/search
async fn search_contacts(
    State(state): State<AnalyticsState>,
    Query(params): Query<SearchParams>,
) -> Response {
    let status = match non_empty(params.status) {
        Some(raw) => match raw.parse::<ContactStatus>() {
            Ok(s) => Some(s),
            Err(e) => return failure(StatusCode::BAD_REQUEST, e),
        },
        None => None,
    };
    let filter = ContactFilter {
        query: non_empty(params.query),
        status,
        city: non_empty(params.city),
        specialty: non_empty(params.specialty),
        limit: SEARCH_LIMIT,
    };

    match state.engine.store().search_contacts(&filter).await {
        Ok(contacts) => Json(json!({
            "success": true,
            "count": contacts.len(),
            "contacts": contacts,
        }))
        .into_response(),
        Err(e) => store_failure(e),
    }
}

/// GET /api/analytics/contacts/{address}
///
/// The record plus its 50 most recent interactions, or 404.
async fn get_contact(State(state): State<AnalyticsState>, Path(address): Path<String>) -> Response {
    match queries::contact_detail(state.engine.store().as_ref(), &address).await {
        Ok(Some(detail)) => Json(json!({
            "success": true,
            "contact": detail.contact,
            "interactions": detail.interactions,
        }))
        .into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, format!("No contact {address}")),
        Err(e) => store_failure(e),
    }
}

/// POST /api/contacts/{address}/registered
async fn mark_registered(
    State(state): State<AnalyticsState>,
    Path(address): Path<String>,
) -> Response {
    match state.engine.mark_registered(&address).await {
        Ok(contact) => Json(json!({ "success": true, "contact": contact })).into_response(),
        Err(e) => funnel_failure(e),
    }
}

/// POST /api/contacts/{address}/follow-up
///
/// Sends the contact's next follow-up now, if it is still eligible.
async fn send_follow_up(
    State(state): State<AnalyticsState>,
    Path(address): Path<String>,
) -> Response {
    match state.drip.follow_up_now(&address).await {
        Ok(FollowUpOutcome::Sent(contact)) => {
            Json(json!({ "success": true, "outcome": "sent", "contact": contact })).into_response()
        }
        Ok(FollowUpOutcome::SendFailed) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "success": false, "outcome": "send_failed" })),
        )
            .into_response(),
        Ok(FollowUpOutcome::Skipped) => {
            Json(json!({ "success": false, "outcome": "not_eligible" })).into_response()
        }
        Err(e) => funnel_failure(e),
    }
}

/// Build the analytics and contact-action routes.
pub fn analytics_routes(state: AnalyticsState) -> Router {
    Router::new()
        .route("/api/analytics/dashboard", get(get_dashboard))
        .route("/api/analytics/funnel", get(get_funnel))
        .route("/api/analytics/activity/daily", get(get_daily_activity))
        .route("/api/analytics/contacts/recent", get(get_recent_contacts))
        .route("/api/analytics/contacts/search", get(search_contacts))
        .route("/api/analytics/contacts/{address}", get(get_contact))
        .route("/api/contacts/{address}/registered", post(mark_registered))
        .route("/api/contacts/{address}/follow-up", post(send_follow_up))
        .with_state(state)
}
