//! REST endpoints over the conversation transcript.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;

use super::model::MessageSearch;
use crate::dispatch::DispatchEngine;
use crate::error::DatabaseError;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;
const DEFAULT_MESSAGE_WINDOW: usize = 100;
const MAX_MESSAGE_WINDOW: usize = 500;
const SEARCH_LIMIT: usize = 50;

#[derive(Clone)]
pub struct ConversationState {
    pub engine: Arc<DispatchEngine>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    search: Option<String>,
    page: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct WindowParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    q: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
}

fn failure(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.to_string() })),
    )
        .into_response()
}

fn store_failure(e: DatabaseError) -> Response {
    tracing::error!(error = %e, "Conversation query failed");
    failure(StatusCode::INTERNAL_SERVER_ERROR, e)
}

/// Accepts RFC 3339 or a bare `YYYY-MM-DD` (start of day, UTC).
fn parse_bound(raw: Option<String>, end_of_day: bool) -> Result<Option<DateTime<Utc>>, String> {
    let Some(raw) = raw.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    let date = NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| format!("Invalid date '{raw}'"))?;
    let start = date.and_hms_opt(0, 0, 0).map(|d| d.and_utc());
    Ok(if end_of_day {
        start.map(|s| s + Duration::days(1) - Duration::milliseconds(1))
    } else {
        start
    })
}

/// GET /api/conversations?search=&page=&limit=
async fn list_conversations(
    State(state): State<ConversationState>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = params
        .limit
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(MAX_PAGE_SIZE);
    let page = params.page.filter(|p| *p > 0).unwrap_or(1);
    let offset = (page - 1).saturating_mul(limit);
    let search = params.search.as_deref();
    let store = state.engine.store();

    let total = match store.count_conversations(search).await {
        Ok(total) => total,
        Err(e) => return store_failure(e),
    };
    match store.list_conversations(search, limit, offset).await {
        Ok(conversations) => Json(json!({
            "success": true,
            "conversations": conversations,
            "pagination": {
                "total": total,
                "page": page,
                "limit": limit,
                "pages": (total as usize).div_ceil(limit),
            },
        }))
        .into_response(),
        Err(e) => store_failure(e),
    }
}

/// GET /api/conversations/{address}?limit=N
///
/// The summary, the contact record and the latest messages, or 404.
async fn get_conversation(
    State(state): State<ConversationState>,
    Path(address): Path<String>,
    Query(params): Query<WindowParams>,
) -> Response {
    let store = state.engine.store();
    let window = params
        .limit
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_MESSAGE_WINDOW)
        .min(MAX_MESSAGE_WINDOW);

    let summary = match store.get_conversation(&address).await {
        Ok(Some(summary)) => summary,
        Ok(None) => return failure(StatusCode::NOT_FOUND, format!("No conversation with {address}")),
        Err(e) => return store_failure(e),
    };
    let contact = match store.get_contact(&address).await {
        Ok(contact) => contact,
        Err(e) => return store_failure(e),
    };
    match store.list_messages(&address, window).await {
        Ok(messages) => Json(json!({
            "success": true,
            "conversation": summary,
            "contact": contact,
            "messages": messages,
        }))
        .into_response(),
        Err(e) => store_failure(e),
    }
}

/// GET /api/conversations/stats/overview
async fn get_stats(State(state): State<ConversationState>) -> Response {
    let since = state.engine.now() - Duration::hours(24);
    match state.engine.store().conversation_stats(since).await {
        Ok(stats) => Json(json!({ "success": true, "stats": stats })).into_response(),
        Err(e) => store_failure(e),
    }
}

/// GET /api/conversations/search/query?q=&date_from=&date_to=
async fn search_conversations(
    State(state): State<ConversationState>,
    Query(params): Query<SearchParams>,
) -> Response {
    let from = match parse_bound(params.date_from, false) {
        Ok(from) => from,
        Err(e) => return failure(StatusCode::BAD_REQUEST, e),
    };
    let to = match parse_bound(params.date_to, true) {
        Ok(to) => to,
        Err(e) => return failure(StatusCode::BAD_REQUEST, e),
    };
    let filter = MessageSearch {
        text: params.q,
        from,
        to,
        limit: SEARCH_LIMIT,
    };

    match state.engine.store().search_conversations(&filter).await {
        Ok(conversations) => Json(json!({
            "success": true,
            "count": conversations.len(),
            "conversations": conversations,
        }))
        .into_response(),
        Err(e) => store_failure(e),
    }
}

pub fn conversation_routes(state: ConversationState) -> Router {
    Router::new()
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/stats/overview", get(get_stats))
        .route("/api/conversations/search/query", get(search_conversations))
        .route("/api/conversations/{address}", get(get_conversation))
        .with_state(state)
}
