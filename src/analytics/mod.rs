//! Read-only reporting over the funnel, plus operator actions.

pub mod queries;
pub mod routes;

pub use routes::{AnalyticsState, analytics_routes};
