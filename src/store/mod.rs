//! Persistence layer: libSQL-backed storage for contacts, history and transcripts.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ActivityRow, ContactFilter, ContactGrouping, CountRow, Database, EngagementCounts,
    FollowUpRecord, FunnelCounts,
};
