//! Per-contact conversation transcripts and their read-only routes.

pub mod model;
pub mod routes;

pub use model::{
    ConversationStats, ConversationSummary, DeliveryStatus, Direction, MessageSearch,
    TranscriptMessage,
};
pub use routes::{ConversationState, conversation_routes};
