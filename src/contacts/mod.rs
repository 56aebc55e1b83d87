//! Contact records and the conversation stage graph.
//!
//! A contact is created on the first inbound message from an unseen address
//! and is only ever mutated by the stage machine (inbound events) and the
//! drip scheduler (ticks). Contacts are never deleted.

pub mod model;
pub mod stage;

pub use model::{Contact, ContactStatus, EngagementFlags, Lifecycle, Profile, Referral};
pub use stage::{Stage, Track};
