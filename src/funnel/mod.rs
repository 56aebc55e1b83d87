//! The pure funnel core: what to say next, and when to follow up.
//!
//! Nothing in here touches the network. The stage machine and the drip
//! planner turn snapshots into [`command::ScheduledCommand`]s and
//! [`command::InteractionFact`]s; `dispatch` executes them. Referral
//! issuance is the one exception that reaches the store, since a code must
//! be reserved before it is announced.

pub mod command;
pub mod content;
pub mod event;
pub mod followup;
pub mod machine;
pub mod referral;

pub use command::{InteractionFact, InteractionKind, OutboundCommand, ScheduledCommand};
pub use content::ContentCatalog;
pub use event::{EventPayload, InboundEvent};
pub use followup::{FollowUpKind, FollowUpStep};
pub use machine::{Transition, TransitionContext, transition};
