//! Dispatch: applies events and ticks to stored contacts and sends the
//! resulting messages.

pub mod deferred;
pub mod drip;
pub mod engine;
pub mod locks;

pub use deferred::{DeferredQueue, spawn_deferred_loop};
pub use drip::{DripScheduler, FollowUpOutcome, TickReport, spawn_drip_ticker};
pub use engine::{DispatchEngine, HandledEvent};
pub use locks::ContactLocks;
