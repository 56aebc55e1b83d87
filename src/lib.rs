//! Funnel Assist: a WhatsApp onboarding funnel for doctors.
//!
//! Inbound webhook events run through a per-contact stage machine; a drip
//! scheduler re-engages contacts who go quiet.

pub mod analytics;
pub mod channels;
pub mod clock;
pub mod config;
pub mod contacts;
pub mod conversations;
pub mod dispatch;
pub mod error;
pub mod funnel;
pub mod store;
pub mod testing;
