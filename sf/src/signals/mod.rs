//! Inbound signal handling
//!
//! Signals are persisted per instance, deduplicated by id and delivered with
//! critical signals (cancel, escalate) ahead of everything else.

mod bus;

pub use bus::{SignalBus, SignalOutcome};
