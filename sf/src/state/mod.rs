//! State management
//!
//! The StateManager actor owns the session store; everything else talks to
//! it through a cloneable handle.

mod manager;
mod messages;
mod recovery;

pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse};
pub use recovery::{RecoveryStats, scan_for_recovery};
