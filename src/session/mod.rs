//! Conversation session: per-view state and the coordinator that owns it.

pub mod coordinator;
pub mod state;

pub use coordinator::SessionCoordinator;
pub use state::SessionState;
