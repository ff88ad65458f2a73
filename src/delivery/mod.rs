//! Reply delivery: the streamed path and the polling fallback.
//!
//! Both paths write the same per-conversation processing flag. Clearing an
//! already-clear flag is a no-op.

pub mod poller;
pub mod stream;

pub use poller::{CompletionPoller, pending_reply_baseline};
pub use stream::{INTERRUPTED_MARKER, ResponseStream, StreamState, describe_error};
