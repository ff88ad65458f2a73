//! Backend collaborator: trait plus the HTTP implementation.

pub mod http;
pub mod traits;

pub use http::HttpBackend;
pub use traits::{ChatBackend, EventSource};
