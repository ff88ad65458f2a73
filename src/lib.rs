//! Chat Relay: delivery core for an AI chat view.

pub mod backend;
pub mod compose;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod model;
pub mod session;

#[cfg(test)]
mod testing;
