//! paircall - random one-to-one video chat client
//!
//! This crate provides the session engine of a P2P call client: a
//! self-healing signaling link to a matchmaking relay, WebRTC offer/answer
//! negotiation, and the orchestrator that ties both to the user's session.

pub mod config;
pub mod error;
pub mod events;
pub mod negotiation;
pub mod session;
pub mod signaling;
pub mod utils;

#[cfg(test)]
mod testing;

pub use error::{AppError, Result};
