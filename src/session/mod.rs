//! Call session
//!
//! The orchestrator walks the user through landing, onboarding, lobby,
//! searching and chat, driving the signaling transport and the
//! negotiation engine along the way.

mod orchestrator;
mod state;

pub use orchestrator::{Orchestrator, SessionHandle};
pub use state::{session_matches, SessionPhase, SessionState, SessionView};
