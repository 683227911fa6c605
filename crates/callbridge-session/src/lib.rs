//! Call session orchestration.
//!
//! A [`CallSession`] owns one telephony stream. It feeds caller audio to speech recognition,
//! turns finalized utterances into generated replies, and plays synthesized speech back while
//! watching for the caller to interrupt.

pub mod events;
pub mod orchestrator;
pub mod sender;
pub mod settings;
pub mod turn;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use events::{CallEvent, CallState};
pub use orchestrator::CallSession;
pub use settings::SessionSettings;
pub use turn::TurnGate;
