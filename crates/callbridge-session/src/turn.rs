use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use callbridge_core::types::TurnId;

/// Shared view of the session's current turn.
///
/// Only the orchestrator advances it. Background tasks and the outbound sender read it to decide
/// whether their work still matters, so a cancelled turn can never reach the caller even if its
/// task finishes after the cancellation was issued.
#[derive(Debug, Clone, Default)]
pub struct TurnGate {
    current: Arc<AtomicU64>,
}

impl TurnGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new turn and return its id. Every older turn becomes stale.
    pub fn advance(&self) -> TurnId {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> TurnId {
        self.current.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, turn: TurnId) -> bool {
        turn == self.current()
    }
}
