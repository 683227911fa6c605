//! Observable call activity, published on a broadcast channel.

use serde::Serialize;

use callbridge_core::types::TurnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No stream yet, or the stream has ended.
    Idle,
    Listening,
    /// Waiting for the reply text.
    Thinking,
    /// Reply audio is being played.
    Speaking,
}

impl CallState {
    pub fn is_streaming(self) -> bool {
        self != Self::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    StateChanged {
        state: CallState,
    },
    /// Interim recognition, for live captions.
    Caption {
        text: String,
    },
    UserUtterance {
        turn: TurnId,
        text: String,
    },
    AssistantReply {
        turn: TurnId,
        text: String,
        /// Time from the utterance to the reply text. Zero for the greeting.
        latency_ms: u64,
    },
    BargeIn {
        abandoned_turn: TurnId,
        new_turn: TurnId,
    },
    /// A recoverable failure that degraded a turn or dropped a frame.
    Error {
        kind: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(CallEvent::StateChanged {
            state: CallState::Speaking,
        })
        .unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["state"], "speaking");

        let json = serde_json::to_value(CallEvent::BargeIn {
            abandoned_turn: 1,
            new_turn: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "barge_in");
        assert_eq!(json["new_turn"], 2);
    }

    #[test]
    fn test_streaming_states() {
        assert!(!CallState::Idle.is_streaming());
        assert!(CallState::Listening.is_streaming());
        assert!(CallState::Speaking.is_streaming());
    }
}
