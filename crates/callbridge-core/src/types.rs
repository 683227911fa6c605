use serde::{Deserialize, Serialize};

/// Sample rate of the telephony leg (G.711 μ-law).
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// Bytes per telephony tick: 20 ms of 8 kHz μ-law.
pub const TELEPHONY_FRAME_BYTES: usize = 160;

/// Duration of one telephony tick in milliseconds.
pub const TELEPHONY_TICK_MS: u64 = 20;

/// μ-law encoding of a zero PCM sample.
pub const MULAW_SILENCE: u8 = 0xFF;

/// Monotonic per-session turn counter.
pub type TurnId = u64;

/// Encoding tag carried by inbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    Mulaw,
    Linear16,
}

/// Format of an audio byte stream produced by a speech provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioFormat {
    /// 8 kHz μ-law, already telephony-ready.
    Mulaw8k,
    /// Raw 16-bit little-endian mono PCM.
    Pcm16 { sample_rate: u32 },
}

/// One telephony tick as received from the call leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub payload: Vec<u8>,
    pub encoding: AudioEncoding,
    /// Gap-free position within the session.
    pub sequence: u64,
}

impl InboundFrame {
    pub fn mulaw(payload: Vec<u8>, sequence: u64) -> Self {
        Self {
            payload,
            encoding: AudioEncoding::Mulaw,
            sequence,
        }
    }
}

/// Incremental output of a speech-to-text provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Unstable hypothesis, for live captions only.
    Interim(String),
    /// Finalized fragment of the current utterance.
    Final(String),
    /// Provider detected trailing silence after speech.
    UtteranceBoundary,
}

/// Fixed-size telephony frame bound for the call leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundChunk {
    pub turn_id: TurnId,
    /// Playback position within the turn.
    pub index: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the conversation history handed to text generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}
