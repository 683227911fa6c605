//! Telephony media-stream wire protocol (Twilio Media Streams).
//!
//! The call leg exchanges JSON text frames over a WebSocket. Inbound frames are
//! tagged by `event`: `connected`, `start`, `media`, `mark`, `dtmf`, `stop`.
//! Outbound commands are `media`, `mark` and `clear`, each addressed by `streamSid`.
//!
//! The session never sees JSON: the gateway turns frames into [`TransportEvent`]s
//! and [`TransportCommand`]s back into [`OutboundMessage`]s.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::types::OutboundChunk;

/// A frame received from the telephony leg.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundMessage {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
    Start {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        start: StartMeta,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    Media {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        media: MediaPayload,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    Mark {
        mark: MarkPayload,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    Dtmf {
        dtmf: DtmfPayload,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    Stop {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartMeta {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    #[serde(rename = "callSid", default)]
    pub call_sid: Option<String>,
    #[serde(rename = "accountSid", default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(rename = "mediaFormat", default)]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaFormat {
    pub encoding: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

fn default_channels() -> u16 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Base64-encoded μ-law bytes.
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DtmfPayload {
    pub digit: String,
    #[serde(default)]
    pub track: Option<String>,
}

/// A command sent to the telephony leg.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMessage {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

/// Call-leg event as seen by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Start {
        stream_sid: String,
        call_sid: Option<String>,
    },
    /// Base64 payload, decoded by the session so codec failures stay per-frame.
    Media { payload: String },
    Mark { name: String },
    Dtmf { digit: String },
    Stop,
}

/// Command produced by the session for the call leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Media(OutboundChunk),
    /// Discard any audio already queued on the far end.
    Clear,
    Mark { name: String },
}

impl InboundMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, CallError> {
        serde_json::from_str(text).map_err(|e| CallError::Protocol(format!("Invalid frame: {e}")))
    }

    /// Map to the session-facing event. `connected` and unknown frames have no counterpart.
    pub fn into_transport_event(self) -> Option<TransportEvent> {
        match self {
            Self::Start { start, stream_sid, .. } => Some(TransportEvent::Start {
                stream_sid: stream_sid.unwrap_or(start.stream_sid),
                call_sid: start.call_sid,
            }),
            Self::Media { media, .. } => Some(TransportEvent::Media {
                payload: media.payload,
            }),
            Self::Mark { mark, .. } => Some(TransportEvent::Mark { name: mark.name }),
            Self::Dtmf { dtmf, .. } => Some(TransportEvent::Dtmf { digit: dtmf.digit }),
            Self::Stop { .. } => Some(TransportEvent::Stop),
            Self::Connected { .. } | Self::Unknown => None,
        }
    }
}

impl OutboundMessage {
    pub fn from_command(stream_sid: &str, command: &TransportCommand) -> Self {
        let stream_sid = stream_sid.to_string();
        match command {
            TransportCommand::Media(chunk) => Self::Media {
                stream_sid,
                media: MediaPayload {
                    track: None,
                    timestamp: None,
                    payload: encode_media_payload(&chunk.payload),
                },
            },
            TransportCommand::Mark { name } => Self::Mark {
                stream_sid,
                mark: MarkPayload { name: name.clone() },
            },
            TransportCommand::Clear => Self::Clear { stream_sid },
        }
    }
}

/// Decode a base64 media payload into raw telephony bytes.
pub fn decode_media_payload(payload: &str) -> Result<Vec<u8>, CallError> {
    STANDARD
        .decode(payload)
        .map_err(|e| CallError::Codec(format!("Malformed media payload: {e}")))
}

pub fn encode_media_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
