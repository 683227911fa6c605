use std::time::Duration;

use callbridge_core::config::{Config, DEFAULT_INSTRUCTIONS};
use callbridge_core::error::CallError;
use callbridge_core::types::TELEPHONY_FRAME_BYTES;

/// Per-call behaviour, derived once from [`Config`] and cloned into each session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub inbound_buffer_frames: usize,
    pub frame_bytes: usize,
    pub pacing: bool,
    pub playback_lead: Duration,
    pub finalize_on_punctuation: bool,
    pub greeting: Option<String>,
    /// System prompt, always the first history entry.
    pub instructions: String,
    /// 0 keeps the whole conversation.
    pub max_history_messages: usize,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    /// Deadline for each recognizer connection attempt.
    pub connect_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            inbound_buffer_frames: 5,
            frame_bytes: TELEPHONY_FRAME_BYTES,
            pacing: true,
            playback_lead: Duration::from_millis(100),
            finalize_on_punctuation: true,
            greeting: None,
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            max_history_messages: 40,
            max_reconnect_attempts: 3,
            reconnect_backoff: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Result<Self, CallError> {
        let audio = config.audio();
        let stt = config.stt();
        let session = config.session();
        let instructions = config.llm().resolve_instructions()?;

        Ok(Self {
            inbound_buffer_frames: audio.inbound_buffer_frames.max(1),
            frame_bytes: audio.frame_bytes.max(1),
            pacing: audio.pacing,
            playback_lead: Duration::from_millis(audio.playback_lead_ms),
            finalize_on_punctuation: session.finalize_on_punctuation,
            greeting: session.greeting.filter(|g| !g.trim().is_empty()),
            instructions,
            max_history_messages: session.max_history_messages,
            max_reconnect_attempts: stt.max_reconnect_attempts,
            reconnect_backoff: Duration::from_millis(stt.reconnect_backoff_ms),
            connect_timeout: Duration::from_millis(stt.connect_timeout_ms.max(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_core::config::{AudioConfig, SessionConfig};

    #[test]
    fn test_from_default_config() {
        let settings = SessionSettings::from_config(&Config::default()).unwrap();
        assert_eq!(settings.inbound_buffer_frames, 5);
        assert_eq!(settings.frame_bytes, 160);
        assert_eq!(settings.playback_lead, Duration::from_millis(100));
        assert_eq!(settings.max_reconnect_attempts, 3);
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
        assert!(settings.greeting.is_none());
        assert_eq!(settings.instructions, DEFAULT_INSTRUCTIONS);
    }

    #[test]
    fn test_overrides() {
        let config = Config {
            audio: Some(AudioConfig {
                pacing: false,
                inbound_buffer_frames: 0,
                ..AudioConfig::default()
            }),
            session: Some(SessionConfig {
                greeting: Some("Hi, how can I help?".into()),
                finalize_on_punctuation: false,
                max_history_messages: 10,
            }),
            ..Config::default()
        };
        let settings = SessionSettings::from_config(&config).unwrap();
        assert!(!settings.pacing);
        assert_eq!(settings.inbound_buffer_frames, 1);
        assert_eq!(settings.greeting.as_deref(), Some("Hi, how can I help?"));
        assert!(!settings.finalize_on_punctuation);
        assert_eq!(settings.max_history_messages, 10);
    }

    #[test]
    fn test_blank_greeting_is_none() {
        let config = Config {
            session: Some(SessionConfig {
                greeting: Some("   ".into()),
                ..SessionConfig::default()
            }),
            ..Config::default()
        };
        assert!(SessionSettings::from_config(&config).unwrap().greeting.is_none());
    }
}
