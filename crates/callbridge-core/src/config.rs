//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CallError;

/// Top-level callbridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<SttConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address (default `0.0.0.0`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    8080
}

/// Telephony audio framing and playback pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Frames accumulated before a chunk goes to speech recognition (5 frames ≈ 100 ms).
    #[serde(default = "default_inbound_buffer_frames")]
    pub inbound_buffer_frames: usize,

    /// Bytes per outbound telephony chunk (160 = 20 ms of 8 kHz μ-law).
    #[serde(default = "default_frame_bytes")]
    pub frame_bytes: usize,

    /// Release outbound chunks at real-time rate instead of as fast as they arrive.
    #[serde(default = "default_true")]
    pub pacing: bool,

    /// Audio sent ahead of the real-time position when pacing.
    #[serde(default = "default_playback_lead_ms")]
    pub playback_lead_ms: u64,
}

fn default_inbound_buffer_frames() -> usize {
    5
}

fn default_frame_bytes() -> usize {
    160
}

fn default_playback_lead_ms() -> u64 {
    100
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            inbound_buffer_frames: default_inbound_buffer_frames(),
            frame_bytes: default_frame_bytes(),
            pacing: true,
            playback_lead_ms: default_playback_lead_ms(),
        }
    }
}

/// Speech-to-text provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// "deepgram" (default) or "groq".
    #[serde(default = "default_stt_provider")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Linear PCM rate sent to the recognizer.
    #[serde(default = "default_stt_sample_rate")]
    pub sample_rate: u32,
    /// Trailing silence that ends an utterance.
    #[serde(default = "default_utterance_end_ms")]
    pub utterance_end_ms: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    /// Deadline for a single connection attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Seconds of audio per upload for batch recognizers.
    #[serde(default = "default_batch_seconds")]
    pub batch_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_stt_provider() -> String {
    "deepgram".into()
}

fn default_stt_sample_rate() -> u32 {
    16_000
}

fn default_utterance_end_ms() -> u64 {
    2000
}

fn default_keepalive_secs() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_backoff_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_batch_seconds() -> u32 {
    3
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: default_stt_provider(),
            api_key: None,
            api_key_env: None,
            model: None,
            language: None,
            sample_rate: default_stt_sample_rate(),
            utterance_end_ms: default_utterance_end_ms(),
            keepalive_secs: default_keepalive_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            batch_seconds: default_batch_seconds(),
            base_url: None,
        }
    }
}

impl SttConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_provider_key(&self.provider, &self.api_key, &self.api_key_env)
    }
}

/// Text-generation provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// System prompt text. Takes priority over `instructions_path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions_path: Option<String>,
}

fn default_llm_provider() -> String {
    "openai".into()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            model: None,
            max_tokens: None,
            temperature: None,
            instructions: None,
            instructions_path: None,
        }
    }
}

pub const DEFAULT_INSTRUCTIONS: &str = "You are a friendly voice assistant talking to a caller on the phone. \
Answer in one to three short spoken sentences. Do not use markdown, lists, or emoji.";

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_provider_key(&self.provider, &self.api_key, &self.api_key_env)
    }

    /// System prompt: inline text, then the instructions file, then the built-in default.
    pub fn resolve_instructions(&self) -> crate::error::Result<String> {
        if let Some(text) = self.instructions.as_ref().filter(|t| !t.trim().is_empty()) {
            return Ok(text.clone());
        }
        if let Some(path) = &self.instructions_path {
            let text = std::fs::read_to_string(path).map_err(|e| {
                CallError::Config(format!("Cannot read instructions file {path}: {e}"))
            })?;
            return Ok(text.trim().to_string());
        }
        Ok(DEFAULT_INSTRUCTIONS.to_string())
    }
}

/// Speech-synthesis provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// "elevenlabs" (default), "deepgram", or "openai".
    #[serde(default = "default_tts_provider")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_tts_provider() -> String {
    "elevenlabs".into()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_key: None,
            api_key_env: None,
            voice: None,
            model: None,
            base_url: None,
        }
    }
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_provider_key(&self.provider, &self.api_key, &self.api_key_env)
    }
}

/// Conversation behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Spoken as soon as the call stream starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,

    /// Finalize an utterance as soon as a fragment ends with `.`, `!` or `?`.
    #[serde(default = "default_true")]
    pub finalize_on_punctuation: bool,

    /// History entries kept besides the system prompt (0 = unlimited).
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
}

fn default_max_history_messages() -> usize {
    40
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            greeting: None,
            finalize_on_punctuation: true,
            max_history_messages: default_max_history_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "callbridge_session=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Environment variable a vendor's SDKs read by convention.
pub fn conventional_key_env(provider: &str) -> Option<&'static str> {
    match provider {
        "deepgram" => Some("DEEPGRAM_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "elevenlabs" => Some("ELEVENLABS_API_KEY"),
        _ => None,
    }
}

fn resolve_provider_key(
    provider: &str,
    direct: &Option<String>,
    env_var: &Option<String>,
) -> Option<String> {
    resolve_secret_field(direct, env_var).or_else(|| {
        let fallback = conventional_key_env(provider).map(str::to_string);
        resolve_secret_field(&None, &fallback)
    })
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;

        let substituted = substitute_env_vars(&raw);

        let config: Config =
            json5::from_str(&substituted).map_err(|e| CallError::Config(e.to_string()))?;

        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(8080)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn audio(&self) -> AudioConfig {
        self.audio.clone().unwrap_or_default()
    }

    pub fn stt(&self) -> SttConfig {
        self.stt.clone().unwrap_or_default()
    }

    pub fn llm(&self) -> LlmConfig {
        self.llm.clone().unwrap_or_default()
    }

    pub fn tts(&self) -> TtsConfig {
        self.tts.clone().unwrap_or_default()
    }

    pub fn session(&self) -> SessionConfig {
        self.session.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let stt = self.stt();
        if stt.resolve_api_key().is_none() {
            warnings.push(format!(
                "Speech-to-text provider '{}' has no API key configured",
                stt.provider
            ));
        }
        if stt.sample_rate == 0 {
            errors.push("stt.sample_rate cannot be 0".to_string());
        }
        if stt.connect_timeout_ms == 0 {
            errors.push("stt.connect_timeout_ms cannot be 0".to_string());
        }

        let llm = self.llm();
        if llm.resolve_api_key().is_none() {
            warnings.push(format!(
                "Language model provider '{}' has no API key configured",
                llm.provider
            ));
        }
        if let Some(path) = &llm.instructions_path {
            if llm.instructions.is_none() && !Path::new(path).exists() {
                errors.push(format!("Instructions file not found: {path}"));
            }
        }
        if let Some(t) = llm.temperature {
            if !(0.0..=2.0).contains(&t) {
                warnings.push(format!("llm.temperature {t} is outside 0.0..=2.0"));
            }
        }

        let tts = self.tts();
        if tts.resolve_api_key().is_none() {
            warnings.push(format!(
                "Speech synthesis provider '{}' has no API key configured",
                tts.provider
            ));
        }

        let audio = self.audio();
        if audio.inbound_buffer_frames == 0 {
            errors.push("audio.inbound_buffer_frames cannot be 0".to_string());
        }
        if audio.frame_bytes == 0 {
            errors.push("audio.frame_bytes cannot be 0".to_string());
        } else if audio.frame_bytes % 8 != 0 {
            warnings.push(format!(
                "audio.frame_bytes {} is not a whole number of milliseconds at 8 kHz",
                audio.frame_bytes
            ));
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for callbridge data: `~/.callbridge/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".callbridge")
}
