//! Provider selection by configured name.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use callbridge_core::config::{Config, conventional_key_env};
use callbridge_core::error::CallError;

use crate::deepgram::{DeepgramStt, DeepgramTts};
use crate::elevenlabs::ElevenLabsTts;
use crate::groq::GroqStt;
use crate::openai::{OpenAiChat, OpenAiTts};
use crate::{LanguageModel, SpeechToText, TextToSpeech};

pub const STT_PROVIDERS: &[&str] = &["deepgram", "groq"];
pub const LLM_PROVIDERS: &[&str] = &["openai"];
pub const TTS_PROVIDERS: &[&str] = &["elevenlabs", "deepgram", "openai"];

/// The three collaborators a call needs. Cheap to clone; shared by every call.
#[derive(Clone)]
pub struct ProviderSet {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("stt", &self.stt.id())
            .field("llm", &self.llm.id())
            .field("tts", &self.tts.id())
            .finish()
    }
}

fn unknown(kind: &str, name: &str, available: &[&str]) -> CallError {
    CallError::Config(format!(
        "Unknown {kind} provider '{name}' (available: {})",
        available.join(", ")
    ))
}

fn require_key(kind: &str, provider: &str, key: Option<String>) -> Result<String, CallError> {
    key.ok_or_else(|| {
        let hint = conventional_key_env(provider)
            .map(|env| format!(" (set api_key, api_key_env, or {env})"))
            .unwrap_or_default();
        CallError::Config(format!("No API key for {kind} provider '{provider}'{hint}"))
    })
}

impl ProviderSet {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Self {
        Self { stt, llm, tts }
    }

    /// Build the configured adapters. Every HTTP adapter shares one connection pool.
    pub fn from_config(config: &Config) -> Result<Self, CallError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CallError::Config(format!("HTTP client: {e}")))?;
        Self::from_config_with_client(config, client)
    }

    pub fn from_config_with_client(
        config: &Config,
        client: reqwest::Client,
    ) -> Result<Self, CallError> {
        let stt = Self::build_stt(config, &client)?;
        let llm = Self::build_llm(config, &client)?;
        let tts = Self::build_tts(config, &client)?;
        info!(stt = stt.id(), llm = llm.id(), tts = tts.id(), "Providers configured");
        Ok(Self { stt, llm, tts })
    }

    fn build_stt(
        config: &Config,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn SpeechToText>, CallError> {
        let cfg = config.stt();
        let name = cfg.provider.as_str();
        if !STT_PROVIDERS.contains(&name) {
            return Err(unknown("speech-to-text", name, STT_PROVIDERS));
        }
        let key = require_key("speech-to-text", name, cfg.resolve_api_key())?;

        Ok(match name {
            "groq" => {
                let mut stt = GroqStt::new(client.clone(), key, cfg.base_url.as_deref());
                if let Some(model) = &cfg.model {
                    stt.model = model.clone();
                }
                stt.language = cfg.language.clone();
                stt.sample_rate = cfg.sample_rate;
                stt.batch_seconds = cfg.batch_seconds;
                Arc::new(stt)
            }
            _ => {
                let mut stt = DeepgramStt::new(key, cfg.base_url.as_deref());
                if let Some(model) = &cfg.model {
                    stt.model = model.clone();
                }
                if let Some(language) = &cfg.language {
                    stt.language = language.clone();
                }
                stt.sample_rate = cfg.sample_rate;
                stt.utterance_end_ms = cfg.utterance_end_ms;
                stt.keepalive = Duration::from_secs(cfg.keepalive_secs.max(1));
                Arc::new(stt)
            }
        })
    }

    fn build_llm(
        config: &Config,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn LanguageModel>, CallError> {
        let cfg = config.llm();
        let name = cfg.provider.as_str();
        if !LLM_PROVIDERS.contains(&name) {
            return Err(unknown("language model", name, LLM_PROVIDERS));
        }
        let key = require_key("language model", name, cfg.resolve_api_key())?;
        let chat = OpenAiChat::new(client.clone(), key, cfg.base_url.as_deref())
            .with_model(cfg.model.as_deref())
            .with_sampling(cfg.max_tokens, cfg.temperature);
        Ok(Arc::new(chat))
    }

    fn build_tts(
        config: &Config,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn TextToSpeech>, CallError> {
        let cfg = config.tts();
        let name = cfg.provider.as_str();
        if !TTS_PROVIDERS.contains(&name) {
            return Err(unknown("speech synthesis", name, TTS_PROVIDERS));
        }
        let key = require_key("speech synthesis", name, cfg.resolve_api_key())?;
        let base_url = cfg.base_url.as_deref();
        let model = cfg.model.as_deref();
        let voice = cfg.voice.as_deref();

        Ok(match name {
            "deepgram" => Arc::new(
                DeepgramTts::new(client.clone(), key, base_url).with_model(voice.or(model)),
            ),
            "openai" => Arc::new(OpenAiTts::new(client.clone(), key, base_url).with_voice(model, voice)),
            _ => Arc::new(ElevenLabsTts::new(client.clone(), key, base_url).with_voice(model, voice)),
        })
    }
}
