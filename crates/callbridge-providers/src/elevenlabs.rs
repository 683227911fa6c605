//! ElevenLabs streaming speech synthesis.
//!
//! Requests `ulaw_8000` output so the audio can go to the telephony leg without transcoding.

use async_trait::async_trait;
use tracing::debug;

use callbridge_core::error::CallError;
use callbridge_core::types::AudioFormat;

use crate::{AudioStream, TextToSpeech, audio_body, provider_error};

pub const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";
/// "Rachel".
pub const DEFAULT_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";
pub const DEFAULT_MODEL: &str = "eleven_multilingual_v2";
const OUTPUT_FORMAT: &str = "ulaw_8000";

pub struct ElevenLabsTts {
    client: reqwest::Client,
    pub base_url: String,
    api_key: String,
    pub voice: String,
    pub model: String,
}

impl ElevenLabsTts {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            client,
            base_url: base_url
                .unwrap_or(ELEVENLABS_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            voice: DEFAULT_VOICE.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_voice(mut self, model: Option<&str>, voice: Option<&str>) -> Self {
        if let Some(model) = model {
            self.model = model.to_string();
        }
        if let Some(voice) = voice {
            self.voice = voice.to_string();
        }
        self
    }

    /// Streaming endpoint for the configured voice.
    pub fn stream_url(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream?output_format={OUTPUT_FORMAT}",
            self.base_url, self.voice
        )
    }

    fn build_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "text": text,
            "model_id": self.model,
        })
    }

    async fn request(&self, text: &str) -> anyhow::Result<reqwest::Response> {
        debug!(voice = %self.voice, model = %self.model, text_len = text.len(), "Starting ElevenLabs stream");

        let response = self
            .client
            .post(self.stream_url())
            .header("xi-api-key", &self.api_key)
            .header("accept", "audio/basic")
            .json(&self.build_body(text))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ElevenLabs API error {status}: {body}");
        }
        Ok(response)
    }
}

#[async_trait]
impl TextToSpeech for ElevenLabsTts {
    fn id(&self) -> &str {
        "elevenlabs"
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::Mulaw8k
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, CallError> {
        let response = self
            .request(text)
            .await
            .map_err(|e| provider_error("elevenlabs", e))?;
        Ok(audio_body("elevenlabs", response))
    }
}
