//! OpenAI chat completions and speech synthesis.
//!
//! Replies are streamed over SSE from `/v1/chat/completions` and accumulated, so the first
//! tokens arrive while the connection is still warm and a cancelled turn can drop the stream
//! early. Speech comes from `/v1/audio/speech` as raw 24 kHz PCM.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use callbridge_core::error::CallError;
use callbridge_core::types::{AudioFormat, ChatMessage};

use crate::sse::{SseEvent, parse_sse_stream};
use crate::{AudioStream, LanguageModel, TextToSpeech, audio_body, provider_error};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4.1-nano";
pub const DEFAULT_TTS_MODEL: &str = "tts-1";
pub const DEFAULT_TTS_VOICE: &str = "alloy";

/// `response_format: "pcm"` is fixed at 24 kHz.
const OPENAI_PCM_RATE: u32 = 24_000;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<&'a ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiChat {
    client: reqwest::Client,
    pub base_url: String,
    api_key: String,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl OpenAiChat {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            client,
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_model(mut self, model: Option<&str>) -> Self {
        if let Some(model) = model {
            self.model = model.to_string();
        }
        self
    }

    pub fn with_sampling(mut self, max_tokens: Option<u32>, temperature: Option<f64>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn build_body(&self, history: &[ChatMessage], user: &ChatMessage) -> serde_json::Value {
        let mut messages: Vec<&ChatMessage> = history.iter().collect();
        messages.push(user);
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        serde_json::to_value(&request).unwrap_or_default()
    }

    async fn complete(&self, history: &[ChatMessage], user_text: &str) -> anyhow::Result<String> {
        let user = ChatMessage::user(user_text);
        let body = self.build_body(history, &user);

        debug!(model = %self.model, base_url = %self.base_url, messages = history.len() + 1, "Requesting chat completion");

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {body}");
        }

        accumulate_reply(Box::pin(parse_sse_stream(response))).await
    }
}

/// Concatenate the content deltas of a streamed completion.
pub(crate) async fn accumulate_reply<S>(mut events: S) -> anyhow::Result<String>
where
    S: Stream<Item = anyhow::Result<SseEvent>> + Unpin,
{
    let mut reply = String::new();
    while let Some(event) = events.next().await {
        let event = event?;
        let data = event.data.trim();
        if data == "[DONE]" {
            break;
        }
        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                trace!(%e, data, "Skipping unparseable completion chunk");
                continue;
            }
        };
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                reply.push_str(&content);
            }
            if let Some(reason) = choice.finish_reason.as_deref() {
                if reason == "length" {
                    debug!("Completion truncated by max_tokens");
                }
            }
        }
    }
    Ok(reply.trim().to_string())
}

#[async_trait]
impl LanguageModel for OpenAiChat {
    fn id(&self) -> &str {
        "openai"
    }

    async fn generate(
        &self,
        history: &[ChatMessage],
        user_text: &str,
    ) -> Result<String, CallError> {
        self.complete(history, user_text)
            .await
            .map_err(|e| provider_error("openai", e))
    }
}

pub struct OpenAiTts {
    client: reqwest::Client,
    pub base_url: String,
    api_key: String,
    pub model: String,
    pub voice: String,
}

impl OpenAiTts {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            client,
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            model: DEFAULT_TTS_MODEL.to_string(),
            voice: DEFAULT_TTS_VOICE.to_string(),
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

    fn build_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "response_format": "pcm",
        })
    }

    async fn request(&self, text: &str) -> anyhow::Result<reqwest::Response> {
        debug!(model = %self.model, voice = %self.voice, text_len = text.len(), "Starting OpenAI speech stream");
        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&self.build_body(text))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI speech API error {status}: {body}");
        }
        Ok(response)
    }
}

#[async_trait]
impl TextToSpeech for OpenAiTts {
    fn id(&self) -> &str {
        "openai"
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::Pcm16 {
            sample_rate: OPENAI_PCM_RATE,
        }
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, CallError> {
        let response = self
            .request(text)
            .await
            .map_err(|e| provider_error("openai", e))?;
        Ok(audio_body("openai", response))
    }
}
