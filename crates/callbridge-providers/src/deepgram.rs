//! Deepgram live transcription (WebSocket) and Aura speech synthesis (HTTP).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, trace, warn};

use callbridge_core::error::CallError;
use callbridge_core::types::{AudioFormat, TranscriptEvent};
use callbridge_media::codec::samples_to_pcm16le;

use crate::{
    AudioStream, SpeechToText, SttConnection, SttEvent, TextToSpeech, audio_body, provider_error,
};

pub const DEEPGRAM_LISTEN_URL: &str = "wss://api.deepgram.com";
pub const DEEPGRAM_API_URL: &str = "https://api.deepgram.com";
pub const DEFAULT_STT_MODEL: &str = "nova-3";
pub const DEFAULT_LANGUAGE: &str = "en-US";
pub const DEFAULT_TTS_MODEL: &str = "aura-2-amalthea-en";

const KEEPALIVE: &str = r#"{"type":"KeepAlive"}"#;
const FINALIZE: &str = r#"{"type":"Finalize"}"#;
const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

/// Live recognizer settings.
#[derive(Debug, Clone)]
pub struct DeepgramStt {
    api_key: String,
    pub base_url: String,
    pub model: String,
    pub language: String,
    pub sample_rate: u32,
    pub utterance_end_ms: u64,
    pub keepalive: Duration,
}

impl DeepgramStt {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or(DEEPGRAM_LISTEN_URL)
                .trim_end_matches('/')
                .to_string(),
            model: DEFAULT_STT_MODEL.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            sample_rate: 16_000,
            utterance_end_ms: 2000,
            keepalive: Duration::from_secs(5),
        }
    }

    pub fn listen_url(&self) -> String {
        format!(
            "{}/v1/listen?model={}&language={}&smart_format=true&encoding=linear16&sample_rate={}&channels=1&interim_results=true&utterance_end_ms={}&punctuate=true",
            self.base_url, self.model, self.language, self.sample_rate, self.utterance_end_ms
        )
    }

    async fn open(&self, events: mpsc::Sender<SttEvent>) -> anyhow::Result<DeepgramConnection> {
        let mut request = self.listen_url().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", self.api_key))?,
        );

        let (ws, _response) = connect_async(request).await?;
        info!(model = %self.model, sample_rate = self.sample_rate, "Deepgram live connection open");

        let (mut sink, mut stream) = ws.split();
        let (commands, mut command_rx) = mpsc::channel::<WsCommand>(64);
        let closing = Arc::new(AtomicBool::new(false));

        let keepalive = self.keepalive;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive);
            ticker.tick().await;
            loop {
                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(WsCommand::Audio(bytes)) => {
                            if let Err(e) = sink.send(Message::binary(bytes)).await {
                                debug!(%e, "Deepgram audio send failed");
                                break;
                            }
                            ticker.reset();
                        }
                        Some(WsCommand::Finalize) => {
                            if sink.send(Message::text(FINALIZE)).await.is_err() {
                                break;
                            }
                        }
                        Some(WsCommand::Close) | None => {
                            let _ = sink.send(Message::text(CLOSE_STREAM)).await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        trace!("Deepgram keepalive");
                        if sink.send(Message::text(KEEPALIVE)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let reader_closing = closing.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let event = match parse_listen_message(text.as_str()) {
                            Ok(Some(event)) => SttEvent::Transcript(event),
                            Ok(None) => continue,
                            Err(e) => SttEvent::Error(CallError::provider(
                                "deepgram",
                                format!("Malformed message: {e}"),
                            )),
                        };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Deepgram closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%e, "Deepgram connection error");
                        break;
                    }
                }
            }
            if !reader_closing.load(Ordering::SeqCst) {
                let _ = events.send(SttEvent::Disconnected).await;
            }
        });

        Ok(DeepgramConnection { commands, closing })
    }
}

#[async_trait]
impl SpeechToText for DeepgramStt {
    fn id(&self) -> &str {
        "deepgram"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn connect(
        &self,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Box<dyn SttConnection>, CallError> {
        let connection = self
            .open(events)
            .await
            .map_err(|e| provider_error("deepgram", e))?;
        Ok(Box::new(connection))
    }
}

enum WsCommand {
    Audio(Vec<u8>),
    Finalize,
    Close,
}

pub struct DeepgramConnection {
    commands: mpsc::Sender<WsCommand>,
    closing: Arc<AtomicBool>,
}

impl DeepgramConnection {
    async fn command(&self, command: WsCommand) -> Result<(), CallError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CallError::provider("deepgram", "Connection is closed"))
    }
}

#[async_trait]
impl SttConnection for DeepgramConnection {
    async fn send_audio(&mut self, samples: &[i16]) -> Result<(), CallError> {
        self.command(WsCommand::Audio(samples_to_pcm16le(samples)))
            .await
    }

    async fn finalize(&mut self) -> Result<(), CallError> {
        self.command(WsCommand::Finalize).await
    }

    async fn close(&mut self) -> Result<(), CallError> {
        self.closing.store(true, Ordering::SeqCst);
        // The writer may already be gone if the socket dropped.
        let _ = self.command(WsCommand::Close).await;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ListenMessage {
    Results {
        channel: ResultsChannel,
        #[serde(default)]
        is_final: bool,
    },
    UtteranceEnd {},
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultsChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// Map one live-transcription message to a transcript event.
///
/// Metadata, speech-started, and empty results carry nothing for the caller.
pub fn parse_listen_message(text: &str) -> anyhow::Result<Option<TranscriptEvent>> {
    let message: ListenMessage = serde_json::from_str(text)?;
    Ok(match message {
        ListenMessage::Results { channel, is_final } => {
            let transcript = channel
                .alternatives
                .first()
                .map(|a| a.transcript.trim())
                .unwrap_or_default();
            if transcript.is_empty() {
                None
            } else if is_final {
                Some(TranscriptEvent::Final(transcript.to_string()))
            } else {
                Some(TranscriptEvent::Interim(transcript.to_string()))
            }
        }
        ListenMessage::UtteranceEnd {} => Some(TranscriptEvent::UtteranceBoundary),
        ListenMessage::Other => None,
    })
}

/// Aura speech synthesis, requested as headerless 8 kHz μ-law.
pub struct DeepgramTts {
    client: reqwest::Client,
    pub base_url: String,
    api_key: String,
    pub model: String,
}

impl DeepgramTts {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            client,
            base_url: base_url
                .unwrap_or(DEEPGRAM_API_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            model: DEFAULT_TTS_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: Option<&str>) -> Self {
        if let Some(model) = model {
            self.model = model.to_string();
        }
        self
    }

    pub fn speak_url(&self) -> String {
        format!(
            "{}/v1/speak?model={}&encoding=mulaw&sample_rate=8000&container=none",
            self.base_url, self.model
        )
    }

    async fn request(&self, text: &str) -> anyhow::Result<reqwest::Response> {
        debug!(model = %self.model, text_len = text.len(), "Starting Deepgram speech stream");
        let response = self
            .client
            .post(self.speak_url())
            .header("authorization", format!("Token {}", self.api_key))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Deepgram speak API error {status}: {body}");
        }
        Ok(response)
    }
}

#[async_trait]
impl TextToSpeech for DeepgramTts {
    fn id(&self) -> &str {
        "deepgram"
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::Mulaw8k
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, CallError> {
        let response = self
            .request(text)
            .await
            .map_err(|e| provider_error("deepgram", e))?;
        Ok(audio_body("deepgram", response))
    }
}
