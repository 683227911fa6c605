//! Groq Whisper batch transcription behind the live recognizer interface.
//!
//! Audio is buffered for `batch_seconds`, wrapped in WAV, and uploaded. Every batch that
//! transcribes to text yields a `Final` fragment followed by an `UtteranceBoundary`, since
//! a batch recognizer has no other way to signal the end of speech.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use callbridge_core::error::CallError;
use callbridge_core::types::TranscriptEvent;
use callbridge_media::codec::rms;
use callbridge_media::wav::{duration_ms, pcm_to_wav};

use crate::{SpeechToText, SttConnection, SttEvent, provider_error};

pub const GROQ_TRANSCRIPTION_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
pub const DEFAULT_MODEL: &str = "whisper-large-v3-turbo";

/// Batches quieter than this are not uploaded. Whisper tends to invent text for silence.
const SILENCE_RMS: f64 = 200.0;

#[derive(Debug, Clone)]
pub struct GroqStt {
    client: reqwest::Client,
    api_key: String,
    pub url: String,
    pub model: String,
    pub language: Option<String>,
    pub sample_rate: u32,
    pub batch_seconds: u32,
}

impl GroqStt {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            url: base_url
                .map(|u| format!("{}/openai/v1/audio/transcriptions", u.trim_end_matches('/')))
                .unwrap_or_else(|| GROQ_TRANSCRIPTION_URL.to_string()),
            model: DEFAULT_MODEL.to_string(),
            language: None,
            sample_rate: 16_000,
            batch_seconds: 3,
        }
    }

    fn batch_samples(&self) -> usize {
        (self.sample_rate as usize * self.batch_seconds.max(1) as usize).max(1)
    }

    /// Whisper expects an ISO-639-1 code ("en"), not a locale ("en-US").
    fn whisper_language(&self) -> Option<String> {
        self.language
            .as_deref()
            .and_then(|l| l.split(['-', '_']).next())
            .filter(|l| !l.is_empty())
            .map(str::to_lowercase)
    }

    /// Upload one batch and return the transcript text.
    pub async fn transcribe(&self, pcm: &[i16]) -> anyhow::Result<String> {
        let wav = pcm_to_wav(pcm, self.sample_rate);
        debug!(
            model = %self.model,
            audio_ms = duration_ms(pcm.len(), self.sample_rate),
            wav_bytes = wav.len(),
            "Sending audio for transcription"
        );

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);
        if let Some(language) = self.whisper_language() {
            form = form.text("language", language);
        }

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Transcription API error {status}: {body}");
        }

        let text = resp.text().await?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl SpeechToText for GroqStt {
    fn id(&self) -> &str {
        "groq"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn connect(
        &self,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Box<dyn SttConnection>, CallError> {
        let (batches, mut batch_rx) = mpsc::channel::<Vec<i16>>(8);
        let stt = Arc::new(self.clone());

        // One worker per connection keeps transcripts in upload order.
        tokio::spawn(async move {
            while let Some(batch) = batch_rx.recv().await {
                if rms(&batch) < SILENCE_RMS {
                    debug!(samples = batch.len(), "Skipping silent batch");
                    continue;
                }
                let result = stt.transcribe(&batch).await;
                let sent = match result {
                    Ok(text) if text.is_empty() => true,
                    Ok(text) => {
                        events
                            .send(SttEvent::Transcript(TranscriptEvent::Final(text)))
                            .await
                            .is_ok()
                            && events
                                .send(SttEvent::Transcript(TranscriptEvent::UtteranceBoundary))
                                .await
                                .is_ok()
                    }
                    Err(e) => {
                        warn!(error = %e, "Batch transcription failed");
                        events
                            .send(SttEvent::Error(provider_error("groq", e)))
                            .await
                            .is_ok()
                    }
                };
                if !sent {
                    break;
                }
            }
        });

        Ok(Box::new(GroqConnection {
            buffer: Vec::new(),
            batch_samples: self.batch_samples(),
            batches: Some(batches),
        }))
    }
}

pub struct GroqConnection {
    buffer: Vec<i16>,
    batch_samples: usize,
    batches: Option<mpsc::Sender<Vec<i16>>>,
}

impl GroqConnection {
    async fn submit(&mut self) -> Result<(), CallError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        let Some(batches) = &self.batches else {
            return Err(CallError::provider("groq", "Connection is closed"));
        };
        batches
            .send(batch)
            .await
            .map_err(|_| CallError::provider("groq", "Transcription worker stopped"))
    }
}

#[async_trait]
impl SttConnection for GroqConnection {
    async fn send_audio(&mut self, samples: &[i16]) -> Result<(), CallError> {
        self.buffer.extend_from_slice(samples);
        if self.buffer.len() >= self.batch_samples {
            self.submit().await?;
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), CallError> {
        self.submit().await
    }

    async fn close(&mut self) -> Result<(), CallError> {
        self.buffer.clear();
        self.batches = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groq() -> GroqStt {
        GroqStt::new(reqwest::Client::new(), "gsk-test", None)
    }

    #[test]
    fn test_defaults() {
        let stt = groq();
        assert_eq!(stt.id(), "groq");
        assert!(stt.url.contains("groq.com"));
        assert_eq!(stt.model, DEFAULT_MODEL);
        assert_eq!(stt.batch_samples(), 48_000);
    }

    #[test]
    fn test_custom_base_url() {
        let stt = GroqStt::new(reqwest::Client::new(), "gsk-test", Some("http://localhost:8000/"));
        assert_eq!(stt.url, "http://localhost:8000/openai/v1/audio/transcriptions");
    }

    #[test]
    fn test_whisper_language() {
        let mut stt = groq();
        assert_eq!(stt.whisper_language(), None);
        stt.language = Some("en-US".into());
        assert_eq!(stt.whisper_language().as_deref(), Some("en"));
        stt.language = Some("DE".into());
        assert_eq!(stt.whisper_language().as_deref(), Some("de"));
    }

    #[tokio::test]
    async fn test_silent_audio_produces_no_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut stt = groq();
        stt.batch_seconds = 1;
        let mut conn = stt.connect(tx).await.unwrap();
        conn.send_audio(&vec![0i16; 16_000]).await.unwrap();
        conn.finalize().await.unwrap();
        conn.close().await.unwrap();
        drop(conn);
        // The worker exits once the batch sender is gone, closing the event channel.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_is_error() {
        let (tx, _rx) = mpsc::channel(8);
        let mut conn = groq().connect(tx).await.unwrap();
        conn.close().await.unwrap();
        conn.send_audio(&[1, 2, 3]).await.unwrap();
        assert!(conn.finalize().await.is_err());
    }
}
