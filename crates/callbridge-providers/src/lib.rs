//! Speech and language provider abstraction.
//!
//! A call needs three capabilities: live speech recognition ([`SpeechToText`]), reply
//! generation ([`LanguageModel`]) and speech synthesis ([`TextToSpeech`]). Each vendor adapter
//! implements one of these traits, and [`ProviderSet::from_config`] picks the adapters by name.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use callbridge_core::error::CallError;
use callbridge_core::types::{AudioFormat, ChatMessage, TranscriptEvent};

pub mod deepgram;
pub mod elevenlabs;
pub mod factory;
pub mod groq;
pub mod openai;
pub mod sse;

pub use factory::ProviderSet;

/// Synthesized audio, in the provider's [`AudioFormat`]. Dropping it cancels the synthesis.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Bytes, CallError>> + Send>>;

/// Message pushed from a recognizer connection onto the session's queue.
#[derive(Debug)]
pub enum SttEvent {
    Transcript(TranscriptEvent),
    /// The recognizer reported a problem but the connection is still usable.
    Error(CallError),
    /// The connection ended without being closed by us.
    Disconnected,
}

/// Factory for live recognizer connections.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Provider identifier (e.g., "deepgram", "groq").
    fn id(&self) -> &str;

    /// Linear PCM rate expected by [`SttConnection::send_audio`].
    fn sample_rate(&self) -> u32;

    /// Open a connection. Transcript events are delivered on `events` in order.
    async fn connect(
        &self,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Box<dyn SttConnection>, CallError>;
}

/// One open recognizer session, owned by a single call.
#[async_trait]
pub trait SttConnection: Send {
    async fn send_audio(&mut self, samples: &[i16]) -> Result<(), CallError>;

    /// Ask the recognizer to flush whatever it has heard so far.
    async fn finalize(&mut self) -> Result<(), CallError>;

    async fn close(&mut self) -> Result<(), CallError>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn id(&self) -> &str;

    /// Generate the assistant's reply to `user_text` given the prior conversation.
    ///
    /// `history` starts with the system prompt. Dropping the future cancels the request.
    async fn generate(&self, history: &[ChatMessage], user_text: &str)
    -> Result<String, CallError>;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn id(&self) -> &str;

    fn output_format(&self) -> AudioFormat;

    /// Start synthesizing `text`. Resolves once the provider accepted the request.
    async fn synthesize(&self, text: &str) -> Result<AudioStream, CallError>;
}

/// Map vendor glue failures onto the provider error kind.
pub(crate) fn provider_error(provider: &str, err: anyhow::Error) -> CallError {
    CallError::provider(provider, format!("{err:#}"))
}

/// Turn a streamed HTTP body into an [`AudioStream`].
pub(crate) fn audio_body(provider: &'static str, response: reqwest::Response) -> AudioStream {
    use futures::StreamExt;

    Box::pin(response.bytes_stream().map(move |chunk| {
        chunk.map_err(|e| CallError::provider(provider, format!("Audio stream error: {e}")))
    }))
}
