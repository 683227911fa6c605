//! Scripted providers for driving a [`CallSession`](crate::CallSession) in tests.
//!
//! [`ScriptedStt`] hands out connections controlled through an [`SttController`], so a test can
//! "speak" into the session. [`MockLlm`] and [`MockTts`] record what they were asked for.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use callbridge_core::error::CallError;
use callbridge_core::types::{AudioFormat, ChatMessage, TELEPHONY_FRAME_BYTES, TranscriptEvent};
use callbridge_providers::{
    AudioStream, LanguageModel, ProviderSet, SpeechToText, SttConnection, SttEvent, TextToSpeech,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct SttScript {
    events: Option<mpsc::Sender<SttEvent>>,
    connects: u32,
    failing_connects: u32,
    hanging_connects: u32,
    samples: usize,
    finalizes: u32,
    closes: u32,
}

/// Recognizer whose transcripts come from the test.
pub struct ScriptedStt {
    script: Arc<Mutex<SttScript>>,
    sample_rate: u32,
}

/// Test-side handle to a [`ScriptedStt`].
#[derive(Clone)]
pub struct SttController {
    script: Arc<Mutex<SttScript>>,
}

impl ScriptedStt {
    pub fn new() -> (Self, SttController) {
        let script = Arc::new(Mutex::new(SttScript::default()));
        let stt = Self {
            script: script.clone(),
            sample_rate: 16_000,
        };
        (stt, SttController { script })
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    fn id(&self) -> &str {
        "scripted"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn connect(
        &self,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Box<dyn SttConnection>, CallError> {
        {
            let mut script = lock(&self.script);
            script.connects += 1;
            if script.hanging_connects == 0 {
                if script.failing_connects > 0 {
                    script.failing_connects -= 1;
                    return Err(CallError::provider("scripted", "connection refused"));
                }
                script.events = Some(events);
                return Ok(Box::new(ScriptedConnection {
                    script: self.script.clone(),
                }));
            }
            script.hanging_connects -= 1;
        }
        // An unreachable vendor: the attempt never completes on its own.
        std::future::pending::<Result<Box<dyn SttConnection>, CallError>>().await
    }
}

struct ScriptedConnection {
    script: Arc<Mutex<SttScript>>,
}

#[async_trait]
impl SttConnection for ScriptedConnection {
    async fn send_audio(&mut self, samples: &[i16]) -> Result<(), CallError> {
        lock(&self.script).samples += samples.len();
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), CallError> {
        lock(&self.script).finalizes += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CallError> {
        let mut script = lock(&self.script);
        script.closes += 1;
        script.events = None;
        Ok(())
    }
}

impl SttController {
    /// Deliver an event on the most recent connection. False if none is open.
    pub async fn emit(&self, event: SttEvent) -> bool {
        let events = lock(&self.script).events.clone();
        match events {
            Some(events) => events.send(event).await.is_ok(),
            None => false,
        }
    }

    /// A complete utterance: one final fragment and an utterance boundary.
    pub async fn say(&self, text: &str) -> bool {
        self.emit(SttEvent::Transcript(TranscriptEvent::Final(text.to_string())))
            .await
            && self
                .emit(SttEvent::Transcript(TranscriptEvent::UtteranceBoundary))
                .await
    }

    pub async fn interim(&self, text: &str) -> bool {
        self.emit(SttEvent::Transcript(TranscriptEvent::Interim(text.to_string())))
            .await
    }

    /// Simulate the vendor dropping the connection.
    pub async fn disconnect(&self) -> bool {
        let events = lock(&self.script).events.take();
        match events {
            Some(events) => events.send(SttEvent::Disconnected).await.is_ok(),
            None => false,
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        lock(&self.script).failing_connects = n;
    }

    /// Let the next `n` connection attempts hang forever.
    pub fn hang_next_connects(&self, n: u32) {
        lock(&self.script).hanging_connects = n;
    }

    pub fn connects(&self) -> u32 {
        lock(&self.script).connects
    }

    pub fn samples_received(&self) -> usize {
        lock(&self.script).samples
    }

    pub fn finalizes(&self) -> u32 {
        lock(&self.script).finalizes
    }

    pub fn closes(&self) -> u32 {
        lock(&self.script).closes
    }
}

#[derive(Default)]
struct LlmScript {
    replies: VecDeque<Result<String, String>>,
    calls: Vec<(Vec<ChatMessage>, String)>,
}

/// Language model with queued replies. Falls back to echoing the caller.
#[derive(Clone, Default)]
pub struct MockLlm {
    script: Arc<Mutex<LlmScript>>,
    delay: Option<Duration>,
}

impl MockLlm {
    pub fn echo() -> Self {
        Self::default()
    }

    /// Queue replies; `Err` entries fail that generation with a provider error.
    pub fn with_replies(replies: Vec<Result<&str, &str>>) -> Self {
        let llm = Self::default();
        lock(&llm.script).replies = replies
            .into_iter()
            .map(|r| r.map(str::to_string).map_err(str::to_string))
            .collect();
        llm
    }

    /// Make every generation take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every request so far, as (history, user text).
    pub fn calls(&self) -> Vec<(Vec<ChatMessage>, String)> {
        lock(&self.script).calls.clone()
    }

    pub fn echo_reply(text: &str) -> String {
        format!("You said: {text}")
    }
}

#[async_trait]
impl LanguageModel for MockLlm {
    fn id(&self) -> &str {
        "mock"
    }

    async fn generate(
        &self,
        history: &[ChatMessage],
        user_text: &str,
    ) -> Result<String, CallError> {
        let reply = {
            let mut script = lock(&self.script);
            script.calls.push((history.to_vec(), user_text.to_string()));
            script.replies.pop_front()
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match reply {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(CallError::provider("mock", message)),
            None => Ok(Self::echo_reply(user_text)),
        }
    }
}

/// Synthesizer producing a fixed number of telephony frames per request.
#[derive(Clone)]
pub struct MockTts {
    frames: usize,
    fail: bool,
    frame_delay: Option<Duration>,
    texts: Arc<Mutex<Vec<String>>>,
}

impl MockTts {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            fail: false,
            frame_delay: None,
            texts: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0)
        }
    }

    /// Release frames no faster than one per `delay`.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    /// Texts synthesized so far.
    pub fn texts(&self) -> Vec<String> {
        lock(&self.texts).clone()
    }
}

#[async_trait]
impl TextToSpeech for MockTts {
    fn id(&self) -> &str {
        "mock"
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::Mulaw8k
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, CallError> {
        lock(&self.texts).push(text.to_string());
        if self.fail {
            return Err(CallError::provider("mock", "synthesis unavailable"));
        }
        let delay = self.frame_delay;
        let frames = futures::stream::iter(0..self.frames).then(move |i| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            // Non-silent bytes so padding is distinguishable.
            Ok(Bytes::from(vec![(i % 0x7F) as u8; TELEPHONY_FRAME_BYTES]))
        });
        Ok(Box::pin(frames))
    }
}

/// A [`ProviderSet`] built from scripted parts.
pub fn provider_set(stt: ScriptedStt, llm: MockLlm, tts: MockTts) -> ProviderSet {
    ProviderSet::new(Arc::new(stt), Arc::new(llm), Arc::new(tts))
}
