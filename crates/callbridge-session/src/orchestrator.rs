//! The per-call state machine.
//!
//! [`CallSession::run`] drives one telephony stream to completion. Every input (transport events,
//! recognizer events, finished background work) arrives on an ordered channel and is handled one
//! at a time, so the session state never needs a lock. Recognizer connection, generation and
//! playback run as separate tasks that report back through the same loop. Generation and playback
//! are abandoned by cancelling their token and advancing the [`TurnGate`].

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use callbridge_core::error::CallError;
use callbridge_core::protocol::{TransportCommand, TransportEvent, decode_media_payload};
use callbridge_core::types::{ChatMessage, InboundFrame, TurnId};
use callbridge_media::{
    AggregatorOutput, FrameBuffer, ReadyChunk, UtteranceAggregator, outbound_chunks,
    telephony_to_linear,
};
use callbridge_providers::{ProviderSet, SpeechToText, SttConnection, SttEvent, TextToSpeech};

use crate::events::{CallEvent, CallState};
use crate::sender::{Outbound, Pacer, Sender, turn_mark};
use crate::settings::SessionSettings;
use crate::turn::TurnGate;

const EVENT_CAPACITY: usize = 256;
const STT_EVENT_CAPACITY: usize = 64;
const INTERNAL_CAPACITY: usize = 16;
const OUTBOUND_CAPACITY: usize = 64;

/// One telephony call, from `start` to `stop`.
pub struct CallSession {
    settings: SessionSettings,
    providers: ProviderSet,
    events: broadcast::Sender<CallEvent>,
}

/// Results of background work, delivered to the session loop.
enum Internal {
    Generated {
        turn: TurnId,
        result: Result<String, CallError>,
    },
    PlaybackFailed {
        turn: TurnId,
        error: CallError,
    },
    /// A recognizer connection, or the error that ended the retries.
    Recognizer(Result<Box<dyn SttConnection>, CallError>),
}

/// Whether the session loop should keep going.
enum Flow {
    Continue,
    Stop,
}

struct Generation {
    turn: TurnId,
    user_text: String,
    started: Instant,
    cancel: CancellationToken,
}

impl CallSession {
    pub fn new(settings: SessionSettings, providers: ProviderSet) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            providers,
            events,
        }
    }

    /// Observe the call. Subscribe before [`run`](Self::run) to see every event.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Run the call until the transport stops it.
    ///
    /// Returns `Ok` on a `stop` event. A closed transport, or a recognizer that cannot be
    /// reconnected, ends the call with [`CallError::Transport`].
    pub async fn run(
        self,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        transport_tx: mpsc::Sender<TransportCommand>,
    ) -> Result<(), CallError> {
        let (stt_tx, mut stt_rx) = mpsc::channel(STT_EVENT_CAPACITY);
        let (internal_tx, mut internal_rx) = mpsc::channel(INTERNAL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let gate = TurnGate::new();
        let pacer = self
            .settings
            .pacing
            .then(|| Pacer::new(self.settings.playback_lead));
        let sender = tokio::spawn(
            Sender {
                queue: outbound_rx,
                gate: gate.clone(),
                transport: transport_tx.clone(),
                pacer,
            }
            .run(),
        );

        let mut core = Core {
            frames: FrameBuffer::new(self.settings.inbound_buffer_frames),
            aggregator: UtteranceAggregator::new(self.settings.finalize_on_punctuation),
            settings: self.settings,
            providers: self.providers,
            events: self.events,
            state: CallState::Idle,
            stream_sid: None,
            gate,
            next_sequence: 0,
            history: Vec::new(),
            stt: None,
            connecting: None,
            stt_tx,
            internal_tx,
            outbound_tx: Some(outbound_tx),
            generation: None,
            playback: None,
            cancel: CancellationToken::new(),
        };

        let outcome = loop {
            let step = tokio::select! {
                event = transport_rx.recv() => match event {
                    Some(event) => core.on_transport_event(event).await,
                    None => Err(CallError::Transport("Telephony stream closed without stop".into())),
                },
                _ = transport_tx.closed() => {
                    Err(CallError::Transport("Telephony stream stopped accepting audio".into()))
                }
                Some(event) = stt_rx.recv() => {
                    core.on_stt_event(event).await;
                    Ok(Flow::Continue)
                }
                Some(message) = internal_rx.recv() => core.on_internal(message),
            };
            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &outcome {
            warn!(stream_sid = core.sid(), error = %e, "Call ended abnormally");
        }
        core.shutdown().await;
        drop(transport_tx);
        if let Err(e) = sender.await {
            warn!(error = %e, "Outbound sender task failed");
        }
        outcome
    }
}

/// Mutable session state, owned by the loop in [`CallSession::run`].
struct Core {
    settings: SessionSettings,
    providers: ProviderSet,
    events: broadcast::Sender<CallEvent>,
    state: CallState,
    stream_sid: Option<String>,
    gate: TurnGate,
    frames: FrameBuffer,
    next_sequence: u64,
    aggregator: UtteranceAggregator,
    /// Conversation so far, without the system prompt.
    history: Vec<ChatMessage>,
    stt: Option<Box<dyn SttConnection>>,
    /// Set while a connection task is running.
    connecting: Option<CancellationToken>,
    stt_tx: mpsc::Sender<SttEvent>,
    internal_tx: mpsc::Sender<Internal>,
    outbound_tx: Option<mpsc::Sender<Outbound>>,
    generation: Option<Generation>,
    playback: Option<CancellationToken>,
    /// Parent of every task token.
    cancel: CancellationToken,
}

impl Core {
    fn sid(&self) -> &str {
        self.stream_sid.as_deref().unwrap_or("-")
    }

    fn publish(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn report(&self, error: &CallError) {
        self.publish(CallEvent::Error {
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }

    fn set_state(&mut self, state: CallState) {
        if self.state == state {
            return;
        }
        debug!(stream_sid = self.sid(), from = ?self.state, to = ?state, "State change");
        self.state = state;
        self.publish(CallEvent::StateChanged { state });
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Result<Flow, CallError> {
        match event {
            TransportEvent::Start {
                stream_sid,
                call_sid,
            } => {
                if self.stream_sid.is_some() {
                    warn!(stream_sid = self.sid(), "Duplicate start ignored");
                    return Ok(Flow::Continue);
                }
                info!(
                    stream_sid = %stream_sid,
                    call_sid = call_sid.as_deref().unwrap_or("-"),
                    "Stream started"
                );
                self.stream_sid = Some(stream_sid);
                self.spawn_connect();
            }
            TransportEvent::Media { payload } => self.on_media(&payload).await,
            TransportEvent::Mark { name } => self.on_mark(&name),
            TransportEvent::Dtmf { digit } => {
                info!(stream_sid = self.sid(), digit = %digit, "DTMF received");
            }
            TransportEvent::Stop => {
                info!(stream_sid = self.sid(), "Stream stopped");
                if let Some(chunk) = self.frames.flush() {
                    self.forward_audio(chunk).await;
                }
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Open the recognizer in the background. The loop keeps serving the call meanwhile.
    fn spawn_connect(&mut self) {
        if self.connecting.is_some() {
            return;
        }
        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let connector = Connector {
            stt: self.providers.stt.clone(),
            events: self.stt_tx.clone(),
            call_events: self.events.clone(),
            stream_sid: self.sid().to_string(),
            attempts: self.settings.max_reconnect_attempts.saturating_add(1),
            backoff: self.settings.reconnect_backoff,
            timeout: self.settings.connect_timeout,
        };
        let internal = self.internal_tx.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = connector.connect() => result,
            };
            if let Err(mpsc::error::SendError(Internal::Recognizer(Ok(mut connection)))) =
                internal.send(Internal::Recognizer(result)).await
            {
                debug!("Call ended while connecting, closing recognizer");
                if let Err(e) = connection.close().await {
                    debug!(error = %e, "Recognizer close failed");
                }
            }
        });

        self.connecting = Some(cancel);
    }

    fn on_recognizer(
        &mut self,
        result: Result<Box<dyn SttConnection>, CallError>,
    ) -> Result<Flow, CallError> {
        self.connecting = None;
        self.stt = Some(result?);
        if !self.state.is_streaming() {
            // First connection of the call.
            self.set_state(CallState::Listening);
            if let Some(greeting) = self.settings.greeting.clone() {
                self.greet(greeting);
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_media(&mut self, payload: &str) {
        if self.stream_sid.is_none() {
            let e = CallError::Protocol("media before start".into());
            warn!(error = %e, "Ignoring frame");
            return;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let pushed = decode_media_payload(payload)
            .and_then(|bytes| self.frames.push(InboundFrame::mulaw(bytes, sequence)));
        match pushed {
            Ok(Some(chunk)) => self.forward_audio(chunk).await,
            Ok(None) => {}
            Err(e) => {
                warn!(stream_sid = self.sid(), sequence, error = %e, "Dropping inbound frame");
                self.report(&e);
                if let Err(e) = self.frames.mark_dropped(sequence) {
                    warn!(stream_sid = self.sid(), error = %e, "Frame position out of step");
                }
            }
        }
    }

    async fn forward_audio(&mut self, chunk: ReadyChunk) {
        let rate = self.providers.stt.sample_rate();
        let Some(stt) = self.stt.as_mut() else {
            debug!(frames = chunk.frames, "No recognizer connection, audio discarded");
            return;
        };
        let samples = telephony_to_linear(&chunk.payload, rate);
        let mut result = stt.send_audio(&samples).await;
        if result.is_ok() && chunk.end_of_stream {
            result = stt.finalize().await;
        }
        if let Err(e) = result {
            warn!(stream_sid = self.sid(), error = %e, "Failed to send audio to recognizer");
            self.report(&e);
        }
    }

    /// The far end has played everything queued before mark `name`.
    fn on_mark(&mut self, name: &str) {
        let turn = self.gate.current();
        if self.state != CallState::Speaking || name != turn_mark(turn) {
            debug!(stream_sid = self.sid(), mark = %name, "Ignoring mark");
            return;
        }
        debug!(stream_sid = self.sid(), turn, "Reply played out");
        self.playback = None;
        self.set_state(CallState::Listening);
    }

    async fn on_stt_event(&mut self, event: SttEvent) {
        match event {
            SttEvent::Transcript(event) => match self.aggregator.on_transcript_event(event) {
                Some(AggregatorOutput::Caption(text)) => self.publish(CallEvent::Caption { text }),
                Some(AggregatorOutput::Finalized(text)) => self.on_utterance(text).await,
                None => {}
            },
            SttEvent::Error(e) => {
                warn!(stream_sid = self.sid(), error = %e, "Speech recognition error");
                self.report(&e);
            }
            SttEvent::Disconnected => {
                if self.stream_sid.is_none() || self.connecting.is_some() {
                    return;
                }
                warn!(stream_sid = self.sid(), "Speech recognition disconnected, reconnecting");
                self.stt = None;
                self.spawn_connect();
            }
        }
    }

    async fn on_utterance(&mut self, text: String) {
        let barge_in = match self.state {
            CallState::Idle => {
                debug!("Utterance outside a stream ignored");
                return;
            }
            CallState::Listening => false,
            CallState::Thinking => {
                if let Some(generation) = self.generation.take() {
                    generation.cancel.cancel();
                    debug!(
                        stream_sid = self.sid(),
                        turn = generation.turn,
                        "Superseding in-flight generation"
                    );
                    self.history.push(ChatMessage::user(generation.user_text));
                }
                false
            }
            CallState::Speaking => true,
        };

        let abandoned = self.gate.current();
        let turn = self.gate.advance();
        if barge_in {
            if let Some(playback) = self.playback.take() {
                playback.cancel();
            }
            if let Some(outbound) = &self.outbound_tx {
                if outbound.send(Outbound::Clear).await.is_err() {
                    debug!(stream_sid = self.sid(), "Outbound queue closed, clear not sent");
                }
            }
            info!(stream_sid = self.sid(), abandoned, turn, "Barge-in");
            self.publish(CallEvent::BargeIn {
                abandoned_turn: abandoned,
                new_turn: turn,
            });
        }

        info!(stream_sid = self.sid(), turn, text = %text, "Caller utterance");
        self.publish(CallEvent::UserUtterance {
            turn,
            text: text.clone(),
        });
        self.set_state(CallState::Thinking);
        self.spawn_generation(turn, text);
    }

    /// System prompt followed by the most recent history.
    fn prompt_history(&self) -> Vec<ChatMessage> {
        let keep = match self.settings.max_history_messages {
            0 => self.history.len(),
            n => n.min(self.history.len()),
        };
        let mut messages = Vec::with_capacity(keep + 1);
        messages.push(ChatMessage::system(self.settings.instructions.clone()));
        messages.extend_from_slice(&self.history[self.history.len() - keep..]);
        messages
    }

    fn spawn_generation(&mut self, turn: TurnId, user_text: String) {
        let cancel = self.cancel.child_token();
        let llm = self.providers.llm.clone();
        let history = self.prompt_history();
        let internal = self.internal_tx.clone();
        let token = cancel.clone();
        let text = user_text.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = llm.generate(&history, &text) => result,
            };
            if internal.send(Internal::Generated { turn, result }).await.is_err() {
                debug!(turn, "Call ended, reply discarded");
            }
        });

        self.generation = Some(Generation {
            turn,
            user_text,
            started: Instant::now(),
            cancel,
        });
    }

    fn on_internal(&mut self, message: Internal) -> Result<Flow, CallError> {
        match message {
            Internal::Generated { turn, result } => self.on_generated(turn, result),
            Internal::PlaybackFailed { turn, error } => {
                if self.gate.is_current(turn) {
                    warn!(stream_sid = self.sid(), turn, error = %error, "Reply playback failed");
                    self.report(&error);
                    self.playback = None;
                    if self.state == CallState::Speaking {
                        self.set_state(CallState::Listening);
                    }
                }
            }
            Internal::Recognizer(result) => return self.on_recognizer(result),
        }
        Ok(Flow::Continue)
    }

    fn on_generated(&mut self, turn: TurnId, result: Result<String, CallError>) {
        let current = self.gate.is_current(turn) && self.state == CallState::Thinking;
        let Some(generation) = self.generation.take_if(|g| current && g.turn == turn) else {
            debug!(stream_sid = self.sid(), turn, "Discarding stale reply");
            return;
        };

        let latency_ms = generation.started.elapsed().as_millis() as u64;
        self.history.push(ChatMessage::user(generation.user_text));
        match result {
            Ok(reply) if !reply.trim().is_empty() => {
                let reply = reply.trim().to_string();
                info!(stream_sid = self.sid(), turn, latency_ms, "Reply generated");
                self.history.push(ChatMessage::assistant(reply.clone()));
                self.publish(CallEvent::AssistantReply {
                    turn,
                    text: reply.clone(),
                    latency_ms,
                });
                self.begin_playback(turn, reply);
            }
            Ok(_) => {
                debug!(stream_sid = self.sid(), turn, "Empty reply, nothing to say");
                self.set_state(CallState::Listening);
            }
            Err(e) => {
                warn!(stream_sid = self.sid(), turn, error = %e, "Reply generation failed");
                self.report(&e);
                self.set_state(CallState::Listening);
            }
        }
    }

    /// Speak the configured greeting as its own turn, without asking the model.
    fn greet(&mut self, greeting: String) {
        let turn = self.gate.advance();
        self.history.push(ChatMessage::assistant(greeting.clone()));
        self.publish(CallEvent::AssistantReply {
            turn,
            text: greeting.clone(),
            latency_ms: 0,
        });
        self.begin_playback(turn, greeting);
    }

    fn begin_playback(&mut self, turn: TurnId, text: String) {
        let Some(outbound) = self.outbound_tx.clone() else {
            return;
        };
        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let tts = self.providers.tts.clone();
        let gate = self.gate.clone();
        let internal = self.internal_tx.clone();
        let chunk_bytes = self.settings.frame_bytes;

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => return,
                outcome = play_reply(tts.as_ref(), &text, turn, chunk_bytes, &gate, &outbound) => outcome,
            };
            if let Err(error) = outcome {
                if internal.send(Internal::PlaybackFailed { turn, error }).await.is_err() {
                    debug!(turn, "Call ended, playback failure discarded");
                }
            }
        });

        self.playback = Some(cancel);
        self.set_state(CallState::Speaking);
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.connecting = None;
        self.generation = None;
        self.playback = None;
        // Anything still queued for the caller is now stale.
        self.gate.advance();
        self.outbound_tx = None;
        if let Some(mut stt) = self.stt.take() {
            if let Err(e) = stt.close().await {
                debug!(error = %e, "Recognizer close failed");
            }
        }
        if self.frames.dropped() > 0 {
            debug!(stream_sid = self.sid(), dropped = self.frames.dropped(), "Inbound frames dropped");
        }
        self.set_state(CallState::Idle);
    }
}

/// Recognizer connection attempts with a per-attempt deadline and linear backoff.
struct Connector {
    stt: Arc<dyn SpeechToText>,
    events: mpsc::Sender<SttEvent>,
    call_events: broadcast::Sender<CallEvent>,
    stream_sid: String,
    attempts: u32,
    backoff: Duration,
    timeout: Duration,
}

impl Connector {
    async fn connect(self) -> Result<Box<dyn SttConnection>, CallError> {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            let outcome =
                match tokio::time::timeout(self.timeout, self.stt.connect(self.events.clone())).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(CallError::provider(
                        self.stt.id(),
                        format!("Connection attempt timed out after {} ms", self.timeout.as_millis()),
                    )),
                };
            match outcome {
                Ok(connection) => {
                    debug!(
                        stream_sid = %self.stream_sid,
                        provider = self.stt.id(),
                        attempt,
                        "Speech recognition connected"
                    );
                    return Ok(connection);
                }
                Err(e) => {
                    warn!(stream_sid = %self.stream_sid, attempt, error = %e, "Speech recognition connect failed");
                    let _ = self.call_events.send(CallEvent::Error {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
            }
        }
        Err(CallError::Transport(format!(
            "Speech recognition unavailable after {} attempts: {}",
            self.attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

/// Synthesize `text` and queue its chunks, stopping as soon as `turn` is stale.
async fn play_reply(
    tts: &dyn TextToSpeech,
    text: &str,
    turn: TurnId,
    chunk_bytes: usize,
    gate: &TurnGate,
    outbound: &mpsc::Sender<Outbound>,
) -> Result<(), CallError> {
    let audio = tts.synthesize(text).await?;
    let mut chunks = Box::pin(outbound_chunks(audio, tts.output_format(), turn, chunk_bytes));
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if !gate.is_current(turn) || outbound.send(Outbound::Audio(chunk)).await.is_err() {
            return Ok(());
        }
    }
    if gate.is_current(turn) && outbound.send(Outbound::EndOfTurn(turn)).await.is_err() {
        debug!(turn, "Outbound queue closed, end of turn not queued");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::task::JoinHandle;

    use super::*;
    use crate::testing::{MockLlm, MockTts, ScriptedStt, SttController, provider_set};
    use callbridge_core::protocol::encode_media_payload;
    use callbridge_core::types::Role;

    const WAIT: Duration = Duration::from_secs(30);

    struct Call {
        transport: mpsc::Sender<TransportEvent>,
        commands: mpsc::Receiver<TransportCommand>,
        events: broadcast::Receiver<CallEvent>,
        stt: SttController,
        run: JoinHandle<Result<(), CallError>>,
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            pacing: false,
            instructions: "Be brief.".into(),
            ..SessionSettings::default()
        }
    }

    fn launch(settings: SessionSettings, llm: MockLlm, tts: MockTts) -> Call {
        let (stt, controller) = ScriptedStt::new();
        let session = CallSession::new(settings, provider_set(stt, llm, tts));
        let events = session.subscribe();
        let (transport, transport_rx) = mpsc::channel(64);
        let (commands_tx, commands) = mpsc::channel(1024);
        let run = tokio::spawn(session.run(transport_rx, commands_tx));
        Call {
            transport,
            commands,
            events,
            stt: controller,
            run,
        }
    }

    impl Call {
        async fn send(&self, event: TransportEvent) {
            self.transport.send(event).await.unwrap();
        }

        async fn start(&mut self) {
            self.send(TransportEvent::Start {
                stream_sid: "MZ00".into(),
                call_sid: Some("CA00".into()),
            })
            .await;
            self.wait_for_state(CallState::Listening).await;
        }

        /// Next event matching `pred`, skipping the rest.
        async fn wait_for(&mut self, pred: impl Fn(&CallEvent) -> bool) -> CallEvent {
            tokio::time::timeout(WAIT, async {
                loop {
                    match self.events.recv().await {
                        Ok(event) if pred(&event) => return event,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => panic!("session ended"),
                    }
                }
            })
            .await
            .expect("timed out waiting for event")
        }

        async fn wait_for_state(&mut self, state: CallState) {
            self.wait_for(|e| *e == CallEvent::StateChanged { state }).await;
        }

        /// Commands up to and including the mark for `turn`.
        async fn commands_until_mark(&mut self, turn: TurnId) -> Vec<TransportCommand> {
            let mark = TransportCommand::Mark {
                name: format!("turn-{turn}"),
            };
            let mut seen = Vec::new();
            tokio::time::timeout(WAIT, async {
                while let Some(command) = self.commands.recv().await {
                    let done = command == mark;
                    seen.push(command);
                    if done {
                        return;
                    }
                }
                panic!("transport closed before {mark:?}");
            })
            .await
            .expect("timed out waiting for mark");
            seen
        }

        /// Play turn `turn` out: collect its commands, then echo its mark like the far end does.
        async fn play_out(&mut self, turn: TurnId) -> Vec<TransportCommand> {
            let commands = self.commands_until_mark(turn).await;
            self.send(TransportEvent::Mark {
                name: turn_mark(turn),
            })
            .await;
            commands
        }

        async fn stop(self) -> Result<(), CallError> {
            self.send(TransportEvent::Stop).await;
            self.run.await.unwrap()
        }
    }

    fn media_turns(commands: &[TransportCommand]) -> Vec<TurnId> {
        commands
            .iter()
            .filter_map(|c| match c {
                TransportCommand::Media(chunk) => Some(chunk.turn_id),
                _ => None,
            })
            .collect()
    }

    fn silence_frame() -> TransportEvent {
        TransportEvent::Media {
            payload: encode_media_payload(&[0xFF; 160]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_utterance_produces_reply_audio() {
        let llm = MockLlm::echo();
        let mut call = launch(settings(), llm.clone(), MockTts::new(4));
        call.start().await;

        assert!(call.stt.interim("What time").await);
        let caption = call.wait_for(|e| matches!(e, CallEvent::Caption { .. })).await;
        assert_eq!(
            caption,
            CallEvent::Caption {
                text: "What time".into()
            }
        );

        assert!(call.stt.say("What time is it?").await);
        let reply = call
            .wait_for(|e| matches!(e, CallEvent::AssistantReply { .. }))
            .await;
        assert!(matches!(
            reply,
            CallEvent::AssistantReply { turn: 1, ref text, .. } if *text == MockLlm::echo_reply("What time is it?")
        ));

        let commands = call.play_out(1).await;
        assert_eq!(media_turns(&commands), vec![1; 4]);
        call.wait_for_state(CallState::Listening).await;

        let calls = llm.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.len(), 1);
        assert_eq!(calls[0].0[0].role, Role::System);
        assert_eq!(calls[0].1, "What time is it?");

        assert!(call.stop().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_carries_previous_turns() {
        let llm = MockLlm::with_replies(vec![Ok("Noon."), Ok("Tuesday.")]);
        let mut call = launch(settings(), llm.clone(), MockTts::new(1));
        call.start().await;

        call.stt.say("What time is it?").await;
        call.play_out(1).await;
        call.wait_for_state(CallState::Listening).await;
        call.stt.say("And the day?").await;
        call.commands_until_mark(2).await;

        let calls = llm.calls();
        let history: Vec<_> = calls[1].0.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(history, vec!["Be brief.", "What time is it?", "Noon."]);
        assert_eq!(calls[1].1, "And the day?");
        call.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_clears_before_new_audio() {
        let settings = SessionSettings {
            pacing: true,
            ..settings()
        };
        // 100 frames = 2 s of reply, far longer than the test takes to interrupt.
        let mut call = launch(settings, MockLlm::echo(), MockTts::new(100));
        call.start().await;

        call.stt.say("Tell me a story.").await;
        call.wait_for_state(CallState::Speaking).await;
        for _ in 0..3 {
            let command = call.commands.recv().await.unwrap();
            assert!(matches!(command, TransportCommand::Media(ref c) if c.turn_id == 1));
        }

        call.stt.say("Stop, stop.").await;
        let barge_in = call
            .wait_for(|e| matches!(e, CallEvent::BargeIn { .. }))
            .await;
        assert_eq!(
            barge_in,
            CallEvent::BargeIn {
                abandoned_turn: 1,
                new_turn: 2
            }
        );

        let commands = call.commands_until_mark(2).await;
        let clear_at = commands
            .iter()
            .position(|c| *c == TransportCommand::Clear)
            .expect("no clear sent");
        for (i, command) in commands.iter().enumerate() {
            if let TransportCommand::Media(chunk) = command {
                match chunk.turn_id {
                    1 => assert!(i < clear_at, "turn 1 audio after clear"),
                    _ => assert!(i > clear_at, "turn 2 audio before clear"),
                }
            }
        }
        assert_eq!(media_turns(&commands).iter().filter(|t| **t == 2).count(), 100);
        // The interrupted turn never finished, so it never got a mark.
        assert!(!commands.contains(&TransportCommand::Mark {
            name: "turn-1".into()
        }));
        call.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_utterance_supersedes_pending_generation() {
        let llm = MockLlm::echo().with_delay(Duration::from_secs(1));
        let mut call = launch(settings(), llm.clone(), MockTts::new(1));
        call.start().await;

        call.stt.say("First.").await;
        call.wait_for_state(CallState::Thinking).await;
        call.stt.say("Second.").await;

        let reply = call
            .wait_for(|e| matches!(e, CallEvent::AssistantReply { .. }))
            .await;
        assert!(matches!(
            reply,
            CallEvent::AssistantReply { turn: 2, ref text, .. } if *text == MockLlm::echo_reply("Second.")
        ));
        let commands = call.commands_until_mark(2).await;
        assert!(!commands.contains(&TransportCommand::Clear));
        assert_eq!(media_turns(&commands), vec![2]);

        // The abandoned question stays in the conversation.
        let calls = llm.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0.last().unwrap().content, "First.");
        call.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_is_spoken_without_model() {
        let llm = MockLlm::echo();
        let tts = MockTts::new(2);
        let settings = SessionSettings {
            greeting: Some("Hello, thanks for calling.".into()),
            ..settings()
        };
        let mut call = launch(settings, llm.clone(), tts.clone());
        call.start().await;

        let reply = call
            .wait_for(|e| matches!(e, CallEvent::AssistantReply { .. }))
            .await;
        assert_eq!(
            reply,
            CallEvent::AssistantReply {
                turn: 1,
                text: "Hello, thanks for calling.".into(),
                latency_ms: 0,
            }
        );
        assert_eq!(media_turns(&call.play_out(1).await), vec![1, 1]);
        call.wait_for_state(CallState::Listening).await;
        assert!(llm.calls().is_empty());
        assert_eq!(tts.texts(), vec!["Hello, thanks for calling."]);

        // The greeting is part of the conversation the model sees next.
        call.stt.say("Hi.").await;
        call.commands_until_mark(2).await;
        let history = &llm.calls()[0].0;
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Hello, thanks for calling.");
        call.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_errors_keep_call_alive() {
        let llm = MockLlm::with_replies(vec![Err("rate limited")]);
        let mut call = launch(settings(), llm, MockTts::new(1));
        call.start().await;

        call.stt
            .emit(SttEvent::Error(CallError::provider("scripted", "bad frame")))
            .await;
        let error = call.wait_for(|e| matches!(e, CallEvent::Error { .. })).await;
        assert!(matches!(error, CallEvent::Error { ref kind, .. } if kind == "provider"));

        call.stt.say("Hello?").await;
        call.wait_for(|e| matches!(e, CallEvent::Error { .. })).await;
        call.wait_for_state(CallState::Listening).await;

        // The next turn goes through normally.
        call.stt.say("Hello again.").await;
        assert_eq!(media_turns(&call.commands_until_mark(2).await), vec![2]);
        call.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_failure_returns_to_listening() {
        let mut call = launch(settings(), MockLlm::echo(), MockTts::failing());
        call.start().await;

        call.stt.say("Hello.").await;
        call.wait_for_state(CallState::Speaking).await;
        call.wait_for(|e| matches!(e, CallEvent::Error { .. })).await;
        call.wait_for_state(CallState::Listening).await;
        call.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_reaches_recognizer() {
        let mut call = launch(settings(), MockLlm::echo(), MockTts::new(1));

        // Before start the frame is ignored.
        call.send(silence_frame()).await;
        call.start().await;
        assert_eq!(call.stt.connects(), 1);
        assert_eq!(call.stt.samples_received(), 0);

        for _ in 0..4 {
            call.send(silence_frame()).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(call.stt.samples_received(), 0, "below threshold");

        call.send(silence_frame()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(call.stt.samples_received() > 0);

        let stt = call.stt.clone();
        call.stop().await.unwrap();
        assert_eq!(stt.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_frame_is_dropped() {
        let mut call = launch(settings(), MockLlm::echo(), MockTts::new(1));
        call.start().await;

        call.send(TransportEvent::Media {
            payload: "***".into(),
        })
        .await;
        let error = call.wait_for(|e| matches!(e, CallEvent::Error { .. })).await;
        assert!(matches!(error, CallEvent::Error { ref kind, .. } if kind == "codec"));

        // Later frames still line up.
        for _ in 0..5 {
            call.send(silence_frame()).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(call.stt.samples_received() > 0);
        call.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognizer_reconnects() {
        let mut call = launch(settings(), MockLlm::echo(), MockTts::new(1));
        call.start().await;

        call.stt.fail_next_connects(1);
        assert!(call.stt.disconnect().await);
        call.wait_for(|e| matches!(e, CallEvent::Error { .. })).await;

        tokio::time::timeout(WAIT, async {
            while !call.stt.say("Still there?").await {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(media_turns(&call.commands_until_mark(1).await), vec![1]);
        assert_eq!(call.stt.connects(), 3);
        call.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognizer_exhaustion_ends_call() {
        let settings = SessionSettings {
            max_reconnect_attempts: 2,
            ..settings()
        };
        let mut call = launch(settings, MockLlm::echo(), MockTts::new(1));
        call.start().await;

        call.stt.fail_next_connects(10);
        call.stt.disconnect().await;
        let result = call.run.await.unwrap();
        assert!(matches!(result, Err(CallError::Transport(_))));
        // One initial connect plus three attempts after the drop.
        assert_eq!(call.stt.connects(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_close_is_fatal() {
        let mut call = launch(settings(), MockLlm::echo(), MockTts::new(1));
        call.start().await;
        drop(call.transport);
        let result = call.run.await.unwrap();
        assert!(result.unwrap_err().is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_call() {
        let mut call = launch(settings(), MockLlm::echo(), MockTts::new(1));
        call.start().await;
        call.send(TransportEvent::Dtmf { digit: "5".into() }).await;
        call.send(TransportEvent::Mark {
            name: "turn-0".into(),
        })
        .await;
        let mut events = call.events.resubscribe();
        assert!(call.stop().await.is_ok());

        let mut idle = false;
        while let Ok(event) = events.try_recv() {
            idle |= event == CallEvent::StateChanged {
                state: CallState::Idle,
            };
        }
        assert!(idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpaced_reply_is_interruptible_until_played() {
        // Without pacing the whole reply is on the wire long before the caller has heard it.
        let mut call = launch(settings(), MockLlm::echo(), MockTts::new(100));
        call.start().await;

        call.stt.say("Tell me a story.").await;
        let commands = call.commands_until_mark(1).await;
        assert_eq!(media_turns(&commands), vec![1; 100]);

        // Only the far end's echo of this turn's mark ends the reply.
        call.send(TransportEvent::Mark {
            name: "turn-0".into(),
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = call.events.try_recv() {
            assert_ne!(
                event,
                CallEvent::StateChanged {
                    state: CallState::Listening
                }
            );
        }

        call.stt.say("Stop, stop.").await;
        let barge_in = call
            .wait_for(|e| matches!(e, CallEvent::BargeIn { .. }))
            .await;
        assert_eq!(
            barge_in,
            CallEvent::BargeIn {
                abandoned_turn: 1,
                new_turn: 2
            }
        );

        let commands = call.play_out(2).await;
        assert_eq!(commands[0], TransportCommand::Clear);
        assert_eq!(media_turns(&commands), vec![2; 100]);
        call.wait_for_state(CallState::Listening).await;
        call.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_stops_slow_synthesis() {
        let tts = MockTts::new(50).with_frame_delay(Duration::from_millis(20));
        let mut call = launch(settings(), MockLlm::echo(), tts);
        call.start().await;

        call.stt.say("Tell me a story.").await;
        call.wait_for_state(CallState::Speaking).await;
        for _ in 0..3 {
            let command = call.commands.recv().await.unwrap();
            assert!(matches!(command, TransportCommand::Media(ref c) if c.turn_id == 1));
        }

        call.stt.say("Wait.").await;
        let commands = call.commands_until_mark(2).await;
        let clear_at = commands
            .iter()
            .position(|c| *c == TransportCommand::Clear)
            .expect("no clear sent");
        let turns = media_turns(&commands);
        for (i, command) in commands.iter().enumerate() {
            if let TransportCommand::Media(chunk) = command {
                assert_eq!(chunk.turn_id == 1, i < clear_at);
            }
        }
        let interrupted = 3 + turns.iter().filter(|t| **t == 1).count();
        assert!(interrupted < 50, "interrupted reply kept streaming");
        assert_eq!(turns.iter().filter(|t| **t == 2).count(), 50);
        call.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_frame_finalizes_recognizer() {
        let mut call = launch(settings(), MockLlm::echo(), MockTts::new(1));
        call.start().await;

        call.send(silence_frame()).await;
        call.send(silence_frame()).await;
        call.send(TransportEvent::Media {
            payload: String::new(),
        })
        .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(call.stt.finalizes(), 1);
        let heard = call.stt.samples_received();
        assert!(heard > 0);

        // Nothing buffered, nothing to finalize.
        call.send(TransportEvent::Media {
            payload: String::new(),
        })
        .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(call.stt.finalizes(), 1);

        // Leftover audio is flushed and finalized on stop.
        call.send(silence_frame()).await;
        let stt = call.stt.clone();
        call.stop().await.unwrap();
        assert_eq!(stt.finalizes(), 2);
        assert!(stt.samples_received() > heard);
        assert_eq!(stt.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_served_while_reconnect_hangs() {
        let settings = SessionSettings {
            connect_timeout: Duration::from_secs(600),
            ..settings()
        };
        let mut call = launch(settings, MockLlm::echo(), MockTts::new(1));
        call.start().await;

        call.stt.hang_next_connects(1);
        assert!(call.stt.disconnect().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(call.stt.connects(), 2);

        let stt = call.stt.clone();
        let result = tokio::time::timeout(Duration::from_secs(1), call.stop())
            .await
            .expect("stop not served while reconnecting");
        assert!(result.is_ok());
        assert_eq!(stt.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_connect_attempt_times_out() {
        let settings = SessionSettings {
            connect_timeout: Duration::from_secs(1),
            ..settings()
        };
        let mut call = launch(settings, MockLlm::echo(), MockTts::new(1));
        call.start().await;

        call.stt.hang_next_connects(1);
        assert!(call.stt.disconnect().await);
        let error = call.wait_for(|e| matches!(e, CallEvent::Error { .. })).await;
        assert!(matches!(error, CallEvent::Error { ref message, .. } if message.contains("timed out")));

        tokio::time::timeout(WAIT, async {
            while !call.stt.say("Hello?").await {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(media_turns(&call.commands_until_mark(1).await), vec![1]);
        assert_eq!(call.stt.connects(), 3);
        call.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognizer_unavailable_at_start_ends_call() {
        let settings = SessionSettings {
            max_reconnect_attempts: 1,
            ..settings()
        };
        let call = launch(settings, MockLlm::echo(), MockTts::new(1));
        call.stt.fail_next_connects(5);
        call.send(TransportEvent::Start {
            stream_sid: "MZ00".into(),
            call_sid: None,
        })
        .await;
        let result = call.run.await.unwrap();
        assert!(matches!(result, Err(CallError::Transport(_))));
        assert_eq!(call.stt.connects(), 2);
    }
}
