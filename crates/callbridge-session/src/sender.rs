//! Ordered, paced delivery of outbound audio to the telephony leg.
//!
//! Everything bound for the caller passes through one queue: audio chunks, `clear`, and
//! end-of-turn markers. A single task drains it, so a `clear` queued during barge-in always
//! reaches the transport before any audio of the turn that follows it.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use callbridge_core::protocol::TransportCommand;
use callbridge_core::types::{OutboundChunk, TELEPHONY_TICK_MS, TurnId};

use crate::turn::TurnGate;

/// Item on the outbound queue.
#[derive(Debug)]
pub enum Outbound {
    Audio(OutboundChunk),
    Clear,
    /// The last chunk of `turn` has been queued.
    EndOfTurn(TurnId),
}

/// Name of the mark sent after a turn's last chunk.
///
/// The far end echoes it once everything before it has been played.
pub fn turn_mark(turn: TurnId) -> String {
    format!("turn-{turn}")
}

/// Releases chunks at the telephony rate, a fixed lead ahead of the far end's playback position.
///
/// Audio still in our queue can be dropped on barge-in; audio already sent can only be flushed
/// with `clear`. Keeping the lead small keeps most of a reply on our side.
#[derive(Debug)]
pub struct Pacer {
    tick: Duration,
    lead: Duration,
    origin: Option<Instant>,
    sent: u32,
}

impl Pacer {
    pub fn new(lead: Duration) -> Self {
        Self {
            tick: Duration::from_millis(TELEPHONY_TICK_MS),
            lead,
            origin: None,
            sent: 0,
        }
    }

    /// How long to wait before sending the next chunk.
    pub fn delay_before_next(&mut self, now: Instant) -> Duration {
        let origin = *self.origin.get_or_insert(now);
        let play_at = origin + self.tick * self.sent;
        if play_at < now {
            // The far end drained its buffer; restart the clock from here.
            self.origin = Some(now);
            self.sent = 0;
            return Duration::ZERO;
        }
        play_at.saturating_duration_since(now + self.lead)
    }

    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    pub fn reset(&mut self) {
        self.origin = None;
        self.sent = 0;
    }
}

pub(crate) struct Sender {
    pub queue: mpsc::Receiver<Outbound>,
    pub gate: TurnGate,
    pub transport: mpsc::Sender<TransportCommand>,
    pub pacer: Option<Pacer>,
}

impl Sender {
    /// Drain the queue until it closes or the transport goes away.
    pub async fn run(mut self) {
        let mut stale = 0u64;
        while let Some(item) = self.queue.recv().await {
            match item {
                Outbound::Audio(chunk) => {
                    if !self.gate.is_current(chunk.turn_id) {
                        stale += 1;
                        trace!(turn = chunk.turn_id, index = chunk.index, "Dropping stale chunk");
                        continue;
                    }
                    if let Some(pacer) = self.pacer.as_mut() {
                        let delay = pacer.delay_before_next(Instant::now());
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        // The turn may have been interrupted while we waited.
                        if !self.gate.is_current(chunk.turn_id) {
                            stale += 1;
                            continue;
                        }
                    }
                    if self
                        .transport
                        .send(TransportCommand::Media(chunk))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    if let Some(pacer) = self.pacer.as_mut() {
                        pacer.record_sent();
                    }
                }
                Outbound::Clear => {
                    if let Some(pacer) = self.pacer.as_mut() {
                        pacer.reset();
                    }
                    debug!(stale, "Clearing far-end audio");
                    if self.transport.send(TransportCommand::Clear).await.is_err() {
                        break;
                    }
                }
                Outbound::EndOfTurn(turn) => {
                    if !self.gate.is_current(turn) {
                        continue;
                    }
                    let mark = TransportCommand::Mark {
                        name: turn_mark(turn),
                    };
                    if self.transport.send(mark).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(stale, "Outbound sender stopped");
    }
}
