//! Re-chunks synthesized reply audio into fixed-size telephony frames.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use callbridge_core::error::CallError;
use callbridge_core::types::{AudioFormat, MULAW_SILENCE, OutboundChunk, TurnId};

use crate::codec::TelephonyTranscoder;

/// Turns one turn's telephony byte stream into `chunk_bytes`-sized [`OutboundChunk`]s.
#[derive(Debug)]
pub struct ReplyPlayer {
    turn_id: TurnId,
    chunk_bytes: usize,
    pending: Vec<u8>,
    next_index: u64,
}

impl ReplyPlayer {
    pub fn new(turn_id: TurnId, chunk_bytes: usize) -> Self {
        let chunk_bytes = chunk_bytes.max(1);
        Self {
            turn_id,
            chunk_bytes,
            pending: Vec::with_capacity(chunk_bytes),
            next_index: 0,
        }
    }

    /// Chunks emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next_index
    }

    /// Append telephony bytes, returning every chunk that is now complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<OutboundChunk> {
        self.pending.extend_from_slice(bytes);
        let complete = self.pending.len() / self.chunk_bytes;
        if complete == 0 {
            return Vec::new();
        }

        let rest = self.pending.split_off(complete * self.chunk_bytes);
        let full = std::mem::replace(&mut self.pending, rest);
        full.chunks_exact(self.chunk_bytes)
            .map(|c| self.chunk(c.to_vec()))
            .collect()
    }

    /// End of turn: pad the remainder with μ-law silence to a full chunk.
    pub fn finish(&mut self) -> Option<OutboundChunk> {
        if self.pending.is_empty() {
            return None;
        }
        let mut last = std::mem::take(&mut self.pending);
        last.resize(self.chunk_bytes, MULAW_SILENCE);
        Some(self.chunk(last))
    }

    fn chunk(&mut self, payload: Vec<u8>) -> OutboundChunk {
        let chunk = OutboundChunk {
            turn_id: self.turn_id,
            index: self.next_index,
            payload,
        };
        self.next_index += 1;
        chunk
    }
}

struct ChunkState<S> {
    audio: S,
    transcoder: TelephonyTranscoder,
    player: ReplyPlayer,
    ready: VecDeque<OutboundChunk>,
    done: bool,
}

/// Lazily convert a synthesized audio stream for one turn into outbound chunks.
///
/// Nothing is pulled from `audio` until the returned stream is polled, and dropping it drops the
/// upstream synthesis stream. A synthesis error is yielded once and ends the stream.
pub fn outbound_chunks<S>(
    audio: S,
    format: AudioFormat,
    turn_id: TurnId,
    chunk_bytes: usize,
) -> impl Stream<Item = Result<OutboundChunk, CallError>> + Send
where
    S: Stream<Item = Result<Bytes, CallError>> + Unpin + Send,
{
    let state = ChunkState {
        audio,
        transcoder: TelephonyTranscoder::new(format),
        player: ReplyPlayer::new(turn_id, chunk_bytes),
        ready: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.ready.pop_front() {
                return Some((Ok(chunk), state));
            }
            if state.done {
                return None;
            }
            match state.audio.next().await {
                Some(Ok(bytes)) => {
                    let telephony = state.transcoder.push(&bytes);
                    state.ready.extend(state.player.feed(&telephony));
                }
                Some(Err(e)) => {
                    state.done = true;
                    state.ready.clear();
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    let tail = state.transcoder.finish();
                    state.ready.extend(state.player.feed(&tail));
                    state.ready.extend(state.player.finish());
                }
            }
        }
    })
}
