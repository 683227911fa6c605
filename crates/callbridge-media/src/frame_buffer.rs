//! Inbound frame accumulation ahead of speech recognition.
//!
//! Telephony delivers one tick (20 ms) per frame. Sending every tick to the recognizer costs a
//! message per 20 ms, so frames are grouped into chunks of `threshold_frames` first.

use callbridge_core::error::CallError;
use callbridge_core::types::{AudioEncoding, InboundFrame};

/// A group of complete frames ready for transcoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyChunk {
    /// Concatenated μ-law bytes of every frame in the chunk.
    pub payload: Vec<u8>,
    /// Sequence position of the first frame.
    pub first_sequence: u64,
    pub frames: usize,
    /// Produced by an explicit flush; the recognizer should finalize after it.
    pub end_of_stream: bool,
}

#[derive(Debug)]
pub struct FrameBuffer {
    threshold_frames: usize,
    pending: Vec<u8>,
    pending_frames: usize,
    first_sequence: u64,
    next_sequence: u64,
    dropped: u64,
}

impl FrameBuffer {
    pub fn new(threshold_frames: usize) -> Self {
        Self {
            threshold_frames: threshold_frames.max(1),
            pending: Vec::new(),
            pending_frames: 0,
            first_sequence: 0,
            next_sequence: 0,
            dropped: 0,
        }
    }

    /// Sequence position the next frame must carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Frames released by [`mark_dropped`](Self::mark_dropped) so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.pending_frames == 0
    }

    /// Add one frame. Yields a chunk once the threshold is reached, or on a zero-length flush frame.
    ///
    /// A refused frame leaves the buffer untouched and does not consume its position.
    pub fn push(&mut self, frame: InboundFrame) -> Result<Option<ReadyChunk>, CallError> {
        if frame.sequence != self.next_sequence {
            return Err(CallError::Protocol(format!(
                "Frame out of order: expected sequence {}, got {}",
                self.next_sequence, frame.sequence
            )));
        }
        if frame.encoding != AudioEncoding::Mulaw {
            return Err(CallError::Codec(format!(
                "Unsupported inbound encoding {:?}",
                frame.encoding
            )));
        }
        self.next_sequence += 1;

        if frame.payload.is_empty() {
            return Ok(self.take(true));
        }

        if self.pending_frames == 0 {
            self.first_sequence = frame.sequence;
        }
        self.pending.extend_from_slice(&frame.payload);
        self.pending_frames += 1;

        if self.pending_frames >= self.threshold_frames {
            return Ok(self.take(false));
        }
        Ok(None)
    }

    /// Record that the frame at `sequence` was discarded by policy (e.g. it failed to decode).
    pub fn mark_dropped(&mut self, sequence: u64) -> Result<(), CallError> {
        if sequence != self.next_sequence {
            return Err(CallError::Protocol(format!(
                "Cannot drop sequence {sequence}: expected {}",
                self.next_sequence
            )));
        }
        self.next_sequence += 1;
        self.dropped += 1;
        tracing::debug!(sequence, "Inbound frame dropped");
        Ok(())
    }

    /// Release whatever is buffered, e.g. when the stream stops.
    pub fn flush(&mut self) -> Option<ReadyChunk> {
        self.take(true)
    }

    fn take(&mut self, end_of_stream: bool) -> Option<ReadyChunk> {
        if self.pending_frames == 0 {
            return None;
        }
        let chunk = ReadyChunk {
            payload: std::mem::take(&mut self.pending),
            first_sequence: self.first_sequence,
            frames: self.pending_frames,
            end_of_stream,
        };
        self.pending_frames = 0;
        Some(chunk)
    }
}
