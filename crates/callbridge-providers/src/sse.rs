//! Server-Sent Events line parser for streamed completion responses.

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

type ByteStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

struct SseState {
    bytes: ByteStream,
    buffer: String,
    current_event: Option<String>,
    current_data: Vec<String>,
}

impl SseState {
    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
        };
        self.current_data.clear();
        Some(event)
    }
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send {
    let bytes = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| anyhow::anyhow!("SSE stream error: {e}")));
    parse_sse_bytes(bytes)
}

/// Parse any byte stream as SSE. Lines may be split across chunks.
pub fn parse_sse_bytes<S>(bytes: S) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send
where
    S: Stream<Item = anyhow::Result<Bytes>> + Send + 'static,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        buffer: String::new(),
        current_event: None,
        current_data: Vec::new(),
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(newline_pos) = state.buffer.find('\n') {
                let line = state.buffer[..newline_pos]
                    .trim_end_matches('\r')
                    .to_string();
                state.buffer.drain(..=newline_pos);

                if line.is_empty() {
                    if let Some(event) = state.dispatch() {
                        return Some((Ok(event), state));
                    }
                    continue;
                }
                if line.starts_with(':') {
                    continue;
                }
                if let Some(value) = line.strip_prefix("event:") {
                    state.current_event = Some(value.trim_start().to_string());
                } else if let Some(value) = line.strip_prefix("data:") {
                    state.current_data.push(value.trim_start().to_string());
                }
                continue;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                Some(Err(e)) => return Some((Err(e), state)),
                None => {
                    // Unterminated last line still counts.
                    if !state.buffer.is_empty() {
                        let rest = std::mem::take(&mut state.buffer);
                        if let Some(value) = rest.trim_end_matches('\r').strip_prefix("data:") {
                            state.current_data.push(value.trim_start().to_string());
                        }
                    }
                    return state.dispatch().map(|event| (Ok(event), state));
                }
            }
        }
    })
}
