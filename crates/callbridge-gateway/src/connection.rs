//! Telephony WebSocket lifecycle: frame translation and the read/write loops.

use std::sync::{Arc, OnceLock};

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use callbridge_core::protocol::{InboundMessage, OutboundMessage, TransportCommand, TransportEvent};
use callbridge_session::CallSession;

use crate::state::GatewayState;

const EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 256;

/// Stream identifier, learned from the `start` frame and stamped on every outbound frame.
type StreamSid = Arc<OnceLock<String>>;

/// Run one telephony connection until the call ends.
pub async fn handle_call(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "Telephony stream connected");
    state.register_call(&conn_id).await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_call_start();

    let (ws_tx, ws_rx) = ws.split();
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let stream_sid = StreamSid::default();

    let session = CallSession::new(state.settings.clone(), state.providers.clone());
    #[cfg(feature = "metrics")]
    let observer = tokio::spawn(crate::metrics::observe_call(session.subscribe()));

    let writer = tokio::spawn(write_loop(ws_tx, command_rx, stream_sid.clone()));
    let reader = tokio::spawn(read_loop(
        ws_rx,
        event_tx,
        stream_sid.clone(),
        state.clone(),
        conn_id.clone(),
    ));

    let result = session.run(event_rx, command_tx).await;
    let sid = stream_sid.get().map(String::as_str).unwrap_or("-");
    match &result {
        Ok(()) => info!(conn_id = %conn_id, stream_sid = sid, "Call completed"),
        Err(e) => warn!(conn_id = %conn_id, stream_sid = sid, error = %e, "Call failed"),
    }

    // The session dropped its command sender, so the writer drains and closes the socket.
    reader.abort();
    if let Err(e) = writer.await {
        error!(conn_id = %conn_id, %e, "Writer task failed");
    }
    #[cfg(feature = "metrics")]
    {
        let _ = observer.await;
        crate::metrics::record_call_end(match &result {
            Ok(()) => "completed",
            Err(e) => e.kind(),
        });
    }

    if let Some(call) = state.unregister_call(&conn_id).await {
        let duration = chrono::Utc::now() - call.started_at;
        info!(
            conn_id = %conn_id,
            duration_secs = duration.num_seconds(),
            "Telephony stream closed"
        );
    }
}

/// Forward inbound frames to the session until the socket closes or the session stops listening.
async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    events: mpsc::Sender<TransportEvent>,
    stream_sid: StreamSid,
    state: Arc<GatewayState>,
    conn_id: String,
) {
    while let Some(msg_result) = ws_rx.next().await {
        let text = match msg_result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Far end requested close");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
        };

        let message = match InboundMessage::parse(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "Ignoring frame");
                continue;
            }
        };
        let Some(event) = message.into_transport_event() else {
            debug!(conn_id = %conn_id, "Non-call frame ignored");
            continue;
        };

        if let TransportEvent::Start { stream_sid: sid, .. } = &event {
            if stream_sid.set(sid.clone()).is_err() {
                warn!(conn_id = %conn_id, stream_sid = %sid, "Stream restarted on the same socket");
            }
            state.set_stream_sid(&conn_id, sid).await;
        }
        let stop = matches!(event, TransportEvent::Stop);
        if events.send(event).await.is_err() || stop {
            break;
        }
    }
}

/// Serialize session commands onto the socket.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut commands: mpsc::Receiver<TransportCommand>,
    stream_sid: StreamSid,
) {
    while let Some(command) = commands.recv().await {
        let Some(sid) = stream_sid.get() else {
            warn!(?command, "Command before stream start dropped");
            continue;
        };
        let frame = OutboundMessage::from_command(sid, &command);
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                error!(%e, "Failed to serialize outbound frame");
                continue;
            }
        };
        if ws_tx.send(Message::Text(json.into())).await.is_err() {
            debug!("Socket closed, outbound frames discarded");
            return;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}
