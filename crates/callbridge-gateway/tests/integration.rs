//! Gateway integration tests: start a real gateway and drive a call over WS + HTTP.
//!
//! Run with: `cargo test -p callbridge-gateway --test integration`

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use callbridge_core::config::{Config, GatewayConfig};
use callbridge_gateway::GatewayState;
use callbridge_session::SessionSettings;
use callbridge_session::testing::{MockLlm, MockTts, ScriptedStt, SttController, provider_set};

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a gateway backed by scripted providers.
async fn start_test_gateway() -> (Arc<GatewayState>, SttController, u16) {
    let port = find_free_port();
    let config = Config {
        gateway: Some(GatewayConfig {
            port,
            bind: Some("127.0.0.1".into()),
        }),
        ..Config::default()
    };
    let settings = SessionSettings {
        pacing: false,
        ..SessionSettings::default()
    };
    let (stt, controller) = ScriptedStt::new();
    let providers = provider_set(stt, MockLlm::echo(), MockTts::new(3));
    let state = Arc::new(GatewayState::new(Arc::new(config), settings, providers));

    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = callbridge_gateway::start_gateway(state_clone, port).await;
    });

    // Wait for gateway to be ready
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .is_ok()
        {
            break;
        }
    }

    (state, controller, port)
}

async fn health(port: u16) -> Value {
    reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .expect("Health request failed")
        .json()
        .await
        .unwrap()
}

fn text(frame: Value) -> Message {
    Message::Text(frame.to_string().into())
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_state, _stt, port) = start_test_gateway().await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .expect("Health request failed");

    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["active_calls"], 0);
}

#[tokio::test]
async fn test_full_call_produces_outbound_audio() {
    let (state, stt, port) = start_test_gateway().await;

    let url = format!("ws://127.0.0.1:{port}/twilio");
    let (mut ws, _) = connect_async(&url).await.expect("WS connect failed");

    ws.send(text(json!({"event": "connected", "protocol": "Call", "version": "1.0.0"})))
        .await
        .unwrap();
    ws.send(text(json!({
        "event": "start",
        "sequenceNumber": "1",
        "streamSid": "MZtest",
        "start": {
            "streamSid": "MZtest",
            "callSid": "CAtest",
            "accountSid": "ACtest",
            "tracks": ["inbound"],
            "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
        }
    })))
    .await
    .unwrap();
    for i in 0..5 {
        ws.send(text(json!({
            "event": "media",
            "sequenceNumber": (i + 2).to_string(),
            "streamSid": "MZtest",
            "media": {"track": "inbound", "timestamp": (i * 20).to_string(), "payload": "/////w=="}
        })))
        .await
        .unwrap();
    }

    // The scripted recognizer only accepts speech once the session has connected it.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !stt.say("Hello there.").await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("recognizer never connected");
    assert_eq!(health(port).await["active_calls"], 1);
    assert_eq!(
        state.calls.read().await.values().next().unwrap().stream_sid.as_deref(),
        Some("MZtest")
    );

    let mut media = 0;
    let mut mark = None;
    while mark.is_none() {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for reply audio")
            .unwrap()
            .unwrap();
        let frame: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(frame["streamSid"], "MZtest");
        match frame["event"].as_str() {
            Some("media") => {
                assert!(frame["media"]["payload"].is_string());
                media += 1;
            }
            Some("mark") => mark = Some(frame["mark"]["name"].clone()),
            other => panic!("unexpected outbound event {other:?}"),
        }
    }
    assert_eq!(media, 3);
    assert_eq!(mark.unwrap(), "turn-1");
    assert!(stt.samples_received() > 0);

    // The far end echoes the mark once the reply has been played.
    ws.send(text(json!({"event": "mark", "streamSid": "MZtest", "mark": {"name": "turn-1"}})))
        .await
        .unwrap();
    ws.send(text(json!({"event": "stop", "streamSid": "MZtest", "stop": {"callSid": "CAtest"}})))
        .await
        .unwrap();

    // The gateway closes the socket once the call has ended.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    for _ in 0..50 {
        if state.active_calls().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(health(port).await["active_calls"], 0);
}

#[tokio::test]
async fn test_malformed_frames_are_ignored() {
    let (_state, stt, port) = start_test_gateway().await;

    let url = format!("ws://127.0.0.1:{port}/twilio");
    let (mut ws, _) = connect_async(&url).await.expect("WS connect failed");

    ws.send(Message::Text("not json".into())).await.unwrap();
    ws.send(text(json!({"event": "somethingNew"}))).await.unwrap();
    ws.send(text(json!({
        "event": "start",
        "streamSid": "MZbad",
        "start": {"streamSid": "MZbad", "tracks": ["inbound"]}
    })))
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while stt.connects() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session did not survive malformed frames");

    ws.close(None).await.ok();
}
