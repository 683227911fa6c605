//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::broadcast;

use callbridge_session::CallEvent;

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Record a telephony stream connecting.
pub fn record_call_start() {
    metrics::gauge!("calls_active").increment(1.0);
    metrics::counter!("calls_total").increment(1);
}

/// Record a telephony stream ending.
pub fn record_call_end(outcome: &str) {
    metrics::gauge!("calls_active").decrement(1.0);
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("calls_ended_total", &labels).increment(1);
}

pub fn record_barge_in() {
    metrics::counter!("barge_ins_total").increment(1);
}

/// Record the time from a finalized utterance to its reply text.
pub fn record_turn_latency(latency_ms: u64) {
    metrics::histogram!("turn_latency_seconds").record(latency_ms as f64 / 1000.0);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}

/// Translate a call's events into metrics until the call ends.
pub async fn observe_call(mut events: broadcast::Receiver<CallEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => record_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Metrics observer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn record_event(event: &CallEvent) {
    match event {
        CallEvent::BargeIn { .. } => record_barge_in(),
        // The greeting reports zero latency and is not a generated turn.
        CallEvent::AssistantReply { latency_ms, .. } if *latency_ms > 0 => {
            record_turn_latency(*latency_ms)
        }
        CallEvent::Error { kind, .. } => record_error(kind),
        _ => {}
    }
}
