//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use callbridge_core::config::Config;
use callbridge_core::error::CallError;
use callbridge_providers::ProviderSet;
use callbridge_session::SessionSettings;

/// Shared state accessible from every connection and handler.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub settings: SessionSettings,
    pub providers: ProviderSet,
    pub calls: RwLock<HashMap<String, CallInfo>>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// One live telephony connection.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub conn_id: String,
    /// Known once the stream's `start` frame arrives.
    pub stream_sid: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, settings: SessionSettings, providers: ProviderSet) -> Self {
        Self {
            config,
            settings,
            providers,
            calls: RwLock::new(HashMap::new()),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Derive session settings and build the configured providers.
    pub fn from_config(config: Config) -> Result<Self, CallError> {
        let settings = SessionSettings::from_config(&config)?;
        let providers = ProviderSet::from_config(&config)?;
        Ok(Self::new(Arc::new(config), settings, providers))
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub async fn active_calls(&self) -> usize {
        self.calls.read().await.len()
    }

    pub async fn register_call(&self, conn_id: &str) {
        self.calls.write().await.insert(
            conn_id.to_string(),
            CallInfo {
                conn_id: conn_id.to_string(),
                stream_sid: None,
                started_at: Utc::now(),
            },
        );
    }

    pub async fn set_stream_sid(&self, conn_id: &str, stream_sid: &str) {
        if let Some(call) = self.calls.write().await.get_mut(conn_id) {
            call.stream_sid = Some(stream_sid.to_string());
        }
    }

    /// Forget a connection, returning what was known about it.
    pub async fn unregister_call(&self, conn_id: &str) -> Option<CallInfo> {
        self.calls.write().await.remove(conn_id)
    }
}
