use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    /// The telephony leg (or a connection the call cannot live without) is gone.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CallError {
    /// Build a provider error from any displayable failure.
    pub fn provider(provider: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: err.to_string(),
        }
    }

    /// Only transport failures end a session; everything else degrades a single turn or frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Provider { .. } => "provider",
            Self::Codec(_) => "codec",
            Self::Protocol(_) => "protocol",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
