use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker not started")]
    NotRunning,
    #[error("broker is shutting down, cannot {0}")]
    ShuttingDown(&'static str),
    #[error("transport error during {context}: {message}")]
    Transport {
        context: &'static str,
        message: String,
    },
    #[error("invalid broker configuration: {0}")]
    Configuration(String),
}

impl BrokerError {
    pub fn transport(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            context,
            message: err.to_string(),
        }
    }
}
