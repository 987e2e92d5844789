use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid server response: {0}")]
    Response(String),

    #[error("token signature from server does not match, refusing token")]
    InvalidTokenSignature,

    #[error("Process error: {0}")]
    Process(String),

    #[error(transparent)]
    Core(#[from] indispenso_core::IndispensoError),
}

impl AgentError {
    /// Whether retrying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Status { status, .. } => !(400..500).contains(status),
            AgentError::Http(_) | AgentError::Io(_) | AgentError::Response(_) => true,
            _ => false,
        }
    }
}
