use thiserror::Error;

use crate::types::CmdState;

#[derive(Debug, Error)]
pub enum IndispensoError {
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("template is disabled: {0}")]
    TemplateDisabled(String),

    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("command not found: {0}")]
    CmdNotFound(String),

    #[error("consensus request not found: {0}")]
    RequestNotFound(String),

    #[error("user {0} cannot approve their own request")]
    SelfApproval(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: CmdState, to: CmdState },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid output stream: {0}")]
    InvalidOutputStream(String),

    #[error("invalid validation rule: {0}")]
    InvalidRule(String),

    #[error("invalid execution strategy: {0}")]
    InvalidStrategy(String),

    #[error("invalid auth token: {0}")]
    InvalidToken(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IndispensoError>;
