use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("Process not running")]
    ProcessNotRunning,

    #[error("Agent not found: {id}")]
    AgentNotFound { id: String },

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Chat API error: {0}")]
    Chat(String),

    #[error("Socket protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Short error code string used in admin-socket error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "CONFIG_ERROR",
            BridgeError::Spawn(_) => "SPAWN_FAILED",
            BridgeError::ProcessNotRunning => "NOT_RUNNING",
            BridgeError::AgentNotFound { .. } => "AGENT_NOT_FOUND",
            BridgeError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            BridgeError::Chat(_) => "CHAT_ERROR",
            BridgeError::Protocol(_) => "PROTOCOL_ERROR",
            BridgeError::Serialization(_) => "SERIALIZATION_ERROR",
            BridgeError::Io(_) => "IO_ERROR",
            BridgeError::Timeout { .. } => "TIMEOUT",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
