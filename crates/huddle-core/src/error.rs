use thiserror::Error;

/// Unified error type for the huddle workspace.
#[derive(Error, Debug)]
pub enum HuddleError {
    // ── Transport errors ───────────────────────────────────────
    #[error("link not established: {0}")]
    LinkNotEstablished(String),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication rejected by {peer}: {reason}")]
    AuthRejected { peer: String, reason: String },

    // ── Protocol errors ────────────────────────────────────────
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("request '{name}' to {peer} timed out")]
    RequestTimeout { peer: String, name: String },

    #[error("{peer} has no handler for request '{name}'")]
    NoHandler { peer: String, name: String },

    // ── Planning errors ────────────────────────────────────────
    #[error("invalid profile: {name}: {reason}")]
    InvalidProfile { name: String, reason: String },

    // ── Store errors ───────────────────────────────────────────
    #[error("key not found: {0}")]
    KeyNotFound(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl HuddleError {
    /// Whether the error means the peer has no live link right now.
    ///
    /// The log relay buffers a record whose delivery failed this way and
    /// drops one that failed for any other reason.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            HuddleError::LinkNotEstablished(_)
                | HuddleError::PeerUnreachable(_)
                | HuddleError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HuddleError>;
