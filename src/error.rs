//! Error taxonomy for every fallible boundary in the crate.
//!
//! Library code never panics on an external condition (bad input, a dead
//! child, a full socket) — it returns one of these and lets the caller
//! decide what to log and which close code to send.

/// Why a PTY Channel operation failed.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("openpty failed: {0}")]
    OpenFailed(#[source] std::io::Error),

    #[error("fork failed: {0}")]
    ForkFailed(#[source] std::io::Error),

    #[error("read from PTY master failed: {0}")]
    ReadFailed(#[source] std::io::Error),

    #[error("write to PTY master failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("ioctl TIOCSWINSZ failed: {0}")]
    ResizeFailed(#[source] std::io::Error),
}

/// Why a frame failed to decode. Always recoverable — the caller logs and
/// discards the offending frame, it never tears down the session by itself.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty frame (no tag byte)")]
    EmptyFrame,

    #[error("unknown client tag byte {0:#04x} ({0:?})")]
    UnknownTag(u8),

    #[error("malformed JSON payload: {0}")]
    InvalidJson(#[source] serde_json::Error),
}

/// Terminal outcome of a session, mapped to a web socket close code in §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// PTY reached EOF cleanly. Close code 1000.
    Normal,
    /// Initial-message emit failure, PTY I/O error, or unrecoverable socket
    /// write. Close code 1011.
    UnexpectedCondition,
    /// Authentication failed. Close code 1008.
    PolicyViolation,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::UnexpectedCondition => 1011,
            CloseReason::PolicyViolation => 1008,
        }
    }

    pub fn reason_text(self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::UnexpectedCondition => "unexpected condition",
            CloseReason::PolicyViolation => "policy violation",
        }
    }
}

/// Fatal, session-ending errors. Every variant maps to exactly one
/// [`CloseReason`] via [`SessionError::close_reason`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to send initial handshake message: {0}")]
    HandshakeSendFailed(#[source] axum::Error),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("socket write failed: {0}")]
    SocketWriteFailed(#[source] axum::Error),

    #[error("authentication failed")]
    AuthFailed,

    #[error("child process could not be spawned: {0}")]
    SpawnFailed(#[source] PtyError),
}

impl SessionError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            SessionError::AuthFailed => CloseReason::PolicyViolation,
            _ => CloseReason::UnexpectedCondition,
        }
    }
}

/// Why an upgrade attempt was refused before it ever became a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("refused: --once is set and a client is already connected")]
    OnceInUse,
    #[error("refused: at max-clients limit")]
    AtCapacity,
    #[error("refused: wrong web socket path")]
    WrongPath,
    #[error("refused: Origin does not match Host")]
    OriginMismatch,
}

/// Configuration/CLI errors, surfaced before the server ever binds.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no command given to run (pass it after `--`)")]
    MissingCommand,

    #[error("failed to read credential file {path:?}: {source}")]
    CredentialFileUnreadable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}
