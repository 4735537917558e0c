//! Typed error taxonomy shared across the codec, transport, and orchestrator.
//!
//! Library code returns [`CipdipError`] so callers can match on `kind()`.
//! Application entry points (the CLI, `main`) work in `anyhow::Result` and
//! only need the `Display` impl.

use thiserror::Error;

/// The stable error-kind taxonomy used in `run_meta.json` and exit-code
/// mapping. Every [`CipdipError`] variant maps to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigError,
    TransportError,
    ProtocolFramingError,
    ProtocolServiceError,
    Timeout,
    Cancelled,
    IntegrityError,
    InvariantError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "config_error",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::ProtocolFramingError => "protocol_framing_error",
            ErrorKind::ProtocolServiceError => "protocol_service_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::IntegrityError => "integrity_error",
            ErrorKind::InvariantError => "invariant_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum CipdipError {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("protocol service error: service=0x{service:02x} status=0x{status:02x}: {detail}")]
    ProtocolService {
        service: u8,
        status: u8,
        detail: String,
    },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CipdipError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CipdipError::Config(_) => ErrorKind::ConfigError,
            CipdipError::Transport(_) => ErrorKind::TransportError,
            CipdipError::ProtocolFraming(_) => ErrorKind::ProtocolFramingError,
            CipdipError::ProtocolService { .. } => ErrorKind::ProtocolServiceError,
            CipdipError::Timeout(_) => ErrorKind::Timeout,
            CipdipError::Cancelled => ErrorKind::Cancelled,
            CipdipError::Integrity(_) => ErrorKind::IntegrityError,
            CipdipError::Invariant(_) => ErrorKind::InvariantError,
            CipdipError::Io(_) => ErrorKind::TransportError,
        }
    }

    /// Maps an error to the process exit code defined in the external
    /// interface contract: 0 success, 1 usage error, 2 runtime error.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::ConfigError => 1,
            _ => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, CipdipError>;
