//! Uplink and shell errors.
//!
//! Nothing here is retried internally. Rejections carry the remote host's
//! reason verbatim; transport failures and timeouts are retryable by the
//! caller with whatever backoff it prefers.

use loom_kernel::LoomError;
use loom_types::{RejectReason, SpaceId, SpanId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("invalid_signature")]
    InvalidSignature,

    #[error("invalid_token")]
    InvalidToken,

    #[error("insufficient_permissions")]
    InsufficientPermissions,

    /// Any other reason the host gave, as sent.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("transport: {0}")]
    Transport(String),

    #[error("not connected to space {0}")]
    NotConnected(SpaceId),

    #[error("unknown connection span {0}")]
    UnknownSpan(SpanId),
}

impl ConnectionError {
    /// Map a host's rejection reason string.
    pub fn from_reason(reason: &str) -> Self {
        match reason.parse::<RejectReason>() {
            Ok(RejectReason::InvalidSignature) => Self::InvalidSignature,
            Ok(RejectReason::InvalidToken) => Self::InvalidToken,
            Ok(RejectReason::InsufficientPermissions) => Self::InsufficientPermissions,
            _ => Self::Rejected(reason.to_string()),
        }
    }

    /// Whether trying again later can succeed without changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

impl From<RejectReason> for ConnectionError {
    fn from(reason: RejectReason) -> Self {
        Self::from_reason(&reason.to_string())
    }
}

/// Everything a [`Shell`](crate::Shell) call can fail with.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error(transparent)]
    Loom(#[from] LoomError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("no uplink configured")]
    NoUplink,
}

impl ShellError {
    /// Stable decoherence code, when the kernel rejected the call.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Loom(e) => e.code(),
            _ => None,
        }
    }
}
