//! Kernel error types.
//!
//! `DecoherenceError` is the caller-facing taxonomy for timeline problems and
//! is never retried by the kernel. `LoomError` wraps it alongside structural
//! and storage failures.

use loom_types::{BranchId, EventId, ObjectId, SpaceId};
use thiserror::Error;

/// A timeline context or append no longer lines up with the log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecoherenceError {
    /// Optimistic append lost the race: the branch head moved.
    #[error("stale parent on branch {branch}: expected {expected:?}, head is {actual:?}")]
    StaleParent {
        branch: BranchId,
        expected: Option<EventId>,
        actual: Option<EventId>,
    },

    /// Context cursor is not on the branch's current lineage.
    #[error("stale context on branch {branch}: {event} is not an ancestor of head {head}")]
    StaleContext {
        branch: BranchId,
        event: EventId,
        head: EventId,
    },

    /// Branch was marked decoherent after a structural violation.
    #[error("branch {0} is decoherent")]
    BranchDecoherent(BranchId),

    /// Another sibling in the fork set is already primary.
    #[error("cannot make {branch} primary: sibling {existing} already is")]
    PrimaryConflict { branch: BranchId, existing: BranchId },

    /// Fork set has no primary and the caller is causally entangled with it.
    #[error("fork set of {family} has no primary branch; designate one first")]
    NoPrimary { family: BranchId },

    #[error("unknown branch {0}")]
    UnknownBranch(BranchId),

    #[error("unknown event {0}")]
    UnknownEvent(EventId),
}

impl DecoherenceError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::StaleParent { .. } => "STALE_PARENT",
            Self::StaleContext { .. } => "STALE_CONTEXT",
            Self::BranchDecoherent(_) => "BRANCH_DECOHERENT",
            Self::PrimaryConflict { .. } => "PRIMARY_CONFLICT",
            Self::NoPrimary { .. } => "NO_PRIMARY",
            Self::UnknownBranch(_) => "UNKNOWN_BRANCH",
            Self::UnknownEvent(_) => "UNKNOWN_EVENT",
        }
    }
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary codec: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Top-level kernel error.
#[derive(Debug, Error)]
pub enum LoomError {
    #[error(transparent)]
    Decoherence(#[from] DecoherenceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A referenced parent is not in the log. Fatal for the branch.
    #[error("missing parent {parent} for append on branch {branch}")]
    MissingParent { branch: BranchId, parent: EventId },

    /// Ancestry walk looped or exceeded the depth limit. Fatal for the branch.
    #[error("cycle detected on branch {branch} near {event}")]
    CycleDetected { branch: BranchId, event: EventId },

    #[error("merge rejected: {0}")]
    MergeRejected(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("no reducer accepted object {0}")]
    Reducer(ObjectId),

    #[error("unknown space {0}")]
    UnknownSpace(SpaceId),

    #[error("config: {0}")]
    Config(String),
}

impl LoomError {
    /// Violations that mark the affected branch decoherent.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::MissingParent { .. } | Self::CycleDetected { .. })
    }

    /// The decoherence code, when this is a decoherence error.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Decoherence(e) => Some(e.code()),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for LoomError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Sqlite(e))
    }
}

pub type Result<T> = std::result::Result<T, LoomError>;
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let b = BranchId::new();
        assert_eq!(
            DecoherenceError::StaleParent { branch: b, expected: None, actual: None }.code(),
            "STALE_PARENT"
        );
        assert_eq!(DecoherenceError::BranchDecoherent(b).code(), "BRANCH_DECOHERENT");
        assert_eq!(DecoherenceError::NoPrimary { family: b }.code(), "NO_PRIMARY");

        let wrapped: LoomError = DecoherenceError::PrimaryConflict { branch: b, existing: b }.into();
        assert_eq!(wrapped.code(), Some("PRIMARY_CONFLICT"));
        assert!(!wrapped.is_structural());
    }

    #[test]
    fn test_structural_classification() {
        let err = LoomError::MissingParent { branch: BranchId::new(), parent: EventId::new() };
        assert!(err.is_structural());
        assert_eq!(err.code(), None);
    }
}
