//! Shared identity, event, and timeline types for Loom.
//!
//! This crate is the relational foundation: typed IDs, events, branch
//! metadata, timeline cursors, projected object state, connection spans,
//! compression hints, and the uplink wire messages. It has **no internal
//! loom dependencies**, so every other crate can build on it.
//!
//! # Entity-Relationship Overview
//!
//! ```text
//! Space (SpaceId) ← one event log and its branches
//!     └── contains Branch (BranchId, fork lineage via parent_branch_id)
//!             └── holds Events (EventId, parent chain back to branch_root)
//!             └── projects ObjectState per ObjectId
//!
//! TimelineContext ← client-held cursor {branch, is_primary, last_event, root}
//!
//! Uplink (SessionId) ← attachment to a remote space
//!     └── records ConnectionSpan (SpanId) per attach/detach
//! ```
//!
//! # Key Types
//!
//! |----------------------|-------------------------------------------------|
//! | Type                 | Purpose                                         |
//! |----------------------|-------------------------------------------------|
//! | [`Event`]            | Immutable log entry                             |
//! | [`NewEvent`]         | Event as submitted, before identity/lineage     |
//! | [`Branch`]           | Branch birth certificate + primary/decoherent   |
//! | [`TimelineContext`]  | Non-authoritative cursor threaded through calls |
//! | [`ObjectState`]      | Fold of an object's events along one branch     |
//! | [`ConnectionSpan`]   | One period of uplink attachment                 |
//! | [`CompressionHint`]  | Advisory compression metadata                   |
//! |----------------------|-------------------------------------------------|

pub mod ids;
pub mod event;
pub mod branch;
pub mod timeline;
pub mod state;
pub mod span;
pub mod hint;
pub mod protocol;

// Re-export primary types at crate root for convenience.
pub use ids::{BranchId, EventId, ObjectId, PrincipalId, SessionId, SpaceId, SpanId};
pub use ids::{PrefixError, resolve_branch_prefix};
pub use event::{Event, EventKind, MessageRole, NewEvent};
pub use branch::{Branch, branch_lineage};
pub use timeline::TimelineContext;
pub use state::ObjectState;
pub use span::ConnectionSpan;
pub use hint::CompressionHint;
pub use protocol::{
    ActionRequest, ActionResponse, ActionStatus, AgentCredentials, BroadcastEvent,
    ConnectRequest, ConnectResponse, ConnectStatus, ConnectionParams, ConnectionType,
    HistoryRequest, HistoryResponse, RejectReason, SpaceSummary,
};

/// Current time as Unix milliseconds. Used by constructors throughout Loom.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
