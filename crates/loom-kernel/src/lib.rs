//! # loom-kernel
//!
//! The per-space core of Loom.
//!
//! A space is one append-only event DAG split into branches. The kernel:
//! - Appends events with a compare-and-swap on the branch head
//! - Re-validates every client-held timeline context before use
//! - Projects object state per branch by folding events, incrementally
//! - Forks (cloning projected state, not history) and merges branches
//! - Fans changes out to subscribers, keeping non-primary changes in-process
//!
//! Many spaces run side by side under a [`Loom`] registry.

pub mod branches;
pub mod coherence;
pub mod config;
pub mod error;
pub mod event_log;
pub mod hub;
pub mod loom;
pub mod projector;
pub mod reducer;
pub mod space;
pub mod store;

pub use branches::{BranchManager, ForkOptions, MergeRecord, MergeStrategy, MergeStrategyKind};
pub use coherence::CoherenceValidator;
pub use config::{LoomConfig, UplinkConfig};
pub use error::{DecoherenceError, LoomError, Result, StorageError, StorageResult};
pub use event_log::{Ancestors, EventLog};
pub use hub::{
    ChangeDescriptor, ChangeSubject, ExternalMessage, ExternalSink, NotificationHub, Subscription,
    matches_pattern,
};
pub use loom::Loom;
pub use projector::StateProjector;
pub use reducer::{JsonReducer, Reducer, ReducerRegistry};
pub use space::{Space, Submission};
pub use store::{LogStore, MemoryStore, SqliteStore};
