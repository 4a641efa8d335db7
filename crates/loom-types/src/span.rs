//! Connection spans: recorded intervals of uplink attachment.
//!
//! A span is the only thing the uplink side persists about a remote branch.
//! The remote events inside it are fetched on demand.

use serde::{Deserialize, Serialize};

use crate::ids::{BranchId, EventId, SpaceId, SpanId};

/// One contiguous period an uplink was attached to a remote branch.
///
/// The window is `(start_event_id, end_event_id]`: the remote head at attach
/// time is the exclusive lower bound, the head at detach the inclusive upper.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpan {
    pub id: SpanId,
    pub remote_space_id: SpaceId,
    pub remote_branch_id: BranchId,
    pub start_event_id: EventId,
    /// Unix millis.
    pub start_time: u64,
    pub end_event_id: Option<EventId>,
    pub end_time: Option<u64>,
    pub is_active: bool,
}

impl ConnectionSpan {
    /// Open a span anchored at the remote head `start_event_id`.
    pub fn open(remote_space_id: SpaceId, remote_branch_id: BranchId, start_event_id: EventId, start_time: u64) -> Self {
        Self {
            id: SpanId::new(),
            remote_space_id,
            remote_branch_id,
            start_event_id,
            start_time,
            end_event_id: None,
            end_time: None,
            is_active: true,
        }
    }

    /// Close the span at `end_event_id`. No-op if already closed.
    pub fn close(&mut self, end_event_id: EventId, end_time: u64) {
        if !self.is_active {
            return;
        }
        self.end_event_id = Some(end_event_id);
        self.end_time = Some(end_time.max(self.start_time));
        self.is_active = false;
    }

    /// Whether the window holds no events (closed at its own anchor).
    pub fn is_empty(&self) -> bool {
        self.end_event_id == Some(self.start_event_id)
    }

    /// Time the span last saw activity: its end, or `now` while active.
    pub fn last_active_at(&self, now: u64) -> u64 {
        self.end_time.unwrap_or(now)
    }

    /// Whether `[start, end]` intersects `[from, to]`.
    pub fn overlaps(&self, from: u64, to: u64) -> bool {
        let end = self.end_time.unwrap_or(u64::MAX);
        self.start_time <= to && from <= end
    }
}
