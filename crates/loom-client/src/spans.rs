//! Connection span tracking.
//!
//! A span is the only local record of an attachment to a remote branch: where
//! it started, where it ended, and (while active) the newest remote head seen
//! through broadcasts. Individual remote events are never stored; they are
//! fetched again on demand by [`Uplink::history_bundle`](crate::Uplink::history_bundle).

use std::collections::BTreeMap;

use parking_lot::RwLock;

use loom_types::{BranchId, BroadcastEvent, ConnectionSpan, EventId, SpaceId, SpanId};

use crate::error::ConnectionError;

#[derive(Debug, Clone)]
struct Tracked {
    span: ConnectionSpan,
    remote_head: EventId,
}

#[derive(Debug, Default)]
pub struct ConnectionSpanTracker {
    spans: RwLock<BTreeMap<SpanId, Tracked>>,
}

impl ConnectionSpanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an active span anchored at the remote branch's current head.
    pub fn open(&self, remote_space: SpaceId, remote_branch: BranchId, head: EventId, now: u64) -> ConnectionSpan {
        let span = ConnectionSpan::open(remote_space, remote_branch, head, now);
        self.spans
            .write()
            .insert(span.id, Tracked { span: span.clone(), remote_head: head });
        tracing::debug!(span = %span.id, space = %remote_space, branch = %remote_branch, %head, "span opened");
        span
    }

    /// Move the head of every active span watching the event's branch.
    /// Returns how many spans moved.
    pub fn observe(&self, broadcast: &BroadcastEvent) -> usize {
        let mut spans = self.spans.write();
        let mut moved = 0;
        for tracked in spans.values_mut() {
            let span = &tracked.span;
            if span.is_active
                && span.remote_space_id == broadcast.space_id
                && span.remote_branch_id == broadcast.event.branch_id
            {
                tracked.remote_head = broadcast.event.id;
                moved += 1;
            }
        }
        moved
    }

    /// Set the tracked head of one active span.
    pub fn advance(&self, id: SpanId, head: EventId) -> Result<(), ConnectionError> {
        let mut spans = self.spans.write();
        let tracked = spans.get_mut(&id).ok_or(ConnectionError::UnknownSpan(id))?;
        if tracked.span.is_active {
            tracked.remote_head = head;
        }
        Ok(())
    }

    /// Newest remote head known for the span: the tracked head while active,
    /// the end event once closed.
    pub fn remote_head(&self, id: SpanId) -> Option<EventId> {
        let spans = self.spans.read();
        let tracked = spans.get(&id)?;
        Some(tracked.span.end_event_id.unwrap_or(tracked.remote_head))
    }

    /// Close the span at its tracked head. Closing twice returns the span as
    /// first closed.
    pub fn close(&self, id: SpanId, now: u64) -> Result<ConnectionSpan, ConnectionError> {
        let mut spans = self.spans.write();
        let tracked = spans.get_mut(&id).ok_or(ConnectionError::UnknownSpan(id))?;
        let head = tracked.remote_head;
        tracked.span.close(head, now);
        tracing::debug!(span = %id, end = %head, "span closed");
        Ok(tracked.span.clone())
    }

    pub fn get(&self, id: SpanId) -> Option<ConnectionSpan> {
        self.spans.read().get(&id).map(|t| t.span.clone())
    }

    /// All spans, oldest first.
    pub fn spans(&self) -> Vec<ConnectionSpan> {
        self.spans.read().values().map(|t| t.span.clone()).collect()
    }

    pub fn active(&self) -> Vec<ConnectionSpan> {
        self.spans
            .read()
            .values()
            .filter(|t| t.span.is_active)
            .map(|t| t.span.clone())
            .collect()
    }

    pub fn for_space(&self, space: SpaceId) -> Vec<ConnectionSpan> {
        self.spans
            .read()
            .values()
            .filter(|t| t.span.remote_space_id == space)
            .map(|t| t.span.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.spans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reload closed spans saved from an earlier session. Active spans are
    /// skipped: their sessions did not survive.
    pub fn restore(&self, spans: impl IntoIterator<Item = ConnectionSpan>) -> usize {
        let mut map = self.spans.write();
        let mut restored = 0;
        for span in spans.into_iter().filter(|s| !s.is_active) {
            let head = span.end_event_id.unwrap_or(span.start_event_id);
            map.insert(span.id, Tracked { span, remote_head: head });
            restored += 1;
        }
        restored
    }
}
