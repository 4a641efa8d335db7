//! Change notification fan-out.
//!
//! Every subscriber owns an unbounded queue, so a publish never waits on a
//! consumer and nothing is dropped. Per-subscriber delivery follows publish
//! order. Subscribers filter by NATS-style subject pattern:
//!
//! - `*` matches exactly one token: `branch.*` matches `branch.forked`
//! - `>` matches one or more trailing tokens: `state.>` matches `state.changed`
//! - anything else must match exactly
//!
//! # Internal vs external
//!
//! Internal subscribers (a consumer rendering a fork, a shell) see every
//! change. External subscribers stand in front of outward-facing
//! propagation and only ever receive changes whose context is primary.
//! The check happens here at fan-out, not in the subscriber.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use tokio::sync::mpsc;

use loom_types::{BranchId, EventId, ObjectId, SpaceId, TimelineContext};

// ============================================================================
// Pattern Matching
// ============================================================================

/// Whether `subject` matches the NATS-style `pattern`.
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;
    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            // `>` is only valid last, and needs at least one token left
            ">" => return pi == pattern_tokens.len() - 1,
            "*" => {}
            token if token != subject_tokens[si] => return false,
            _ => {}
        }
        pi += 1;
        si += 1;
    }
    pi == pattern_tokens.len() && si == subject_tokens.len()
}

// ============================================================================
// Change descriptors
// ============================================================================

/// What changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr)]
pub enum ChangeSubject {
    #[strum(serialize = "state.changed")]
    #[serde(rename = "state.changed")]
    StateChanged,
    #[strum(serialize = "branch.forked")]
    #[serde(rename = "branch.forked")]
    BranchForked,
    #[strum(serialize = "branch.merged")]
    #[serde(rename = "branch.merged")]
    BranchMerged,
    #[strum(serialize = "branch.primary")]
    #[serde(rename = "branch.primary")]
    BranchPrimary,
    #[strum(serialize = "branch.decoherent")]
    #[serde(rename = "branch.decoherent")]
    BranchDecoherent,
}

impl ChangeSubject {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// One published change.
///
/// `timeline_context` is the authoritative context after the change, and
/// its `is_primary` flag decides whether the change may leave the process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeDescriptor {
    pub subject: ChangeSubject,
    pub space_id: SpaceId,
    pub object_id: Option<ObjectId>,
    pub event_id: Option<EventId>,
    pub timeline_context: TimelineContext,
    /// Unix millis.
    pub changed_at: u64,
    /// Free-form detail for outward propagation.
    #[serde(default)]
    pub message: serde_json::Value,
}

impl ChangeDescriptor {
    pub fn new(subject: ChangeSubject, space_id: SpaceId, timeline_context: TimelineContext) -> Self {
        Self {
            subject,
            space_id,
            object_id: None,
            event_id: None,
            timeline_context,
            changed_at: loom_types::now_millis(),
            message: serde_json::Value::Null,
        }
    }

    pub fn object(mut self, object_id: ObjectId) -> Self {
        self.object_id = Some(object_id);
        self
    }

    pub fn event(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn message(mut self, message: serde_json::Value) -> Self {
        self.message = message;
        self
    }
}

/// Payload handed to an [`ExternalSink`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalMessage {
    pub space_id: SpaceId,
    pub object_id: Option<ObjectId>,
    pub message: serde_json::Value,
    pub timeline_context: TimelineContext,
}

impl From<&ChangeDescriptor> for ExternalMessage {
    fn from(change: &ChangeDescriptor) -> Self {
        Self {
            space_id: change.space_id,
            object_id: change.object_id.clone(),
            message: change.message.clone(),
            timeline_context: change.timeline_context,
        }
    }
}

/// Outward-facing propagation collaborator (a chat bridge, a webhook).
#[async_trait]
pub trait ExternalSink: Send + Sync {
    async fn propagate(&self, message: ExternalMessage);
}

// ============================================================================
// Hub
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubscriberClass {
    Internal,
    External,
}

struct Subscriber {
    id: u64,
    pattern: String,
    branch: Option<BranchId>,
    class: SubscriberClass,
    tx: mpsc::UnboundedSender<Arc<ChangeDescriptor>>,
    depth: Arc<AtomicUsize>,
    warned: AtomicBool,
}

impl Subscriber {
    fn wants(&self, branch: BranchId, change: &ChangeDescriptor) -> bool {
        if self.class == SubscriberClass::External && !change.timeline_context.is_primary {
            return false;
        }
        if self.branch.is_some_and(|b| b != branch) {
            return false;
        }
        matches_pattern(&self.pattern, change.subject.as_str())
    }
}

/// Fans published changes out to subscribers.
pub struct NotificationHub {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("subscribers", &self.subscribers.read().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl NotificationHub {
    /// `capacity` is the queue depth at which a slow subscriber is logged.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Internal subscription to every branch.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        self.register(pattern, None, SubscriberClass::Internal)
    }

    /// Internal subscription to one branch.
    pub fn subscribe_branch(&self, pattern: &str, branch: BranchId) -> Subscription {
        self.register(pattern, Some(branch), SubscriberClass::Internal)
    }

    /// External subscription: primary changes only.
    pub fn subscribe_external(&self, pattern: &str) -> Subscription {
        self.register(pattern, None, SubscriberClass::External)
    }

    fn register(&self, pattern: &str, branch: Option<BranchId>, class: SubscriberClass) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Arc::new(Subscriber {
            id,
            pattern: pattern.to_string(),
            branch,
            class,
            tx,
            depth: depth.clone(),
            warned: AtomicBool::new(false),
        }));
        tracing::debug!(subscriber = id, pattern, ?class, "subscribed");
        Subscription { id, pattern: pattern.to_string(), rx, depth }
    }

    /// Deliver `change` to every matching subscriber. Never blocks.
    ///
    /// Returns how many subscribers it was queued for.
    pub fn publish(&self, branch: BranchId, change: ChangeDescriptor) -> usize {
        let change = Arc::new(change);
        let mut delivered = 0;
        let mut closed = false;
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter().filter(|s| s.wants(branch, &change)) {
                if sub.tx.send(change.clone()).is_err() {
                    closed = true;
                    continue;
                }
                delivered += 1;
                let depth = sub.depth.fetch_add(1, Ordering::Relaxed) + 1;
                if depth > self.capacity && !sub.warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        subscriber = sub.id,
                        pattern = %sub.pattern,
                        depth,
                        "slow notification subscriber"
                    );
                } else if depth <= self.capacity / 2 {
                    sub.warned.store(false, Ordering::Relaxed);
                }
            }
        }
        if closed {
            self.subscribers.write().retain(|s| !s.tx.is_closed());
        }
        tracing::trace!(branch = %branch, subject = %change.subject, delivered, "published");
        delivered
    }

    /// Forward primary changes matching `pattern` to `sink` on a background
    /// task. The task ends when the hub is dropped or the handle aborted.
    pub fn attach_sink(&self, pattern: &str, sink: Arc<dyn ExternalSink>) -> tokio::task::JoinHandle<()> {
        let mut sub = self.subscribe_external(pattern);
        tokio::spawn(async move {
            while let Some(change) = sub.recv().await {
                // Checked at fan-out already; a sink must never see a fork.
                if !change.timeline_context.is_primary {
                    tracing::error!(subject = %change.subject, "non-primary change reached external path");
                    continue;
                }
                sink.propagate(ExternalMessage::from(change.as_ref())).await;
            }
        })
    }
}

/// Receiving end of a hub subscription.
pub struct Subscription {
    id: u64,
    pattern: String,
    rx: mpsc::UnboundedReceiver<Arc<ChangeDescriptor>>,
    depth: Arc<AtomicUsize>,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next change, waiting if necessary. `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Arc<ChangeDescriptor>> {
        let change = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(change)
    }

    /// Next change if one is queued.
    pub fn try_recv(&mut self) -> Option<Arc<ChangeDescriptor>> {
        let change = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(change)
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<Arc<ChangeDescriptor>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}
