//! Immutable log events.
//!
//! An `Event` is written exactly once by the event log and never mutated.
//! Every event except a branch root names exactly one parent; the single
//! exception is `timeline_merge`, which additionally records the source
//! branch head in `merge_parents`.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ids::{BranchId, EventId, ObjectId, PrincipalId};

/// Closed set of event kinds understood by the core.
///
/// `Custom` carries activity-layer kinds the core treats opaquely.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// First event of the root branch.
    BranchRoot,
    /// Generic activity-layer action against an object.
    Action,
    /// Replace an object's value wholesale.
    StateSet,
    /// Shallow-merge keys into an object's value.
    StatePatch,
    /// Conversational message (request/response), see [`MessageRole`].
    Message,
    /// First event of a forked branch.
    TimelineFork,
    /// Join point written into a merge target.
    TimelineMerge,
    /// Opaque kind owned by a collaborator.
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::BranchRoot => "branch_root",
            EventKind::Action => "action",
            EventKind::StateSet => "state_set",
            EventKind::StatePatch => "state_patch",
            EventKind::Message => "message",
            EventKind::TimelineFork => "timeline_fork",
            EventKind::TimelineMerge => "timeline_merge",
            EventKind::Custom(s) => s,
        }
    }

    /// Parse the string form. Unknown names become `Custom`.
    pub fn parse(s: &str) -> Self {
        match s {
            "branch_root" => EventKind::BranchRoot,
            "action" => EventKind::Action,
            "state_set" => EventKind::StateSet,
            "state_patch" => EventKind::StatePatch,
            "message" => EventKind::Message,
            "timeline_fork" => EventKind::TimelineFork,
            "timeline_merge" => EventKind::TimelineMerge,
            other => EventKind::Custom(other.to_string()),
        }
    }

    /// Kinds written by the core itself rather than submitted by callers.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            EventKind::BranchRoot | EventKind::TimelineFork | EventKind::TimelineMerge
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a conversational message inside a thread.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum MessageRole {
    /// Originating message that expects an answer.
    #[default]
    #[strum(to_string = "request", serialize = "user", serialize = "question")]
    Request,
    /// Answer to an earlier request.
    #[strum(to_string = "response", serialize = "assistant", serialize = "answer")]
    Response,
    /// Standalone message with no request/response pairing.
    Note,
}

/// An immutable log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// `None` only for a branch root.
    pub parent_id: Option<EventId>,
    /// Additional parents; non-empty only for `timeline_merge`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge_parents: Vec<EventId>,
    pub branch_id: BranchId,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    /// Unix millis.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<ObjectId>,
    pub author: PrincipalId,
    /// For events copied by a merge: the source event they re-parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<EventId>,
}

impl Event {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// All parents, first parent first.
    pub fn parents(&self) -> impl Iterator<Item = EventId> + '_ {
        self.parent_id.into_iter().chain(self.merge_parents.iter().copied())
    }

    /// Message role, when this is a `message` event.
    pub fn message_role(&self) -> Option<MessageRole> {
        if self.kind != EventKind::Message {
            return None;
        }
        self.payload
            .get("role")
            .and_then(|r| r.as_str())
            .and_then(|r| r.parse().ok())
            .or(Some(MessageRole::Note))
    }

    /// The event this message answers or follows up, if any.
    pub fn in_reply_to(&self) -> Option<EventId> {
        self.payload
            .get("in_reply_to")
            .and_then(|v| v.as_str())
            .and_then(|s| EventId::parse(s).ok())
    }

    /// Human-readable body: `payload.text` if present, else compact JSON.
    pub fn text(&self) -> String {
        match self.payload.get("text").and_then(|t| t.as_str()) {
            Some(text) => text.to_string(),
            None => self.payload.to_string(),
        }
    }
}

/// An event as submitted, before the log assigns identity and lineage.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub object_id: Option<ObjectId>,
    pub author: PrincipalId,
    /// Overrides the log's clock; used when copying events during a merge.
    pub timestamp: Option<u64>,
    pub origin: Option<EventId>,
    pub merge_parents: Vec<EventId>,
}

impl NewEvent {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            object_id: None,
            author: PrincipalId::system(),
            timestamp: None,
            origin: None,
            merge_parents: Vec::new(),
        }
    }

    pub fn on_object(mut self, object_id: impl Into<ObjectId>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    pub fn by(mut self, author: PrincipalId) -> Self {
        self.author = author;
        self
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Copy of an existing event, re-parented by the log on append.
    pub fn copy_of(event: &Event) -> Self {
        Self {
            kind: event.kind.clone(),
            payload: event.payload.clone(),
            object_id: event.object_id.clone(),
            author: event.author,
            timestamp: Some(event.timestamp),
            origin: Some(event.origin.unwrap_or(event.id)),
            merge_parents: Vec::new(),
        }
    }

    /// Conversational message helper.
    pub fn message(role: MessageRole, text: impl Into<String>, in_reply_to: Option<EventId>) -> Self {
        let mut payload = serde_json::json!({
            "role": role.to_string(),
            "text": text.into(),
        });
        if let Some(parent) = in_reply_to {
            payload["in_reply_to"] = serde_json::Value::String(parent.to_string());
        }
        Self::new(EventKind::Message, payload)
    }
}

// ============================================================================
// Tests
// ============================================================================
