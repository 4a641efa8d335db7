//! Renderable elements and the render capability.
//!
//! Everything the engine compresses is a [`RenderElement`]: a closed set of
//! kinds, each with a text or conversation body. Object-type collaborators
//! plug in through the [`Render`] trait, registered per object type prefix
//! the same way reducers are.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use loom_types::{CompressionHint, Event, EventId, EventKind, MessageRole, ObjectState, SpanId};

/// What an element represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ElementKind {
    /// Projected state of a local object.
    Object,
    /// A local conversation.
    Conversation,
    /// Events fetched for a remote connection span.
    RemoteBundle,
    /// Free text (instructions, banners).
    Note,
}

/// One message in a conversation body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub event_id: EventId,
    pub role: MessageRole,
    pub text: String,
    pub in_reply_to: Option<EventId>,
    /// Unix millis.
    pub timestamp: u64,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, text: impl Into<String>, timestamp: u64) -> Self {
        Self {
            event_id: EventId::new(),
            role,
            text: text.into(),
            in_reply_to: None,
            timestamp,
        }
    }

    pub fn replying_to(mut self, request: EventId) -> Self {
        self.in_reply_to = Some(request);
        self
    }

    /// Any event as a message. Non-message events become notes.
    pub fn from_event(event: &Event) -> Self {
        let (role, text) = match event.message_role() {
            Some(role) => (role, event.text()),
            None => (MessageRole::Note, format!("[{}] {}", event.kind, event.text())),
        };
        Self {
            event_id: event.id,
            role,
            text,
            in_reply_to: if event.kind == EventKind::Message { event.in_reply_to() } else { None },
            timestamp: event.timestamp,
        }
    }

    pub fn render_line(&self) -> String {
        format!("{}: {}", self.role, self.text)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum ElementBody {
    Text(String),
    Conversation(Vec<ConversationMessage>),
}

/// The remote span an element was fetched for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanBacking {
    pub span_id: SpanId,
    /// Unix millis. `None` while the span is still active.
    pub ended_at: Option<u64>,
}

/// A unit the compression engine can shrink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenderElement {
    /// Caller-chosen, unique within one compression request.
    pub id: String,
    pub kind: ElementKind,
    pub body: ElementBody,
    /// Unix millis of the newest content. Drives the recency fallback.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<CompressionHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<SpanBacking>,
}

impl RenderElement {
    pub fn text(id: impl Into<String>, kind: ElementKind, text: impl Into<String>, timestamp: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            body: ElementBody::Text(text.into()),
            timestamp,
            hint: None,
            span: None,
        }
    }

    pub fn conversation(id: impl Into<String>, kind: ElementKind, messages: Vec<ConversationMessage>) -> Self {
        let timestamp = messages.iter().map(|m| m.timestamp).max().unwrap_or(0);
        Self {
            id: id.into(),
            kind,
            body: ElementBody::Conversation(messages),
            timestamp,
            hint: None,
            span: None,
        }
    }

    pub fn with_hint(mut self, hint: CompressionHint) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn backed_by(mut self, span_id: SpanId, ended_at: Option<u64>) -> Self {
        self.span = Some(SpanBacking { span_id, ended_at });
        self
    }

    pub fn preserve_verbatim(&self) -> bool {
        self.hint.as_ref().is_some_and(|h| h.preserve_verbatim)
    }
}

// ============================================================================
// Render capability
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderOptions {
    pub hint: Option<CompressionHint>,
    /// Unix millis to stamp the element with when the state carries none.
    pub timestamp: u64,
}

/// Turns projected object state into an element.
pub trait Render: Send + Sync {
    fn render(&self, state: &ObjectState, options: &RenderOptions) -> RenderElement;
}

/// Default renderer: the object's JSON value as pretty text.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRenderer;

impl Render for JsonRenderer {
    fn render(&self, state: &ObjectState, options: &RenderOptions) -> RenderElement {
        let text = serde_json::to_string_pretty(&state.value).unwrap_or_else(|_| state.value.to_string());
        let mut element = RenderElement::text(
            state.object_id.as_str(),
            ElementKind::Object,
            format!("{} (v{})\n{}", state.object_id, state.version, text),
            options.timestamp,
        );
        element.hint = options.hint.clone();
        element
    }
}

/// Renderers keyed by object type prefix, with a fallback.
#[derive(Clone)]
pub struct RendererRegistry {
    by_prefix: HashMap<String, Arc<dyn Render>>,
    fallback: Arc<dyn Render>,
}

impl Default for RendererRegistry {
    fn default() -> Self {
        Self { by_prefix: HashMap::new(), fallback: Arc::new(JsonRenderer) }
    }
}

impl std::fmt::Debug for RendererRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererRegistry")
            .field("prefixes", &self.by_prefix.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RendererRegistry {
    pub fn register(&mut self, prefix: impl Into<String>, renderer: Arc<dyn Render>) {
        self.by_prefix.insert(prefix.into(), renderer);
    }

    pub fn render(&self, state: &ObjectState, options: &RenderOptions) -> RenderElement {
        self.by_prefix
            .get(state.object_id.type_prefix())
            .unwrap_or(&self.fallback)
            .render(state, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_types::{BranchId, ObjectId, PrincipalId};
    use serde_json::json;

    #[test]
    fn test_message_from_event() {
        let request = EventId::new();
        let event = Event {
            id: EventId::new(),
            parent_id: None,
            merge_parents: vec![],
            branch_id: BranchId::new(),
            kind: EventKind::Message,
            payload: json!({"role": "assistant", "text": "hi", "in_reply_to": request.to_string()}),
            timestamp: 5,
            object_id: None,
            author: PrincipalId::system(),
            origin: None,
        };
        let msg = ConversationMessage::from_event(&event);
        assert_eq!(msg.role, MessageRole::Response);
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.in_reply_to, Some(request));
        assert_eq!(msg.render_line(), "response: hi");

        let action = Event { kind: EventKind::Action, payload: json!({"n": 1}), ..event };
        let note = ConversationMessage::from_event(&action);
        assert_eq!(note.role, MessageRole::Note);
        assert_eq!(note.in_reply_to, None);
        assert!(note.text.starts_with("[action]"));
    }

    struct Shouty;
    impl Render for Shouty {
        fn render(&self, state: &ObjectState, options: &RenderOptions) -> RenderElement {
            RenderElement::text(state.object_id.as_str(), ElementKind::Note, "LOUD", options.timestamp)
        }
    }

    #[test]
    fn test_registry_dispatch() {
        let mut registry = RendererRegistry::default();
        registry.register("alarm", Arc::new(Shouty));
        let options = RenderOptions { hint: Some(CompressionHint::verbatim()), timestamp: 9 };

        let loud = registry.render(&ObjectState::empty(ObjectId::from("alarm:1")), &options);
        assert_eq!(loud.body, ElementBody::Text("LOUD".into()));

        let doc = registry.render(&ObjectState::empty(ObjectId::from("doc:1")), &options);
        assert_eq!(doc.kind, ElementKind::Object);
        assert!(doc.preserve_verbatim());
        assert_eq!(doc.timestamp, 9);
    }
}
