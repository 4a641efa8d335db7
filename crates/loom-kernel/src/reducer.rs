//! Object folding functions.
//!
//! A [`Reducer`] is the object-type collaborator: a pure, deterministic,
//! total function from `(state, event)` to the next value. The projector
//! owns ordering and bookkeeping (`version`, `last_event_id`); reducers only
//! compute values.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use loom_types::{Event, EventKind, ObjectState};

/// Folds one event into an object's value.
pub trait Reducer: Send + Sync {
    /// Next value for `state` after `event`. Must not panic on any input.
    fn apply(&self, state: &ObjectState, event: &Event) -> Value;
}

/// Default reducer for JSON-valued objects.
///
/// - `state_set` replaces the value with the payload
/// - `state_patch` shallow-merges object keys; `null` deletes a key
/// - anything else appends `{kind, payload}` to `value.history`
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonReducer;

impl Reducer for JsonReducer {
    fn apply(&self, state: &ObjectState, event: &Event) -> Value {
        match event.kind {
            EventKind::StateSet => event.payload.clone(),
            EventKind::StatePatch => {
                let mut map = as_object(&state.value);
                if let Value::Object(patch) = &event.payload {
                    for (key, value) in patch {
                        if value.is_null() {
                            map.remove(key);
                        } else {
                            map.insert(key.clone(), value.clone());
                        }
                    }
                }
                Value::Object(map)
            }
            _ => {
                let mut map = as_object(&state.value);
                let entry = serde_json::json!({
                    "kind": event.kind.as_str(),
                    "payload": event.payload,
                });
                match map.get_mut("history") {
                    Some(Value::Array(history)) => history.push(entry),
                    _ => {
                        map.insert("history".into(), Value::Array(vec![entry]));
                    }
                }
                Value::Object(map)
            }
        }
    }
}

fn as_object(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other.clone());
            map
        }
    }
}

/// Reducers keyed by object type prefix, with a fallback.
#[derive(Clone)]
pub struct ReducerRegistry {
    by_prefix: HashMap<String, Arc<dyn Reducer>>,
    fallback: Arc<dyn Reducer>,
}

impl Default for ReducerRegistry {
    fn default() -> Self {
        Self::new(Arc::new(JsonReducer))
    }
}

impl std::fmt::Debug for ReducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReducerRegistry")
            .field("prefixes", &self.by_prefix.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ReducerRegistry {
    pub fn new(fallback: Arc<dyn Reducer>) -> Self {
        Self { by_prefix: HashMap::new(), fallback }
    }

    /// Route objects named `"{prefix}:..."` to `reducer`.
    pub fn register(&mut self, prefix: impl Into<String>, reducer: Arc<dyn Reducer>) {
        self.by_prefix.insert(prefix.into(), reducer);
    }

    pub fn for_object(&self, state: &ObjectState) -> &dyn Reducer {
        self.by_prefix
            .get(state.object_id.type_prefix())
            .map(|r| r.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }

    /// Fold `event` into `state`, bumping version and cursor.
    pub fn fold(&self, state: &ObjectState, event: &Event) -> ObjectState {
        ObjectState {
            object_id: state.object_id.clone(),
            version: state.version + 1,
            last_event_id: Some(event.id),
            value: self.for_object(state).apply(state, event),
        }
    }

    /// Overwrite `state` with an explicit value, as a resolved merge does.
    pub fn assign(&self, state: &ObjectState, value: Value, by: &Event) -> ObjectState {
        ObjectState {
            object_id: state.object_id.clone(),
            version: state.version + 1,
            last_event_id: Some(by.id),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_types::{BranchId, EventId, NewEvent, ObjectId, PrincipalId};
    use serde_json::json;

    fn event(new: NewEvent) -> Event {
        Event {
            id: EventId::new(),
            parent_id: Some(EventId::new()),
            merge_parents: vec![],
            branch_id: BranchId::new(),
            kind: new.kind,
            payload: new.payload,
            timestamp: 1,
            object_id: new.object_id,
            author: PrincipalId::system(),
            origin: None,
        }
    }

    #[test]
    fn test_set_then_patch() {
        let registry = ReducerRegistry::default();
        let s0 = ObjectState::empty(ObjectId::from("doc:a"));
        let s1 = registry.fold(&s0, &event(NewEvent::new(EventKind::StateSet, json!({"a": 1, "b": 2}))));
        let s2 = registry.fold(&s1, &event(NewEvent::new(EventKind::StatePatch, json!({"b": null, "c": 3}))));
        assert_eq!(s2.value, json!({"a": 1, "c": 3}));
        assert_eq!(s2.version, 2);
    }

    #[test]
    fn test_actions_append_history() {
        let registry = ReducerRegistry::default();
        let s0 = ObjectState::empty(ObjectId::from("doc:a"));
        let s1 = registry.fold(&s0, &event(NewEvent::new(EventKind::Action, json!({"n": 1}))));
        let s2 = registry.fold(&s1, &event(NewEvent::new(EventKind::Action, json!({"n": 2}))));
        assert_eq!(
            s2.value["history"],
            json!([{"kind": "action", "payload": {"n": 1}}, {"kind": "action", "payload": {"n": 2}}])
        );
    }

    #[test]
    fn test_non_object_values_are_wrapped() {
        let registry = ReducerRegistry::default();
        let s0 = ObjectState::empty(ObjectId::from("doc:a"));
        let s1 = registry.fold(&s0, &event(NewEvent::new(EventKind::StateSet, json!(7))));
        let s2 = registry.fold(&s1, &event(NewEvent::new(EventKind::StatePatch, json!({"x": true}))));
        assert_eq!(s2.value, json!({"value": 7, "x": true}));
    }

    struct Counter;
    impl Reducer for Counter {
        fn apply(&self, state: &ObjectState, _event: &Event) -> Value {
            json!(state.value.as_u64().unwrap_or(0) + 1)
        }
    }

    #[test]
    fn test_prefix_routing() {
        let mut registry = ReducerRegistry::default();
        registry.register("counter", Arc::new(Counter));
        let counted = registry.fold(
            &ObjectState::empty("counter:clicks".into()),
            &event(NewEvent::new(EventKind::Action, json!({}))),
        );
        assert_eq!(counted.value, json!(1));

        let other = registry.fold(
            &ObjectState::empty("doc:x".into()),
            &event(NewEvent::new(EventKind::Action, json!({}))),
        );
        assert!(other.value.get("history").is_some());
    }
}
