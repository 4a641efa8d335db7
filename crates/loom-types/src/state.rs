//! Projected object state.

use serde::{Deserialize, Serialize};

use crate::ids::{EventId, ObjectId};

/// Fold of every event scoped to one object along one branch's ancestry.
///
/// Carries no branch ID: two branches forked from the same
/// point must hold equal states for every object at the fork instant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub object_id: ObjectId,
    /// Number of events folded into this state.
    pub version: u64,
    /// Last event applied, `None` before any event.
    pub last_event_id: Option<EventId>,
    pub value: serde_json::Value,
}

impl ObjectState {
    /// State of an object no event has touched yet.
    pub fn empty(object_id: ObjectId) -> Self {
        Self {
            object_id,
            version: 0,
            last_event_id: None,
            value: serde_json::Value::Null,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.version == 0
    }
}
