//! The client-held timeline cursor.

use serde::{Deserialize, Serialize};

use crate::ids::{BranchId, EventId};

/// Cursor threaded through every call that touches a branch.
///
/// Not authoritative: the branch may have advanced, been demoted, or been
/// marked decoherent since this was issued, so the kernel re-validates it on
/// every use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimelineContext {
    pub branch_id: BranchId,
    pub is_primary: bool,
    /// Last event the holder has observed on `branch_id`.
    pub last_event_id: EventId,
    pub root_branch_id: BranchId,
}

impl TimelineContext {
    pub fn new(branch_id: BranchId, is_primary: bool, last_event_id: EventId, root_branch_id: BranchId) -> Self {
        Self { branch_id, is_primary, last_event_id, root_branch_id }
    }

    /// Same branch, cursor moved to `event_id`.
    pub fn advanced_to(self, event_id: EventId) -> Self {
        Self { last_event_id: event_id, ..self }
    }

    pub fn is_root_branch(&self) -> bool {
        self.branch_id == self.root_branch_id
    }
}
