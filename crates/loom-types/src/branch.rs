//! Branch (timeline) metadata.
//!
//! A `Branch` is the birth certificate of one causal line of events within a
//! space: where it forked from, who made it, and its two flags. The events
//! themselves live in the event log.

use serde::{Deserialize, Serialize};

use crate::ids::{BranchId, EventId, PrincipalId};

/// Metadata for a branch within a space.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    /// Human-friendly label ("primary", "f1"). Never a lookup key on the wire.
    pub label: Option<String>,
    /// `None` for the root branch.
    pub parent_branch_id: Option<BranchId>,
    /// Event in the parent branch this branch forked at. `None` for the root.
    pub fork_point_event_id: Option<EventId>,
    /// Externally authoritative branch. At most one per sibling set.
    pub is_primary: bool,
    /// Unix millis.
    pub created_at: u64,
    pub creator: PrincipalId,
    /// Why the fork was made, as given by the caller.
    pub reason: Option<String>,
    /// Set on structural violation; never implicitly cleared.
    pub decoherent: bool,
}

impl Branch {
    /// Metadata for a space's root branch. Roots start out primary.
    pub fn root(label: Option<String>, creator: PrincipalId) -> Self {
        Self {
            id: BranchId::new(),
            label,
            parent_branch_id: None,
            fork_point_event_id: None,
            is_primary: true,
            created_at: crate::now_millis(),
            creator,
            reason: None,
            decoherent: false,
        }
    }

    /// Metadata for a fork of `parent` at `fork_point`. Forks start non-primary.
    pub fn fork(
        parent: BranchId,
        fork_point: EventId,
        label: Option<String>,
        reason: Option<String>,
        creator: PrincipalId,
    ) -> Self {
        Self {
            id: BranchId::new(),
            label,
            parent_branch_id: Some(parent),
            fork_point_event_id: Some(fork_point),
            is_primary: false,
            created_at: crate::now_millis(),
            creator,
            reason,
            decoherent: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_branch_id.is_none()
    }

    /// Display string: label if present, otherwise short hex ID.
    pub fn display_name(&self) -> String {
        self.id.display_or(self.label.as_deref())
    }
}

/// Walk a parent chain to collect branch lineage, starting branch first.
///
/// Stops at the root, at an unknown parent, or on a repeated ID.
pub fn branch_lineage<'a>(
    lookup: impl Fn(BranchId) -> Option<&'a Branch>,
    start: BranchId,
) -> Vec<&'a Branch> {
    let mut chain = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut current = Some(start);
    while let Some(id) = current {
        if !seen.insert(id) {
            break; // cycle
        }
        match lookup(id) {
            Some(branch) => {
                chain.push(branch);
                current = branch.parent_branch_id;
            }
            None => break,
        }
    }
    chain
}
