//! Timeline context validation.
//!
//! A [`TimelineContext`] is a client-held cursor and may be out of date by
//! the time it comes back. Every kernel entry point runs it through
//! [`CoherenceValidator::validate`] first.

use std::sync::Arc;

use loom_types::{Branch, TimelineContext};

use crate::branches::BranchManager;
use crate::error::{DecoherenceError, LoomError};
use crate::event_log::EventLog;

/// Decides whether an operation against a context's branch is legal.
#[derive(Clone, Debug)]
pub struct CoherenceValidator {
    log: Arc<EventLog>,
    branches: Arc<BranchManager>,
}

impl CoherenceValidator {
    pub fn new(log: Arc<EventLog>, branches: Arc<BranchManager>) -> Self {
        Self { log, branches }
    }

    /// Check `ctx` against the live log. Returns the branch metadata on success.
    ///
    /// Rules, in order:
    /// 1. the branch must be known and not decoherent
    /// 2. `root_branch_id` must be the branch's lineage root
    /// 3. `last_event_id` must be the head or one of its ancestors
    ///
    /// Structural anomalies found on the way (a head written by another
    /// branch, a cycle, a dangling parent) mark the branch decoherent.
    pub fn validate(&self, ctx: &TimelineContext) -> Result<Branch, DecoherenceError> {
        let id = ctx.branch_id;
        let branch = self.branches.get(id).ok_or(DecoherenceError::UnknownBranch(id))?;
        if branch.decoherent {
            return Err(DecoherenceError::BranchDecoherent(id));
        }

        let Some(head) = self.log.head(id) else {
            return Err(self.decohere(id, "branch has no head"));
        };
        let Some(head_event) = self.log.get(head) else {
            return Err(self.decohere(id, "head event missing from log"));
        };
        if head_event.branch_id != id {
            return Err(self.decohere(id, "head event belongs to another branch"));
        }

        let stale = DecoherenceError::StaleContext { branch: id, event: ctx.last_event_id, head };
        let root = self.branches.lineage(id).last().map(|b| b.id);
        if root != Some(ctx.root_branch_id) {
            return Err(stale);
        }

        match self.log.is_ancestor(ctx.last_event_id, head) {
            Ok(true) => Ok(branch),
            Ok(false) => Err(stale),
            Err(LoomError::Decoherence(e)) => Err(e),
            Err(e) => Err(self.decohere(id, &e.to_string())),
        }
    }

    fn decohere(&self, id: loom_types::BranchId, reason: &str) -> DecoherenceError {
        if let Err(e) = self.branches.mark_decoherent(id, reason) {
            tracing::error!(branch = %id, error = %e, "failed to mark branch decoherent");
        }
        DecoherenceError::BranchDecoherent(id)
    }
}
