//! Per-branch object state, derived by folding the event log.
//!
//! Each branch has one view: the object states folded up to some event on
//! the branch's first-parent chain. Reading a branch whose head has moved
//! folds only the new events; a cache miss, a gap in the chain, or an
//! interleaving merge among the new events triggers a full replay from the
//! space root instead.
//!
//! States are stored as `Arc<ObjectState>` and never mutated in place, so a
//! fork copies the parent's map of pointers and the two branches diverge by
//! replacing entries, never by writing through a shared one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use loom_types::{BranchId, Event, EventId, EventKind, ObjectId, ObjectState};

use crate::branches::{MergeRecord, MergeStrategyKind};
use crate::error::{DecoherenceError, LoomError, Result};
use crate::event_log::EventLog;
use crate::reducer::ReducerRegistry;

type Objects = HashMap<ObjectId, Arc<ObjectState>>;

#[derive(Default)]
struct BranchView {
    folded_to: Option<EventId>,
    objects: Objects,
}

/// Derives and caches `ObjectState` per `(object, branch)`.
pub struct StateProjector {
    views: DashMap<BranchId, Arc<RwLock<BranchView>>>,
    reducers: ReducerRegistry,
}

impl std::fmt::Debug for StateProjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateProjector")
            .field("views", &self.views.len())
            .field("reducers", &self.reducers)
            .finish()
    }
}

impl Default for StateProjector {
    fn default() -> Self {
        Self::new(ReducerRegistry::default())
    }
}

impl StateProjector {
    pub fn new(reducers: ReducerRegistry) -> Self {
        Self { views: DashMap::new(), reducers }
    }

    fn view(&self, branch: BranchId) -> Arc<RwLock<BranchView>> {
        self.views.entry(branch).or_default().clone()
    }

    /// State of `object` on `branch` as of the branch head.
    ///
    /// Objects no event has touched project to [`ObjectState::empty`].
    #[tracing::instrument(skip(self, log), name = "loom.state_of", fields(object = %object, branch = %branch))]
    pub fn state_of(&self, log: &EventLog, object: &ObjectId, branch: BranchId) -> Result<ObjectState> {
        let head = log.head(branch).ok_or(DecoherenceError::UnknownBranch(branch))?;
        let view = self.view(branch);
        {
            let v = view.read();
            if v.folded_to == Some(head) {
                return Ok(lookup(&v.objects, object));
            }
        }
        let mut v = view.write();
        self.catch_up(log, branch, &mut v)?;
        Ok(lookup(&v.objects, object))
    }

    /// Every object with at least one folded event on `branch`.
    pub fn objects(&self, log: &EventLog, branch: BranchId) -> Result<Vec<ObjectState>> {
        self.advance(log, branch)?;
        let view = self.view(branch);
        let v = view.read();
        let mut states: Vec<_> = v.objects.values().map(|s| (**s).clone()).collect();
        states.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        Ok(states)
    }

    /// Fold any events `branch` has gained since the last read.
    pub fn advance(&self, log: &EventLog, branch: BranchId) -> Result<()> {
        let view = self.view(branch);
        let mut v = view.write();
        self.catch_up(log, branch, &mut v)
    }

    /// Seed `child`'s view from `parent`'s, when the parent's view sits
    /// exactly at `fork_point`. Otherwise the child replays on first read.
    pub fn fork(&self, log: &EventLog, parent: BranchId, child: BranchId, fork_point: EventId) -> Result<bool> {
        if log.head(parent) == Some(fork_point) {
            self.advance(log, parent)?;
        }
        let snapshot = {
            let view = self.view(parent);
            let v = view.read();
            (v.folded_to == Some(fork_point)).then(|| v.objects.clone())
        };
        let seeded = snapshot.is_some();
        if let Some(objects) = snapshot {
            let view = BranchView { folded_to: Some(fork_point), objects };
            self.views.insert(child, Arc::new(RwLock::new(view)));
        }
        tracing::debug!(parent = %parent, child = %child, seeded, "fork view");
        Ok(seeded)
    }

    /// Drop the cached view of a pruned branch.
    pub fn forget(&self, branch: BranchId) {
        self.views.remove(&branch);
    }

    /// Event the branch's cached view is folded to, if any.
    pub fn cached_head(&self, branch: BranchId) -> Option<EventId> {
        self.views.get(&branch).and_then(|v| v.read().folded_to)
    }

    fn catch_up(&self, log: &EventLog, branch: BranchId, view: &mut BranchView) -> Result<()> {
        let head = log.head(branch).ok_or(DecoherenceError::UnknownBranch(branch))?;
        if view.folded_to == Some(head) {
            return Ok(());
        }

        let pending = match view.folded_to {
            Some(cursor) => log.chain_between(head, Some(cursor))?,
            None => None,
        };
        match pending {
            Some(events) if !events.iter().any(|e| needs_replay(e)) => {
                for event in &events {
                    self.fold(&mut view.objects, event)?;
                }
                tracing::trace!(branch = %branch, folded = events.len(), "incremental fold");
            }
            _ => {
                view.objects = self.replay(log, head)?;
                tracing::debug!(branch = %branch, head = %head, "full replay");
            }
        }
        view.folded_to = Some(head);
        Ok(())
    }

    /// Fold the whole first-parent chain ending at `head`.
    fn replay(&self, log: &EventLog, head: EventId) -> Result<Objects> {
        let chain = log.chain_between(head, None)?.unwrap_or_default();

        // Interleaving merges rewind to their common ancestor's state.
        let mut wanted = HashSet::new();
        for event in chain.iter().filter(|e| e.kind == EventKind::TimelineMerge) {
            let record = MergeRecord::from_event(event)?;
            if record.strategy == MergeStrategyKind::Interleave {
                wanted.insert(record.common_ancestor);
            }
        }

        let mut objects = Objects::new();
        let mut checkpoints: HashMap<EventId, Objects> = HashMap::new();
        for event in &chain {
            if event.kind == EventKind::TimelineMerge {
                let record = MergeRecord::from_event(event)?;
                if record.strategy == MergeStrategyKind::Interleave {
                    objects = checkpoints.get(&record.common_ancestor).cloned().ok_or_else(|| {
                        LoomError::InvalidEvent(format!(
                            "merge {} rewinds to {} which is not on its chain",
                            event.id, record.common_ancestor
                        ))
                    })?;
                    for id in &record.sequence {
                        let replayed = log.require(*id)?;
                        self.fold(&mut objects, &replayed)?;
                    }
                } else {
                    self.fold(&mut objects, event)?;
                }
            } else {
                self.fold(&mut objects, event)?;
            }
            if wanted.contains(&event.id) {
                checkpoints.insert(event.id, objects.clone());
            }
        }
        Ok(objects)
    }

    fn fold(&self, objects: &mut Objects, event: &Event) -> Result<()> {
        if event.kind == EventKind::TimelineMerge {
            let record = MergeRecord::from_event(event)?;
            if let Some(resolved) = record.resolved_objects() {
                for (object_id, value) in resolved {
                    let current = lookup(objects, &object_id);
                    let next = self.reducers.assign(&current, value, event);
                    objects.insert(object_id, Arc::new(next));
                }
            }
            return Ok(());
        }
        let Some(object_id) = &event.object_id else {
            return Ok(());
        };
        let current = objects
            .get(object_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(ObjectState::empty(object_id.clone())));
        let next = self.reducers.fold(&current, event);
        objects.insert(object_id.clone(), Arc::new(next));
        Ok(())
    }
}

fn lookup(objects: &Objects, object: &ObjectId) -> ObjectState {
    objects
        .get(object)
        .map(|s| (**s).clone())
        .unwrap_or_else(|| ObjectState::empty(object.clone()))
}

fn needs_replay(event: &Event) -> bool {
    event.kind == EventKind::TimelineMerge
        && MergeRecord::from_event(event).is_ok_and(|r| r.strategy == MergeStrategyKind::Interleave)
}

// ============================================================================
// Tests
// ============================================================================
