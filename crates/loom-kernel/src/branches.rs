//! Branch lifecycle: fork, merge, primary designation, pruning.
//!
//! # Locking
//!
//! Structural operations (fork, merge, designate, prune) serialize on one
//! mutex per space. The branch table itself sits behind a read-write lock
//! that is only held for metadata reads and writes, so coherence checks on
//! other branches keep running while a fork or merge is in progress.
//!
//! # Merge strategies
//!
//! |--------------|------------------------------------------------------------|
//! | Strategy     | Effect on the target                                       |
//! |--------------|------------------------------------------------------------|
//! | `append`     | source events since divergence are copied onto the target, |
//! |              | in source order, then the merge event closes the run       |
//! | `interleave` | the merge event records both sides' events since the fork  |
//! |              | point, ordered by (timestamp, branch ID); projection       |
//! |              | rewinds to the fork point and folds that sequence          |
//! | `edit`       | the merge event carries a caller-supplied resolution;      |
//! |              | source events are referenced for audit, never folded       |
//! |--------------|------------------------------------------------------------|
//!
//! Every merge ends in exactly one `timeline_merge` event whose extra parent
//! is the source head.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use loom_types::{
    Branch, BranchId, Event, EventId, EventKind, NewEvent, ObjectId, PrincipalId, TimelineContext,
    branch_lineage,
};

use crate::error::{DecoherenceError, LoomError, Result};
use crate::event_log::EventLog;
use crate::projector::StateProjector;

// ============================================================================
// Merge records
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergeStrategyKind {
    Append,
    Interleave,
    Edit,
}

/// How a merge combines source into target.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeStrategy {
    Append,
    Interleave,
    /// `resolution` is stored verbatim. Its `objects` map, if any, assigns
    /// final values to objects on the target.
    Edit { resolution: Value },
}

impl MergeStrategy {
    pub fn kind(&self) -> MergeStrategyKind {
        match self {
            Self::Append => MergeStrategyKind::Append,
            Self::Interleave => MergeStrategyKind::Interleave,
            Self::Edit { .. } => MergeStrategyKind::Edit,
        }
    }
}

/// Payload of a `timeline_merge` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub strategy: MergeStrategyKind,
    pub source_branch: BranchId,
    pub source_head: EventId,
    pub common_ancestor: EventId,
    /// Interleave: events to fold after rewinding, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence: Vec<EventId>,
    /// Append: number of source events copied ahead of the merge event.
    #[serde(default)]
    pub copied: usize,
    /// Edit: the caller's resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Value>,
}

impl MergeRecord {
    pub fn from_event(event: &Event) -> Result<Self> {
        serde_json::from_value(event.payload.clone())
            .map_err(|e| LoomError::InvalidEvent(format!("merge {}: {e}", event.id)))
    }

    /// Object values an edit merge assigns.
    pub fn resolved_objects(&self) -> Option<Vec<(ObjectId, Value)>> {
        if self.strategy != MergeStrategyKind::Edit {
            return None;
        }
        let objects = self.resolution.as_ref()?.get("objects")?.as_object()?;
        Some(
            objects
                .iter()
                .map(|(id, value)| (ObjectId::from(id.as_str()), value.clone()))
                .collect(),
        )
    }
}

// ============================================================================
// Fork options
// ============================================================================

/// Caller-supplied fork metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct ForkOptions {
    pub creator: PrincipalId,
    pub reason: Option<String>,
    pub label: Option<String>,
}

impl ForkOptions {
    pub fn new(creator: PrincipalId) -> Self {
        Self { creator, reason: None, label: None }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

// ============================================================================
// BranchManager
// ============================================================================

/// Owns a space's branch table and every structural operation on it.
pub struct BranchManager {
    log: Arc<EventLog>,
    projector: Arc<StateProjector>,
    table: RwLock<HashMap<BranchId, Branch>>,
    structural: Mutex<()>,
}

impl std::fmt::Debug for BranchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchManager")
            .field("branches", &self.table.read().len())
            .finish_non_exhaustive()
    }
}

impl BranchManager {
    /// Load the branch table from the log's store.
    pub fn open(log: Arc<EventLog>, projector: Arc<StateProjector>) -> Result<Self> {
        let branches = log.store().load_branches()?;
        let table = branches.into_iter().map(|b| (b.id, b)).collect();
        Ok(Self {
            log,
            projector,
            table: RwLock::new(table),
            structural: Mutex::new(()),
        })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn get(&self, id: BranchId) -> Option<Branch> {
        self.table.read().get(&id).cloned()
    }

    pub fn require(&self, id: BranchId) -> Result<Branch> {
        self.get(id).ok_or_else(|| DecoherenceError::UnknownBranch(id).into())
    }

    fn require_coherent(&self, id: BranchId) -> Result<Branch> {
        let branch = self.require(id)?;
        if branch.decoherent {
            return Err(DecoherenceError::BranchDecoherent(id).into());
        }
        Ok(branch)
    }

    /// All branches, oldest first.
    pub fn branches(&self) -> Vec<Branch> {
        let mut all: Vec<_> = self.table.read().values().cloned().collect();
        all.sort_by_key(|b| (b.created_at, b.id));
        all
    }

    pub fn root(&self) -> Option<Branch> {
        self.table.read().values().find(|b| b.is_root()).cloned()
    }

    pub fn children(&self, id: BranchId) -> Vec<Branch> {
        let mut kids: Vec<_> = self
            .table
            .read()
            .values()
            .filter(|b| b.parent_branch_id == Some(id))
            .cloned()
            .collect();
        kids.sort_by_key(|b| (b.created_at, b.id));
        kids
    }

    /// `id` and its ancestors, `id` first.
    pub fn lineage(&self, id: BranchId) -> Vec<Branch> {
        let table = self.table.read();
        branch_lineage(|b| table.get(&b), id).into_iter().cloned().collect()
    }

    /// The fork set `id` belongs to, named by the branch its members forked
    /// from. The root names its own set.
    pub fn family_of(&self, id: BranchId) -> Option<BranchId> {
        let branch = self.get(id)?;
        Some(branch.parent_branch_id.unwrap_or(branch.id))
    }

    /// Whether the fork set has forks but no primary member.
    pub fn family_lacks_primary(&self, family: BranchId) -> bool {
        let table = self.table.read();
        let head_primary = table.get(&family).is_some_and(|b| b.is_primary);
        let mut forks = table.values().filter(|b| b.parent_branch_id == Some(family)).peekable();
        if forks.peek().is_none() {
            return false;
        }
        !head_primary && !forks.any(|b| b.is_primary)
    }

    /// Last event both branches' histories share, following first parents.
    pub fn common_ancestor(&self, a: BranchId, b: BranchId) -> Result<Option<EventId>> {
        let a_head = self.log.head(a).ok_or(DecoherenceError::UnknownBranch(a))?;
        let b_head = self.log.head(b).ok_or(DecoherenceError::UnknownBranch(b))?;
        let on_a: HashSet<EventId> = self.log.ancestors(a_head)?.map(|e| e.id).collect();
        Ok(self.log.ancestors(b_head)?.map(|e| e.id).filter(|id| on_a.contains(id)).last())
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    fn put(&self, branch: Branch) -> Result<()> {
        self.log.store().put_branch(&branch)?;
        self.table.write().insert(branch.id, branch);
        Ok(())
    }

    /// Create the space's root branch with its `branch_root` event.
    pub fn create_root(&self, label: Option<String>, creator: PrincipalId) -> Result<TimelineContext> {
        let _guard = self.structural.lock();
        if let Some(existing) = self.root() {
            return Err(LoomError::InvalidEvent(format!("space already has root {}", existing.id)));
        }
        let branch = Branch::root(label, creator);
        let id = branch.id;
        self.put(branch)?;
        let root = self.log.start_branch(
            id,
            NewEvent::new(EventKind::BranchRoot, serde_json::json!({})).by(creator),
            None,
        )?;
        tracing::info!(space = %self.log.space_id(), branch = %id, "root branch created");
        Ok(TimelineContext::new(id, true, root.id, id))
    }

    /// Fork a new branch at `parent.last_event_id`.
    ///
    /// The caller validates `parent` first. The new branch starts with a
    /// `timeline_fork` event and, when possible, a copy of the parent's
    /// projected state.
    #[tracing::instrument(skip(self, parent, options), name = "loom.fork", fields(parent = %parent.branch_id))]
    pub fn fork(&self, parent: &TimelineContext, options: ForkOptions) -> Result<TimelineContext> {
        let _guard = self.structural.lock();
        let parent_branch = self.require_coherent(parent.branch_id)?;
        let fork_point = parent.last_event_id;
        self.log.require(fork_point)?;

        let branch = Branch::fork(parent_branch.id, fork_point, options.label, options.reason.clone(), options.creator);
        let id = branch.id;
        self.put(branch)?;

        let payload = serde_json::json!({
            "parent_branch": parent_branch.id.to_string(),
            "reason": options.reason,
        });
        let event = NewEvent::new(EventKind::TimelineFork, payload).by(options.creator);
        let fork_event = match self.log.start_branch(id, event, Some(fork_point)) {
            Ok(event) => event,
            Err(e) => return Err(self.on_structural(id, e)),
        };
        self.projector.fork(&self.log, parent_branch.id, id, fork_point)?;

        tracing::info!(branch = %id, fork_point = %fork_point, "branch forked");
        Ok(TimelineContext::new(id, false, fork_event.id, parent.root_branch_id))
    }

    /// Merge `source` into `target`. Returns the `timeline_merge` event.
    #[tracing::instrument(skip(self, strategy), name = "loom.merge", fields(strategy = %strategy.kind()))]
    pub fn merge(
        &self,
        source: BranchId,
        target: BranchId,
        strategy: MergeStrategy,
        author: PrincipalId,
    ) -> Result<Arc<Event>> {
        let _guard = self.structural.lock();
        if source == target {
            return Err(LoomError::MergeRejected("cannot merge a branch into itself".into()));
        }
        self.require_coherent(source)?;
        self.require_coherent(target)?;
        let source_head = self.log.head(source).ok_or(DecoherenceError::UnknownBranch(source))?;
        let target_head = self.log.head(target).ok_or(DecoherenceError::UnknownBranch(target))?;

        let kind = strategy.kind();
        let mut record = MergeRecord {
            strategy: kind,
            source_branch: source,
            source_head,
            common_ancestor: target_head,
            sequence: Vec::new(),
            copied: 0,
            resolution: None,
        };
        let mut run = Vec::new();

        match strategy {
            MergeStrategy::Append => {
                let reach = self.log.reachable(target_head)?;
                let (ancestor, source_side) = self.diverged(source_head, &reach)?;
                reject_rewinding_merges(&source_side)?;
                record.common_ancestor = ancestor;
                run = source_side
                    .iter()
                    .filter(|e| !e.kind.is_structural())
                    .map(|e| NewEvent::copy_of(e))
                    .collect();
                record.copied = run.len();
            }
            MergeStrategy::Interleave => {
                let on_target: HashSet<EventId> = self.log.ancestors(target_head)?.map(|e| e.id).collect();
                let (ancestor, source_side) = self.diverged(source_head, &on_target)?;
                let target_side = self
                    .log
                    .chain_between(target_head, Some(ancestor))?
                    .ok_or_else(|| LoomError::MergeRejected("target diverged from its own lineage".into()))?;
                if source_side.iter().chain(&target_side).any(|e| e.kind == EventKind::TimelineMerge) {
                    return Err(LoomError::MergeRejected(
                        "interleave needs both sides free of earlier merges since the fork point".into(),
                    ));
                }
                record.common_ancestor = ancestor;
                record.sequence = interleave(&target_side, &source_side);
            }
            MergeStrategy::Edit { resolution } => {
                let reach = self.log.reachable(target_head)?;
                let (ancestor, _) = self.diverged(source_head, &reach)?;
                record.common_ancestor = ancestor;
                record.resolution = Some(resolution);
            }
        }

        let payload = serde_json::to_value(&record)
            .map_err(|e| LoomError::InvalidEvent(format!("merge record: {e}")))?;
        let mut merge = NewEvent::new(EventKind::TimelineMerge, payload).by(author);
        merge.merge_parents = vec![source_head];
        run.push(merge);

        let appended = match self.log.append_run(target, run, target_head) {
            Ok(events) => events,
            Err(e) => return Err(self.on_structural(target, e)),
        };
        let merge_event = appended
            .last()
            .cloned()
            .ok_or_else(|| LoomError::InvalidEvent("merge appended nothing".into()))?;
        self.projector.advance(&self.log, target)?;

        tracing::info!(
            source = %source,
            target = %target,
            merge = %merge_event.id,
            copied = record.copied,
            interleaved = record.sequence.len(),
            "branches merged"
        );
        Ok(merge_event)
    }

    /// Walk `head`'s first parents back to the first event in `known`.
    /// Returns that event and everything after it, oldest first.
    fn diverged(&self, head: EventId, known: &HashSet<EventId>) -> Result<(EventId, Vec<Arc<Event>>)> {
        let mut side = Vec::new();
        for event in self.log.ancestors(head)?.collect::<Vec<_>>().into_iter().rev() {
            if known.contains(&event.id) {
                side.reverse();
                return Ok((event.id, side));
            }
            side.push(event);
        }
        Err(LoomError::MergeRejected("branches share no history".into()))
    }

    /// Make `id` the primary of its sibling set.
    ///
    /// Idempotent. Fails with `PrimaryConflict` if a sibling, the branch it
    /// forked from, or one of its own forks already is: a primary and its
    /// forks form one fork set.
    #[tracing::instrument(skip(self), name = "loom.designate_primary")]
    pub fn designate_primary(&self, id: BranchId) -> Result<bool> {
        let _guard = self.structural.lock();
        let mut table = self.table.write();
        let branch = table.get(&id).ok_or(DecoherenceError::UnknownBranch(id))?;
        if branch.decoherent {
            return Err(DecoherenceError::BranchDecoherent(id).into());
        }
        if branch.is_primary {
            return Ok(false);
        }
        let parent = branch.parent_branch_id;
        let same_set =
            |b: &Branch| b.parent_branch_id == parent || Some(b.id) == parent || b.parent_branch_id == Some(id);
        if let Some(existing) = table.values().find(|&b| b.id != id && b.is_primary && same_set(b)) {
            return Err(DecoherenceError::PrimaryConflict { branch: id, existing: existing.id }.into());
        }

        let mut updated = branch.clone();
        updated.is_primary = true;
        self.log.store().put_branch(&updated)?;
        table.insert(id, updated);
        tracing::info!(branch = %id, "branch designated primary");
        Ok(true)
    }

    /// Clear the primary flag. Idempotent.
    pub fn demote(&self, id: BranchId) -> Result<bool> {
        let _guard = self.structural.lock();
        self.update(id, |b| std::mem::replace(&mut b.is_primary, false))
    }

    /// Permanently mark `id` decoherent. Returns whether the flag changed.
    pub fn mark_decoherent(&self, id: BranchId, reason: &str) -> Result<bool> {
        let changed = self.update(id, |b| !std::mem::replace(&mut b.decoherent, true))?;
        if changed {
            tracing::warn!(branch = %id, reason, "branch marked decoherent");
        }
        Ok(changed)
    }

    fn update(&self, id: BranchId, f: impl FnOnce(&mut Branch) -> bool) -> Result<bool> {
        let mut table = self.table.write();
        let branch = table.get_mut(&id).ok_or(DecoherenceError::UnknownBranch(id))?;
        let mut updated = branch.clone();
        let changed = f(&mut updated);
        if changed {
            self.log.store().put_branch(&updated)?;
            *branch = updated;
        }
        Ok(changed)
    }

    /// Mark `branch` decoherent if `err` is a structural violation, then
    /// hand the error back.
    pub(crate) fn on_structural(&self, branch: BranchId, err: LoomError) -> LoomError {
        if err.is_structural() {
            if let Err(mark) = self.mark_decoherent(branch, &err.to_string()) {
                tracing::error!(branch = %branch, error = %mark, "failed to mark branch decoherent");
            }
        }
        err
    }

    /// Remove a leaf, non-primary, non-root branch. Its events stay in the log.
    pub fn prune(&self, id: BranchId) -> Result<()> {
        let _guard = self.structural.lock();
        let branch = self.require(id)?;
        if branch.is_root() {
            return Err(LoomError::InvalidEvent("cannot prune the root branch".into()));
        }
        if branch.is_primary {
            return Err(LoomError::InvalidEvent(format!("cannot prune primary branch {id}")));
        }
        if !self.children(id).is_empty() {
            return Err(LoomError::InvalidEvent(format!("branch {id} has forks")));
        }
        self.log.store().remove_branch(id)?;
        self.table.write().remove(&id);
        self.log.forget_head(id);
        self.projector.forget(id);
        tracing::info!(branch = %id, "branch pruned");
        Ok(())
    }
}

fn reject_rewinding_merges(events: &[Arc<Event>]) -> Result<()> {
    for event in events.iter().filter(|e| e.kind == EventKind::TimelineMerge) {
        let strategy = MergeRecord::from_event(event)?.strategy;
        if strategy != MergeStrategyKind::Append {
            return Err(LoomError::MergeRejected(format!(
                "source contains {strategy} merge {}; only append merges can be carried forward",
                event.id
            )));
        }
    }
    Ok(())
}

/// Order both sides by timestamp, ties by branch ID, then by side and position.
fn interleave(target_side: &[Arc<Event>], source_side: &[Arc<Event>]) -> Vec<EventId> {
    let mut all: Vec<&Arc<Event>> = target_side
        .iter()
        .chain(source_side)
        .filter(|e| !e.kind.is_structural())
        .collect();
    // Stable: equal keys keep target-then-source, chain order.
    all.sort_by_key(|e| (e.timestamp, e.branch_id));
    all.into_iter().map(|e| e.id).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use loom_types::SpaceId;
    use serde_json::json;

    struct Fixture {
        log: Arc<EventLog>,
        projector: Arc<StateProjector>,
        branches: BranchManager,
        root: TimelineContext,
    }

    fn fixture() -> Fixture {
        let log = Arc::new(EventLog::new(SpaceId::new(), Arc::new(MemoryStore::new()), 1_000_000));
        let projector = Arc::new(StateProjector::default());
        let branches = BranchManager::open(log.clone(), projector.clone()).unwrap();
        let root = branches.create_root(Some("primary".into()), PrincipalId::system()).unwrap();
        Fixture { log, projector, branches, root }
    }

    impl Fixture {
        fn push(&self, ctx: TimelineContext, object: &str, payload: Value, at: u64) -> TimelineContext {
            let event = self
                .log
                .append(ctx.branch_id, NewEvent::new(EventKind::Action, payload).on_object(object).at(at), ctx.last_event_id)
                .unwrap();
            ctx.advanced_to(event.id)
        }

        fn history(&self, branch: BranchId, object: &str) -> Vec<Value> {
            let state = self.projector.state_of(&self.log, &object.into(), branch).unwrap();
            state.value["history"]
                .as_array()
                .map(|h| h.iter().map(|e| e["payload"]["n"].clone()).collect())
                .unwrap_or_default()
        }
    }

    #[test]
    fn test_create_root_once() {
        let f = fixture();
        assert!(f.root.is_primary);
        assert!(f.root.is_root_branch());
        assert!(f.branches.create_root(None, PrincipalId::system()).is_err());
        assert_eq!(f.branches.root().unwrap().id, f.root.branch_id);
    }

    #[test]
    fn test_fork_registers_metadata_and_event() {
        let f = fixture();
        let a = f.push(f.root, "doc:a", json!({"n": 1}), 10);
        let child = f
            .branches
            .fork(&a, ForkOptions::new(PrincipalId::new()).reason("try something").label("f1"))
            .unwrap();

        assert!(!child.is_primary);
        assert_eq!(child.root_branch_id, f.root.branch_id);
        let meta = f.branches.get(child.branch_id).unwrap();
        assert_eq!(meta.fork_point_event_id, Some(a.last_event_id));
        assert_eq!(meta.reason.as_deref(), Some("try something"));

        let fork_event = f.log.get(child.last_event_id).unwrap();
        assert_eq!(fork_event.kind, EventKind::TimelineFork);
        assert_eq!(fork_event.parent_id, Some(a.last_event_id));
        assert_eq!(f.branches.children(f.root.branch_id).len(), 1);
        assert_eq!(f.branches.lineage(child.branch_id).len(), 2);
    }

    #[test]
    fn test_designate_primary_conflicts_between_siblings() {
        let f = fixture();
        let f1 = f.branches.fork(&f.root, ForkOptions::new(PrincipalId::new())).unwrap();
        let f2 = f.branches.fork(&f.root, ForkOptions::new(PrincipalId::new())).unwrap();
        f.branches.demote(f.root.branch_id).unwrap();

        assert!(f.branches.designate_primary(f1.branch_id).unwrap());
        assert!(!f.branches.designate_primary(f1.branch_id).unwrap());
        let err = f.branches.designate_primary(f2.branch_id).unwrap_err();
        assert_eq!(err.code(), Some("PRIMARY_CONFLICT"));

        assert!(f.branches.demote(f1.branch_id).unwrap());
        assert!(f.branches.designate_primary(f2.branch_id).unwrap());
    }

    #[test]
    fn test_fork_cannot_outrank_primary_parent() {
        let f = fixture();
        let f1 = f.branches.fork(&f.root, ForkOptions::new(PrincipalId::new())).unwrap();

        let err = f.branches.designate_primary(f1.branch_id).unwrap_err();
        assert_eq!(err.code(), Some("PRIMARY_CONFLICT"));
        assert_eq!(f.branches.branches().iter().filter(|b| b.is_primary).count(), 1);

        f.branches.demote(f.root.branch_id).unwrap();
        assert!(f.branches.designate_primary(f1.branch_id).unwrap());
        let err = f.branches.designate_primary(f.root.branch_id).unwrap_err();
        assert_eq!(err.code(), Some("PRIMARY_CONFLICT"));
        assert_eq!(f.branches.branches().iter().filter(|b| b.is_primary).count(), 1);
    }

    #[test]
    fn test_family_lacks_primary() {
        let f = fixture();
        let family = f.root.branch_id;
        assert!(!f.branches.family_lacks_primary(family));
        let f1 = f.branches.fork(&f.root, ForkOptions::new(PrincipalId::new())).unwrap();
        assert!(!f.branches.family_lacks_primary(family));
        f.branches.demote(family).unwrap();
        assert!(f.branches.family_lacks_primary(family));
        f.branches.designate_primary(f1.branch_id).unwrap();
        assert!(!f.branches.family_lacks_primary(family));
    }

    #[test]
    fn test_append_merge_copies_source_events() {
        let f = fixture();
        let base = f.push(f.root, "doc:a", json!({"n": 0}), 1);
        let side = f.branches.fork(&base, ForkOptions::new(PrincipalId::new())).unwrap();
        let side = f.push(side, "doc:a", json!({"n": 1}), 2);
        f.push(side, "doc:a", json!({"n": 2}), 3);
        f.push(base, "doc:a", json!({"n": 9}), 4);

        let merge = f
            .branches
            .merge(side.branch_id, base.branch_id, MergeStrategy::Append, PrincipalId::system())
            .unwrap();
        assert_eq!(merge.kind, EventKind::TimelineMerge);
        assert_eq!(merge.merge_parents.len(), 1);
        let record = MergeRecord::from_event(&merge).unwrap();
        assert_eq!(record.copied, 2);
        assert_eq!(record.common_ancestor, base.last_event_id);

        assert_eq!(f.history(base.branch_id, "doc:a"), vec![json!(0), json!(9), json!(1), json!(2)]);

        // A second append merge only carries what is new.
        let side_head = f.log.head(side.branch_id).unwrap();
        f.push(side.advanced_to(side_head), "doc:a", json!({"n": 3}), 5);
        let again = f
            .branches
            .merge(side.branch_id, base.branch_id, MergeStrategy::Append, PrincipalId::system())
            .unwrap();
        assert_eq!(MergeRecord::from_event(&again).unwrap().copied, 1);
        assert_eq!(
            f.history(base.branch_id, "doc:a"),
            vec![json!(0), json!(9), json!(1), json!(2), json!(3)]
        );
    }

    #[test]
    fn test_interleave_merge_orders_by_timestamp() {
        let f = fixture();
        let base = f.push(f.root, "doc:a", json!({"n": 0}), 1);
        let side = f.branches.fork(&base, ForkOptions::new(PrincipalId::new())).unwrap();
        let side = f.push(side, "doc:a", json!({"n": 2}), 20);
        f.push(side, "doc:a", json!({"n": 4}), 40);
        let base = f.push(base, "doc:a", json!({"n": 1}), 10);
        f.push(base, "doc:a", json!({"n": 3}), 30);

        f.branches
            .merge(side.branch_id, base.branch_id, MergeStrategy::Interleave, PrincipalId::system())
            .unwrap();
        let expected: Vec<Value> = (0..=4).map(|n| json!(n)).collect();
        assert_eq!(f.history(base.branch_id, "doc:a"), expected);

        // Cold replay agrees with the incremental path.
        let cold = StateProjector::default();
        let warm = f.projector.state_of(&f.log, &"doc:a".into(), base.branch_id).unwrap();
        assert_eq!(cold.state_of(&f.log, &"doc:a".into(), base.branch_id).unwrap(), warm);
    }

    #[test]
    fn test_interleave_ties_break_on_branch_id() {
        let f = fixture();
        let side = f.branches.fork(&f.root, ForkOptions::new(PrincipalId::new())).unwrap();
        f.push(side, "doc:a", json!({"n": "side"}), 5);
        f.push(f.root, "doc:a", json!({"n": "root"}), 5);

        f.branches
            .merge(side.branch_id, f.root.branch_id, MergeStrategy::Interleave, PrincipalId::system())
            .unwrap();
        let mut expected = vec![(f.root.branch_id, json!("root")), (side.branch_id, json!("side"))];
        expected.sort_by_key(|(b, _)| *b);
        let expected: Vec<Value> = expected.into_iter().map(|(_, v)| v).collect();
        assert_eq!(f.history(f.root.branch_id, "doc:a"), expected);
    }

    #[test]
    fn test_edit_merge_applies_resolution_only() {
        let f = fixture();
        let side = f.branches.fork(&f.root, ForkOptions::new(PrincipalId::new())).unwrap();
        f.push(side, "doc:a", json!({"n": 1}), 1);

        let merge = f
            .branches
            .merge(
                side.branch_id,
                f.root.branch_id,
                MergeStrategy::Edit { resolution: json!({"objects": {"doc:a": {"final": true}}}) },
                PrincipalId::system(),
            )
            .unwrap();
        let state = f.projector.state_of(&f.log, &"doc:a".into(), f.root.branch_id).unwrap();
        assert_eq!(state.value, json!({"final": true}));
        assert_eq!(state.last_event_id, Some(merge.id));
        assert!(f.log.is_ancestor(f.log.head(side.branch_id).unwrap(), merge.id).unwrap());
    }

    #[test]
    fn test_fork_of_merge() {
        let f = fixture();
        let side = f.branches.fork(&f.root, ForkOptions::new(PrincipalId::new())).unwrap();
        f.push(side, "doc:a", json!({"n": 1}), 1);
        let merge = f
            .branches
            .merge(side.branch_id, f.root.branch_id, MergeStrategy::Append, PrincipalId::system())
            .unwrap();

        let at_merge = f.root.advanced_to(merge.id);
        let child = f.branches.fork(&at_merge, ForkOptions::new(PrincipalId::new())).unwrap();
        assert_eq!(f.branches.get(child.branch_id).unwrap().fork_point_event_id, Some(merge.id));
        assert_eq!(f.history(child.branch_id, "doc:a"), vec![json!(1)]);
    }

    #[test]
    fn test_merge_rejections() {
        let f = fixture();
        let err = f
            .branches
            .merge(f.root.branch_id, f.root.branch_id, MergeStrategy::Append, PrincipalId::system())
            .unwrap_err();
        assert!(matches!(err, LoomError::MergeRejected(_)));

        let side = f.branches.fork(&f.root, ForkOptions::new(PrincipalId::new())).unwrap();
        f.branches.mark_decoherent(side.branch_id, "test").unwrap();
        let err = f
            .branches
            .merge(side.branch_id, f.root.branch_id, MergeStrategy::Append, PrincipalId::system())
            .unwrap_err();
        assert_eq!(err.code(), Some("BRANCH_DECOHERENT"));
    }

    #[test]
    fn test_common_ancestor() {
        let f = fixture();
        let a = f.push(f.root, "doc:a", json!({"n": 1}), 1);
        let side = f.branches.fork(&a, ForkOptions::new(PrincipalId::new())).unwrap();
        f.push(a, "doc:a", json!({"n": 2}), 2);
        assert_eq!(
            f.branches.common_ancestor(side.branch_id, f.root.branch_id).unwrap(),
            Some(a.last_event_id)
        );
    }

    #[test]
    fn test_prune_rules() {
        let f = fixture();
        let f1 = f.branches.fork(&f.root, ForkOptions::new(PrincipalId::new())).unwrap();
        let f2 = f.branches.fork(&f1, ForkOptions::new(PrincipalId::new())).unwrap();

        assert!(f.branches.prune(f.root.branch_id).is_err());
        assert!(f.branches.prune(f1.branch_id).is_err());
        f.branches.prune(f2.branch_id).unwrap();
        assert!(f.branches.get(f2.branch_id).is_none());
        assert!(f.log.head(f2.branch_id).is_none());
        assert!(f.log.contains(f2.last_event_id));
        f.branches.prune(f1.branch_id).unwrap();
    }

    #[test]
    fn test_decoherent_is_permanent() {
        let f = fixture();
        assert!(f.branches.mark_decoherent(f.root.branch_id, "test").unwrap());
        assert!(!f.branches.mark_decoherent(f.root.branch_id, "again").unwrap());
        assert!(f.branches.get(f.root.branch_id).unwrap().decoherent);
        let err = f.branches.fork(&f.root, ForkOptions::new(PrincipalId::new())).unwrap_err();
        assert_eq!(err.code(), Some("BRANCH_DECOHERENT"));
    }
}
