//! One space: its log, branches, projections and notifications, wired
//! together behind the inbound `submit_event` path.
//!
//! # Write path
//!
//! ```text
//! submit(ctx) ─► CoherenceValidator ─► entanglement check ─► EventLog::append
//!                                                               │
//!                          NotificationHub::publish ◄── StateProjector::advance
//! ```
//!
//! The returned context is rebuilt from branch metadata; the caller's claimed
//! `is_primary` is never trusted.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use loom_types::{
    Branch, BranchId, Event, EventId, EventKind, NewEvent, ObjectId, ObjectState, PrincipalId,
    SpaceId, SpaceSummary, TimelineContext,
};

use crate::branches::{BranchManager, ForkOptions, MergeRecord, MergeStrategy};
use crate::coherence::CoherenceValidator;
use crate::config::LoomConfig;
use crate::error::{DecoherenceError, LoomError, Result, StorageError};
use crate::event_log::EventLog;
use crate::hub::{ChangeDescriptor, ChangeSubject, NotificationHub};
use crate::projector::StateProjector;
use crate::reducer::ReducerRegistry;
use crate::store::LogStore;

const META_SPACE_ID: &str = "space_id";

/// Result of an accepted submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub event_id: EventId,
    pub updated_context: TimelineContext,
}

/// A space and everything that hangs off its log.
pub struct Space {
    id: SpaceId,
    log: Arc<EventLog>,
    projector: Arc<StateProjector>,
    branches: Arc<BranchManager>,
    validator: CoherenceValidator,
    hub: Arc<NotificationHub>,
    /// Principals that have read or written within each fork set.
    entangled: DashMap<BranchId, HashSet<PrincipalId>>,
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.id)
            .field("log", &self.log)
            .field("branches", &self.branches)
            .finish_non_exhaustive()
    }
}

impl Space {
    /// Open a space over `store`, replaying whatever it already holds.
    pub fn open(id: SpaceId, store: Arc<dyn LogStore>, config: &LoomConfig) -> Result<Self> {
        Self::open_with(id, store, config, ReducerRegistry::default())
    }

    pub fn open_with(
        id: SpaceId,
        store: Arc<dyn LogStore>,
        config: &LoomConfig,
        reducers: ReducerRegistry,
    ) -> Result<Self> {
        match store.get_meta(META_SPACE_ID)? {
            Some(stored) if stored != id.to_string() => {
                return Err(StorageError::Corrupt(format!("store belongs to space {stored}, not {id}")).into());
            }
            Some(_) => {}
            None => store.put_meta(META_SPACE_ID, &id.to_string())?,
        }

        let log = Arc::new(EventLog::open(id, store, config.max_ancestor_depth)?);
        let projector = Arc::new(StateProjector::new(reducers));
        let branches = Arc::new(BranchManager::open(log.clone(), projector.clone())?);
        let validator = CoherenceValidator::new(log.clone(), branches.clone());
        tracing::info!(space = %id, events = log.len(), branches = branches.branches().len(), "space opened");
        Ok(Self {
            id,
            log,
            projector,
            branches,
            validator,
            hub: Arc::new(NotificationHub::new(config.notify_capacity)),
            entangled: DashMap::new(),
        })
    }

    /// Space ID recorded in `store`, if it has ever been opened.
    pub fn stored_id(store: &dyn LogStore) -> Result<Option<SpaceId>> {
        let Some(raw) = store.get_meta(META_SPACE_ID)? else {
            return Ok(None);
        };
        SpaceId::parse(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt(format!("space id {raw}: {e}")).into())
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn branches(&self) -> &Arc<BranchManager> {
        &self.branches
    }

    pub fn projector(&self) -> &Arc<StateProjector> {
        &self.projector
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn validator(&self) -> &CoherenceValidator {
        &self.validator
    }

    /// Create the root branch, or return the current context of the existing one.
    pub fn open_root(&self, label: Option<String>, creator: PrincipalId) -> Result<TimelineContext> {
        match self.branches.root() {
            Some(root) => self.context_for(root.id),
            None => self.branches.create_root(label, creator),
        }
    }

    /// Authoritative context at `branch`'s head.
    pub fn context_for(&self, branch: BranchId) -> Result<TimelineContext> {
        let meta = self.branches.require(branch)?;
        let head = self.log.head(branch).ok_or(DecoherenceError::UnknownBranch(branch))?;
        let root = self.lineage_root(branch).unwrap_or(branch);
        Ok(TimelineContext::new(branch, meta.is_primary, head, root))
    }

    fn lineage_root(&self, branch: BranchId) -> Option<BranchId> {
        self.branches.lineage(branch).last().map(|b| b.id)
    }

    /// The externally authoritative branch: the primary among the root and
    /// its forks, falling back to the root.
    pub fn primary_branch(&self) -> Option<Branch> {
        let root = self.branches.root()?;
        if root.is_primary {
            return Some(root);
        }
        self.branches
            .children(root.id)
            .into_iter()
            .find(|b| b.is_primary)
            .or(Some(root))
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Submit an action against `object` on `ctx`'s branch.
    pub fn submit_event(
        &self,
        object: ObjectId,
        payload: serde_json::Value,
        ctx: &TimelineContext,
        author: PrincipalId,
    ) -> Result<Submission> {
        self.submit(NewEvent::new(EventKind::Action, payload).on_object(object).by(author), ctx)
    }

    /// Submit any non-structural event. The append expects the branch head
    /// to still be `ctx.last_event_id`.
    #[tracing::instrument(skip(self, candidate, ctx), name = "loom.submit_event", fields(space = %self.id, branch = %ctx.branch_id, kind = %candidate.kind))]
    pub fn submit(&self, candidate: NewEvent, ctx: &TimelineContext) -> Result<Submission> {
        if candidate.kind.is_structural() {
            return Err(LoomError::InvalidEvent(format!("{} events are written by the kernel", candidate.kind)));
        }
        let branch = self.validated(ctx)?;
        self.check_entanglement(branch.id, candidate.author)?;

        let object = candidate.object_id.clone();
        let message = serde_json::json!({
            "kind": candidate.kind.as_str(),
            "payload": candidate.payload.clone(),
        });
        let event = match self.log.append(branch.id, candidate, ctx.last_event_id) {
            Ok(event) => event,
            Err(e) => return Err(self.structural_failure(branch.id, e)),
        };
        self.projector.advance(&self.log, branch.id)?;

        let updated_context = TimelineContext::new(branch.id, branch.is_primary, event.id, ctx.root_branch_id);
        let mut change = ChangeDescriptor::new(ChangeSubject::StateChanged, self.id, updated_context)
            .event(event.id)
            .message(message);
        change.object_id = object;
        self.hub.publish(branch.id, change);

        Ok(Submission { event_id: event.id, updated_context })
    }

    /// Projected state of `object` on `ctx`'s branch. Counts as a read for
    /// entanglement.
    pub fn read_state(&self, object: &ObjectId, ctx: &TimelineContext, reader: PrincipalId) -> Result<ObjectState> {
        let branch = self.validated(ctx)?;
        self.entangle(branch.id, reader);
        self.projector.state_of(&self.log, object, branch.id)
    }

    /// Every object touched on `branch`, as of its head.
    pub fn objects(&self, branch: BranchId) -> Result<Vec<ObjectState>> {
        self.projector.objects(&self.log, branch)
    }

    /// Page of `branch`'s history strictly after `after`.
    pub fn history(&self, branch: BranchId, after: Option<EventId>, limit: usize) -> Result<(Vec<Arc<Event>>, bool)> {
        self.log.events_after(branch, after, limit)
    }

    // ------------------------------------------------------------------------
    // Branch operations
    // ------------------------------------------------------------------------

    pub fn fork(&self, ctx: &TimelineContext, options: ForkOptions) -> Result<TimelineContext> {
        self.validated(ctx)?;
        let child = self.branches.fork(ctx, options)?;
        let change = ChangeDescriptor::new(ChangeSubject::BranchForked, self.id, child)
            .event(child.last_event_id)
            .message(serde_json::json!({ "parent_branch": ctx.branch_id.to_string() }));
        self.hub.publish(child.branch_id, change);
        Ok(child)
    }

    /// Merge `source` into `target`; returns the merge event and the
    /// target's new context.
    pub fn merge(
        &self,
        source: BranchId,
        target: BranchId,
        strategy: MergeStrategy,
        author: PrincipalId,
    ) -> Result<Submission> {
        let before = self.log.head(target).ok_or(DecoherenceError::UnknownBranch(target))?;
        let merge = self.branches.merge(source, target, strategy, author)?;
        let record = MergeRecord::from_event(&merge)?;
        let ctx = self.context_for(target)?;

        let touched = self.touched_by_merge(&merge, &record, before)?;
        let summary = serde_json::json!({
            "strategy": record.strategy.to_string(),
            "source_branch": source.to_string(),
        });
        for object in touched {
            let change = ChangeDescriptor::new(ChangeSubject::StateChanged, self.id, ctx)
                .object(object)
                .event(merge.id)
                .message(summary.clone());
            self.hub.publish(target, change);
        }
        let change = ChangeDescriptor::new(ChangeSubject::BranchMerged, self.id, ctx)
            .event(merge.id)
            .message(summary);
        self.hub.publish(target, change);

        Ok(Submission { event_id: merge.id, updated_context: ctx })
    }

    fn touched_by_merge(&self, merge: &Event, record: &MergeRecord, before: EventId) -> Result<BTreeSet<ObjectId>> {
        if let Some(resolved) = record.resolved_objects() {
            return Ok(resolved.into_iter().map(|(id, _)| id).collect());
        }
        let ids: Vec<EventId> = if record.sequence.is_empty() {
            self.log
                .chain_between(merge.id, Some(before))?
                .unwrap_or_default()
                .iter()
                .map(|e| e.id)
                .collect()
        } else {
            record.sequence.clone()
        };
        Ok(ids
            .into_iter()
            .filter_map(|id| self.log.get(id))
            .filter_map(|e| e.object_id.clone())
            .collect())
    }

    pub fn designate_primary(&self, branch: BranchId) -> Result<TimelineContext> {
        let changed = self.branches.designate_primary(branch)?;
        let ctx = self.context_for(branch)?;
        if changed {
            self.hub.publish(branch, ChangeDescriptor::new(ChangeSubject::BranchPrimary, self.id, ctx));
        }
        Ok(ctx)
    }

    pub fn demote(&self, branch: BranchId) -> Result<TimelineContext> {
        self.branches.demote(branch)?;
        self.context_for(branch)
    }

    pub fn prune(&self, branch: BranchId) -> Result<()> {
        self.branches.prune(branch)?;
        self.entangled.remove(&branch);
        Ok(())
    }

    /// Handshake summary of the primary branch. `None` before the root exists.
    pub fn summary(&self) -> Option<SpaceSummary> {
        let primary = self.primary_branch()?;
        let head_event_id = self.log.head(primary.id)?;
        let object_ids = self
            .objects(primary.id)
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.object_id)
            .collect();
        Some(SpaceSummary {
            space_id: self.id,
            label: self.branches.root().and_then(|r| r.label),
            primary_branch_id: primary.id,
            head_event_id,
            branch_count: self.branches.branches().len(),
            event_count: self.log.len(),
            object_ids,
        })
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn validated(&self, ctx: &TimelineContext) -> Result<Branch> {
        let was_coherent = self.branches.get(ctx.branch_id).is_some_and(|b| !b.decoherent);
        match self.validator.validate(ctx) {
            Ok(branch) => Ok(branch),
            Err(DecoherenceError::BranchDecoherent(id)) if was_coherent => {
                self.publish_decoherent(id);
                Err(DecoherenceError::BranchDecoherent(id).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn structural_failure(&self, branch: BranchId, err: LoomError) -> LoomError {
        let structural = err.is_structural();
        let err = self.branches.on_structural(branch, err);
        if structural {
            self.publish_decoherent(branch);
        }
        err
    }

    fn publish_decoherent(&self, branch: BranchId) {
        let Ok(meta) = self.branches.require(branch) else {
            return;
        };
        let head = self.log.head(branch).unwrap_or_default();
        let root = self.lineage_root(branch).unwrap_or(branch);
        let ctx = TimelineContext::new(branch, meta.is_primary, head, root);
        self.hub.publish(branch, ChangeDescriptor::new(ChangeSubject::BranchDecoherent, self.id, ctx));
    }

    fn family(&self, branch: BranchId) -> BranchId {
        self.branches.family_of(branch).unwrap_or(branch)
    }

    fn entangle(&self, branch: BranchId, principal: PrincipalId) {
        self.entangled.entry(self.family(branch)).or_default().insert(principal);
    }

    /// Reject `author` if it already touched a fork set that has forks but
    /// no primary, then record it as entangled.
    fn check_entanglement(&self, branch: BranchId, author: PrincipalId) -> Result<()> {
        let family = self.family(branch);
        let entangled = self.entangled.get(&family).is_some_and(|set| set.contains(&author));
        if entangled && self.branches.family_lacks_primary(family) {
            return Err(DecoherenceError::NoPrimary { family }.into());
        }
        self.entangle(branch, author);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqliteStore};
    use serde_json::json;

    fn space() -> (Space, TimelineContext) {
        let space = Space::open(SpaceId::new(), Arc::new(MemoryStore::new()), &LoomConfig::default()).unwrap();
        let root = space.open_root(Some("primary".into()), PrincipalId::system()).unwrap();
        (space, root)
    }

    #[test]
    fn test_submit_advances_context() {
        let (space, root) = space();
        let author = PrincipalId::new();
        let first = space.submit_event("doc:a".into(), json!({"n": 1}), &root, author).unwrap();
        assert_eq!(first.updated_context.branch_id, root.branch_id);
        assert_eq!(space.log().get(first.event_id).unwrap().parent_id, Some(root.last_event_id));

        let second = space
            .submit_event("doc:a".into(), json!({"n": 2}), &first.updated_context, author)
            .unwrap();
        let state = space.read_state(&"doc:a".into(), &second.updated_context, author).unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.last_event_id, Some(second.event_id));
    }

    #[test]
    fn test_lagging_cursor_is_stale_parent() {
        let (space, root) = space();
        space.submit_event("doc:a".into(), json!({}), &root, PrincipalId::new()).unwrap();
        let err = space.submit_event("doc:a".into(), json!({}), &root, PrincipalId::new()).unwrap_err();
        assert_eq!(err.code(), Some("STALE_PARENT"));
    }

    #[test]
    fn test_claimed_primary_is_not_trusted() {
        let (space, root) = space();
        let fork = space.fork(&root, ForkOptions::new(PrincipalId::new())).unwrap();
        let lying = TimelineContext { is_primary: true, ..fork };
        let out = space.submit_event("doc:a".into(), json!({}), &lying, PrincipalId::new()).unwrap();
        assert!(!out.updated_context.is_primary);
    }

    #[test]
    fn test_structural_kinds_are_rejected() {
        let (space, root) = space();
        let err = space
            .submit(NewEvent::new(EventKind::TimelineMerge, json!({})), &root)
            .unwrap_err();
        assert!(matches!(err, LoomError::InvalidEvent(_)));
    }

    #[test]
    fn test_no_primary_blocks_entangled_authors() {
        let (space, root) = space();
        let writer = PrincipalId::new();
        let stranger = PrincipalId::new();
        let after = space.submit_event("doc:a".into(), json!({}), &root, writer).unwrap();
        let fork = space.fork(&after.updated_context, ForkOptions::new(writer)).unwrap();
        space.demote(root.branch_id).unwrap();

        let err = space.submit_event("doc:a".into(), json!({}), &fork, writer).unwrap_err();
        assert_eq!(err.code(), Some("NO_PRIMARY"));
        // Not entangled yet: allowed, and now entangled.
        let ok = space.submit_event("doc:a".into(), json!({}), &fork, stranger).unwrap();
        let err = space
            .submit_event("doc:a".into(), json!({}), &ok.updated_context, stranger)
            .unwrap_err();
        assert_eq!(err.code(), Some("NO_PRIMARY"));

        space.designate_primary(fork.branch_id).unwrap();
        space
            .submit_event("doc:a".into(), json!({}), &ok.updated_context, writer)
            .unwrap();
    }

    #[test]
    fn test_notifications_follow_primary_flag() {
        let (space, root) = space();
        let mut internal = space.hub().subscribe("state.changed");
        let mut external = space.hub().subscribe_external(">");

        let fork = space.fork(&root, ForkOptions::new(PrincipalId::new())).unwrap();
        space.submit_event("doc:a".into(), json!({}), &fork, PrincipalId::new()).unwrap();
        space.submit_event("doc:a".into(), json!({}), &root, PrincipalId::new()).unwrap();

        assert_eq!(internal.drain().len(), 2);
        let out = external.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timeline_context.branch_id, root.branch_id);
    }

    #[test]
    fn test_merge_publishes_touched_objects() {
        let (space, root) = space();
        let fork = space.fork(&root, ForkOptions::new(PrincipalId::new())).unwrap();
        let a = space.submit_event("doc:a".into(), json!({}), &fork, PrincipalId::new()).unwrap();
        space.submit_event("doc:b".into(), json!({}), &a.updated_context, PrincipalId::new()).unwrap();

        let mut sub = space.hub().subscribe(">");
        let merged = space
            .merge(fork.branch_id, root.branch_id, MergeStrategy::Append, PrincipalId::system())
            .unwrap();
        assert!(merged.updated_context.is_primary);
        assert_eq!(merged.updated_context.last_event_id, merged.event_id);

        let subjects: Vec<_> = sub.drain().iter().map(|c| (c.subject, c.object_id.clone())).collect();
        assert_eq!(
            subjects,
            vec![
                (ChangeSubject::StateChanged, Some(ObjectId::from("doc:a"))),
                (ChangeSubject::StateChanged, Some(ObjectId::from("doc:b"))),
                (ChangeSubject::BranchMerged, None),
            ]
        );
    }

    #[test]
    fn test_reopen_from_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.db");
        let id = SpaceId::new();
        let config = LoomConfig::default();
        let author = PrincipalId::new();

        let (fork_id, expected) = {
            let space = Space::open(id, Arc::new(SqliteStore::open(&path).unwrap()), &config).unwrap();
            let root = space.open_root(None, author).unwrap();
            let out = space.submit_event("doc:a".into(), json!({"n": 1}), &root, author).unwrap();
            let fork = space.fork(&out.updated_context, ForkOptions::new(author)).unwrap();
            let out = space.submit_event("doc:a".into(), json!({"n": 2}), &fork, author).unwrap();
            let state = space.read_state(&"doc:a".into(), &out.updated_context, author).unwrap();
            (fork.branch_id, state)
        };

        let store = Arc::new(SqliteStore::open(&path).unwrap());
        assert_eq!(Space::stored_id(store.as_ref()).unwrap(), Some(id));
        let space = Space::open(id, store, &config).unwrap();
        let ctx = space.context_for(fork_id).unwrap();
        assert_eq!(space.read_state(&"doc:a".into(), &ctx, author).unwrap(), expected);
        assert_eq!(space.branches().branches().len(), 2);

        let other = Space::open(SpaceId::new(), Arc::new(SqliteStore::open(&path).unwrap()), &config);
        assert!(other.is_err());
    }

    #[test]
    fn test_summary() {
        let (space, root) = space();
        space.submit_event("doc:a".into(), json!({}), &root, PrincipalId::new()).unwrap();
        let summary = space.summary().unwrap();
        assert_eq!(summary.primary_branch_id, root.branch_id);
        assert_eq!(summary.label.as_deref(), Some("primary"));
        assert_eq!(summary.event_count, 2);
        assert_eq!(summary.object_ids, vec![ObjectId::from("doc:a")]);
    }
}
