//! Per-space, append-only, branch-partitioned event DAG.
//!
//! # Concurrency Model
//!
//! - DashMap index of every event, readable without blocking writers
//! - One mutex per branch head; `append` is a compare-and-swap on it
//! - Persistence happens under the branch mutex, so a head never points at
//!   an event the store has not seen
//!
//! Each event records a *generation*: one more than the largest generation
//! among its parents. Generations strictly decrease along every parent edge,
//! which lets ancestry searches prune without walking to the root.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use loom_types::{BranchId, Event, EventId, EventKind, NewEvent, SpaceId};

use crate::error::{DecoherenceError, LoomError, Result, StorageError};
use crate::store::LogStore;

struct Indexed {
    event: Arc<Event>,
    generation: u64,
}

type HeadSlot = Arc<Mutex<Option<EventId>>>;

/// The authoritative event store of one space.
pub struct EventLog {
    space_id: SpaceId,
    events: DashMap<EventId, Indexed>,
    heads: DashMap<BranchId, HeadSlot>,
    store: Arc<dyn LogStore>,
    max_depth: usize,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("space_id", &self.space_id)
            .field("events", &self.events.len())
            .field("branches", &self.heads.len())
            .finish_non_exhaustive()
    }
}

impl EventLog {
    /// Create an empty log over `store`.
    pub fn new(space_id: SpaceId, store: Arc<dyn LogStore>, max_depth: usize) -> Self {
        Self {
            space_id,
            events: DashMap::new(),
            heads: DashMap::new(),
            store,
            max_depth,
        }
    }

    /// Rebuild the in-memory index from whatever `store` already holds.
    pub fn open(space_id: SpaceId, store: Arc<dyn LogStore>, max_depth: usize) -> Result<Self> {
        let log = Self::new(space_id, store, max_depth);
        let events = log.store.load_events()?;
        let count = events.len();
        for event in events {
            let generation = log.generation_for(&event).ok_or_else(|| {
                StorageError::Corrupt(format!("event {} stored before its parents", event.id))
            })?;
            log.events.insert(event.id, Indexed { event: Arc::new(event), generation });
        }
        for (branch, head) in log.store.load_heads()? {
            if !log.events.contains_key(&head) {
                return Err(StorageError::Corrupt(format!("head {head} of {branch} missing")).into());
            }
            log.heads.insert(branch, Arc::new(Mutex::new(Some(head))));
        }
        tracing::debug!(space = %space_id, events = count, branches = log.heads.len(), "event log replayed");
        Ok(log)
    }

    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, id: EventId) -> Option<Arc<Event>> {
        self.events.get(&id).map(|e| e.event.clone())
    }

    pub fn require(&self, id: EventId) -> Result<Arc<Event>> {
        self.get(id).ok_or_else(|| DecoherenceError::UnknownEvent(id).into())
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.events.contains_key(&id)
    }

    /// Current head of `branch`, if it has one.
    pub fn head(&self, branch: BranchId) -> Option<EventId> {
        let slot = self.heads.get(&branch)?.clone();
        let head = *slot.lock();
        head
    }

    /// Every branch with a head.
    pub fn heads(&self) -> Vec<(BranchId, EventId)> {
        self.heads
            .iter()
            .filter_map(|entry| entry.value().lock().map(|h| (*entry.key(), h)))
            .collect()
    }

    fn generation_for(&self, event: &Event) -> Option<u64> {
        let mut generation = 0;
        for parent in event.parents() {
            generation = generation.max(self.events.get(&parent)?.generation + 1);
        }
        Some(generation)
    }

    fn generation(&self, id: EventId) -> Option<u64> {
        self.events.get(&id).map(|e| e.generation)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Append one event to `branch`, if its head is still `expected_parent`.
    pub fn append(&self, branch: BranchId, candidate: NewEvent, expected_parent: EventId) -> Result<Arc<Event>> {
        let mut run = self.append_run(branch, vec![candidate], expected_parent)?;
        run.pop().ok_or_else(|| LoomError::InvalidEvent("empty append".into()))
    }

    /// Append a chain of events to `branch` as one atomic step.
    ///
    /// Each event parents the next; the first parents `expected_parent`,
    /// which must equal the branch head. Either every event lands and the
    /// head moves to the last one, or nothing changes.
    #[tracing::instrument(skip(self, candidates), name = "loom.append", fields(branch = %branch, count = candidates.len()))]
    pub fn append_run(
        &self,
        branch: BranchId,
        candidates: Vec<NewEvent>,
        expected_parent: EventId,
    ) -> Result<Vec<Arc<Event>>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let slot = self
            .heads
            .get(&branch)
            .map(|s| s.clone())
            .ok_or(DecoherenceError::UnknownBranch(branch))?;
        let mut head = slot.lock();

        let current = (*head).ok_or(DecoherenceError::UnknownBranch(branch))?;
        if current != expected_parent {
            return Err(DecoherenceError::StaleParent {
                branch,
                expected: Some(expected_parent),
                actual: Some(current),
            }
            .into());
        }

        let events = self.materialize(branch, candidates, Some(current))?;
        let last = events.last().map(|e| e.id).unwrap_or(current);
        self.store.append_events(branch, &events, last)?;
        let appended = self.index(events);
        *head = Some(last);

        tracing::debug!(head = %last, "branch advanced");
        Ok(appended)
    }

    /// Write the first event of a branch. `parent` is `None` only for a
    /// space root; forks pass their fork point.
    pub fn start_branch(&self, branch: BranchId, candidate: NewEvent, parent: Option<EventId>) -> Result<Arc<Event>> {
        let slot = self
            .heads
            .entry(branch)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut head = slot.lock();
        if let Some(actual) = *head {
            return Err(DecoherenceError::StaleParent { branch, expected: None, actual: Some(actual) }.into());
        }
        if !candidate.merge_parents.is_empty() {
            return Err(LoomError::InvalidEvent("a branch cannot start with a merge".into()));
        }

        let mut events = self.materialize(branch, vec![candidate], parent)?;
        let event = events.pop().ok_or_else(|| LoomError::InvalidEvent("empty start".into()))?;
        self.store.append_events(branch, std::slice::from_ref(&event), event.id)?;
        let id = event.id;
        let mut indexed = self.index(vec![event]);
        *head = Some(id);
        tracing::debug!(branch = %branch, head = %id, "branch started");
        indexed.pop().ok_or_else(|| LoomError::InvalidEvent("empty start".into()))
    }

    /// Drop the head pointer of a pruned branch. Its events stay.
    pub(crate) fn forget_head(&self, branch: BranchId) {
        self.heads.remove(&branch);
    }

    fn materialize(&self, branch: BranchId, candidates: Vec<NewEvent>, mut parent: Option<EventId>) -> Result<Vec<Event>> {
        if let Some(p) = parent {
            if !self.contains(p) {
                return Err(LoomError::MissingParent { branch, parent: p });
            }
        }
        let now = loom_types::now_millis();
        let mut out = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if !candidate.merge_parents.is_empty() && candidate.kind != EventKind::TimelineMerge {
                return Err(LoomError::InvalidEvent(format!(
                    "only timeline_merge may carry extra parents, got {}",
                    candidate.kind
                )));
            }
            for extra in &candidate.merge_parents {
                if !self.contains(*extra) {
                    return Err(LoomError::MissingParent { branch, parent: *extra });
                }
            }
            let id = EventId::new();
            if self.contains(id) {
                return Err(LoomError::CycleDetected { branch, event: id });
            }
            out.push(Event {
                id,
                parent_id: parent,
                merge_parents: candidate.merge_parents,
                branch_id: branch,
                kind: candidate.kind,
                payload: candidate.payload,
                timestamp: candidate.timestamp.unwrap_or(now),
                object_id: candidate.object_id,
                author: candidate.author,
                origin: candidate.origin,
            });
            parent = Some(id);
        }
        Ok(out)
    }

    fn index(&self, events: Vec<Event>) -> Vec<Arc<Event>> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            // Parents were checked in materialize and are never removed.
            let generation = self.generation_for(&event).unwrap_or(0);
            let event = Arc::new(event);
            self.events.insert(event.id, Indexed { event: event.clone(), generation });
            out.push(event);
        }
        out
    }

    // ========================================================================
    // Ancestry
    // ========================================================================

    /// First-parent ancestry of `id`, root first, ending at `id` itself.
    ///
    /// IDs are collected eagerly; events are fetched as the iterator advances.
    pub fn ancestors(&self, id: EventId) -> Result<Ancestors<'_>> {
        let mut ids = Vec::new();
        let mut cursor = Some(self.require(id)?);
        while let Some(event) = cursor {
            if ids.len() > self.max_depth {
                return Err(LoomError::CycleDetected { branch: event.branch_id, event: event.id });
            }
            ids.push(event.id);
            cursor = match event.parent_id {
                Some(parent) => Some(self.get(parent).ok_or(LoomError::MissingParent {
                    branch: event.branch_id,
                    parent,
                })?),
                None => None,
            };
        }
        ids.reverse();
        Ok(Ancestors { log: self, ids: ids.into_iter() })
    }

    /// Events strictly after `stop` up to and including `head`, oldest first,
    /// following first parents. `stop = None` walks to the root.
    ///
    /// Returns `None` if `stop` is not on `head`'s first-parent chain.
    pub fn chain_between(&self, head: EventId, stop: Option<EventId>) -> Result<Option<Vec<Arc<Event>>>> {
        let mut chain = Vec::new();
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            if Some(id) == stop {
                chain.reverse();
                return Ok(Some(chain));
            }
            let event = self.require(id)?;
            if chain.len() > self.max_depth {
                return Err(LoomError::CycleDetected { branch: event.branch_id, event: id });
            }
            cursor = event.parent_id;
            chain.push(event);
        }
        if stop.is_some() {
            return Ok(None);
        }
        chain.reverse();
        Ok(Some(chain))
    }

    /// Whether `ancestor` is `of` or reachable from it through any parents.
    pub fn is_ancestor(&self, ancestor: EventId, of: EventId) -> Result<bool> {
        if ancestor == of {
            return Ok(true);
        }
        let Some(floor) = self.generation(ancestor) else {
            return Ok(false);
        };
        let mut queue = VecDeque::from([of]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if seen.len() > self.max_depth {
                let branch = self.get(of).map(|e| e.branch_id).unwrap_or_default();
                return Err(LoomError::CycleDetected { branch, event: of });
            }
            let event = self.require(id)?;
            for parent in event.parents() {
                if parent == ancestor {
                    return Ok(true);
                }
                if self.generation(parent).is_some_and(|g| g > floor) {
                    queue.push_back(parent);
                }
            }
        }
        Ok(false)
    }

    /// Every event reachable from `head` through any parent edge.
    pub fn reachable(&self, head: EventId) -> Result<HashSet<EventId>> {
        let mut seen = HashSet::new();
        let mut stack = vec![head];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if seen.len() > self.max_depth {
                let branch = self.get(head).map(|e| e.branch_id).unwrap_or_default();
                return Err(LoomError::CycleDetected { branch, event: head });
            }
            stack.extend(self.require(id)?.parents());
        }
        Ok(seen)
    }

    /// Page of `branch`'s first-parent history after `after`, oldest first.
    ///
    /// Returns the page and whether more events follow it.
    pub fn events_after(&self, branch: BranchId, after: Option<EventId>, limit: usize) -> Result<(Vec<Arc<Event>>, bool)> {
        let head = self.head(branch).ok_or(DecoherenceError::UnknownBranch(branch))?;
        let mut chain = match self.chain_between(head, after)? {
            Some(chain) => chain,
            None => {
                let stale = after.unwrap_or(head);
                return Err(DecoherenceError::StaleContext { branch, event: stale, head }.into());
            }
        };
        let has_more = chain.len() > limit;
        chain.truncate(limit);
        Ok((chain, has_more))
    }
}

/// Lazy root-to-target walk returned by [`EventLog::ancestors`].
pub struct Ancestors<'a> {
    log: &'a EventLog,
    ids: std::vec::IntoIter<EventId>,
}

impl Iterator for Ancestors<'_> {
    type Item = Arc<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        self.ids.next().and_then(|id| self.log.get(id))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ids.size_hint()
    }
}

// ============================================================================
// Tests
// ============================================================================
