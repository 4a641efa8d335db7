//! Offline administration of one persisted space.
//!
//! Each sqlite file holds exactly one space; these helpers open it, resolve
//! branch names the way users type them, and run the handful of structural
//! operations an operator needs.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use loom_kernel::{ForkOptions, LogStore, LoomConfig, Space, SqliteStore};
use loom_types::{Branch, BranchId, EventId, ObjectState, PrincipalId, SpaceId, TimelineContext, resolve_branch_prefix};

/// Open the space stored in `path`. With `create`, an empty file gets a
/// fresh space with a root branch labelled `label`.
pub fn open_space(path: &Path, config: &LoomConfig, create: Option<Option<String>>) -> Result<Arc<Space>> {
    let store: Arc<dyn LogStore> =
        Arc::new(SqliteStore::open(path).with_context(|| format!("opening {}", path.display()))?);
    let stored = Space::stored_id(store.as_ref())?;

    match (stored, create) {
        (Some(id), None) => Ok(Arc::new(Space::open(id, store, config)?)),
        (Some(id), Some(_)) => bail!("{} already holds space {id}", path.display()),
        (None, None) => bail!("{} holds no space; run `init` first", path.display()),
        (None, Some(label)) => {
            let space = Arc::new(Space::open(SpaceId::new(), store, config)?);
            space.open_root(label, PrincipalId::system())?;
            Ok(space)
        }
    }
}

/// Resolve a label or hex prefix. `None` picks the primary branch.
pub fn resolve_branch(space: &Space, query: Option<&str>) -> Result<BranchId> {
    let Some(query) = query else {
        return space.primary_branch().map(|b| b.id).context("space has no root branch");
    };
    let branches = space.branches().branches();
    Ok(resolve_branch_prefix(branches.iter().map(|b| (b.id, b.label.as_deref())), query)?)
}

/// One line per branch, root first.
pub fn branch_lines(space: &Space) -> Vec<String> {
    let mut branches: Vec<Branch> = space.branches().branches();
    branches.sort_by_key(|b| (b.parent_branch_id.is_some(), b.created_at, b.id));
    branches
        .iter()
        .map(|b| {
            let mut flags = Vec::new();
            if b.is_primary {
                flags.push("primary");
            }
            if b.decoherent {
                flags.push("decoherent");
            }
            let head = space.log().head(b.id).map(|h| h.short()).unwrap_or_else(|| "-".into());
            let parent = b.parent_branch_id.map(|p| p.short()).unwrap_or_else(|| "-".into());
            format!(
                "{} {:<12} parent={} head={} {}",
                b.id.short(),
                b.label.as_deref().unwrap_or("-"),
                parent,
                head,
                flags.join(",")
            )
            .trim_end()
            .to_string()
        })
        .collect()
}

/// The last `limit` events of `branch`'s history, oldest first.
pub fn log_lines(space: &Space, branch: BranchId, limit: usize) -> Result<Vec<String>> {
    let (events, _) = space.history(branch, None, usize::MAX)?;
    let skip = events.len().saturating_sub(limit);
    Ok(events
        .iter()
        .skip(skip)
        .map(|e| {
            format!(
                "{} {} {} {} {}",
                e.id.short(),
                e.kind,
                e.object_id.as_ref().map(|o| o.as_str()).unwrap_or("-"),
                e.author.short(),
                e.payload
            )
        })
        .collect())
}

pub fn object_state(space: &Space, object: &str, branch: BranchId) -> Result<ObjectState> {
    Ok(space.projector().state_of(space.log(), &object.into(), branch)?)
}

/// Fork at `at`, an event on any branch.
pub fn fork_at(space: &Space, at: &str, reason: Option<String>, label: Option<String>) -> Result<TimelineContext> {
    let id = EventId::parse(at).with_context(|| format!("bad event id {at}"))?;
    let event = space.log().get(id).with_context(|| format!("no event {at}"))?;
    let head = space.context_for(event.branch_id)?;
    let ctx = TimelineContext { last_event_id: event.id, ..head };

    let mut options = ForkOptions::new(PrincipalId::system());
    if let Some(reason) = reason {
        options = options.reason(reason);
    }
    if let Some(label) = label {
        options = options.label(label);
    }
    Ok(space.fork(&ctx, options)?)
}
