//! Registry of independently running spaces.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use loom_types::{ObjectId, PrincipalId, SpaceId, TimelineContext};

use crate::config::LoomConfig;
use crate::error::{LoomError, Result};
use crate::reducer::ReducerRegistry;
use crate::space::{Space, Submission};
use crate::store::{LogStore, MemoryStore, SqliteStore};

/// Every space this process hosts.
pub struct Loom {
    config: LoomConfig,
    reducers: ReducerRegistry,
    spaces: DashMap<SpaceId, Arc<Space>>,
}

impl std::fmt::Debug for Loom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loom")
            .field("spaces", &self.spaces.len())
            .field("db_path", &self.config.db_path)
            .finish_non_exhaustive()
    }
}

impl Loom {
    pub fn new(config: LoomConfig) -> Self {
        Self::with_reducers(config, ReducerRegistry::default())
    }

    pub fn with_reducers(config: LoomConfig, reducers: ReducerRegistry) -> Self {
        Self { config, reducers, spaces: DashMap::new() }
    }

    pub fn config(&self) -> &LoomConfig {
        &self.config
    }

    fn space_file(&self, id: SpaceId) -> Option<PathBuf> {
        self.config.db_path.as_ref().map(|dir| dir.join(format!("{}.db", id.to_hex())))
    }

    fn store_for(&self, id: SpaceId) -> Result<Arc<dyn LogStore>> {
        match self.space_file(id) {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)
                        .map_err(|e| LoomError::Config(format!("{}: {e}", dir.display())))?;
                }
                Ok(Arc::new(SqliteStore::open(&path)?))
            }
            None => Ok(Arc::new(MemoryStore::new())),
        }
    }

    /// Open `id`, creating its store if needed. Returns the running space if
    /// it is already open.
    pub fn open_space(&self, id: SpaceId) -> Result<Arc<Space>> {
        if let Some(space) = self.spaces.get(&id) {
            return Ok(space.clone());
        }
        match self.spaces.entry(id) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let space = Arc::new(Space::open_with(id, self.store_for(id)?, &self.config, self.reducers.clone())?);
                slot.insert(space.clone());
                Ok(space)
            }
        }
    }

    /// Open a fresh space with a root branch.
    pub fn create_space(&self, label: Option<String>, creator: PrincipalId) -> Result<(Arc<Space>, TimelineContext)> {
        let space = self.open_space(SpaceId::new())?;
        let root = space.open_root(label, creator)?;
        tracing::info!(space = %space.id(), "space created");
        Ok((space, root))
    }

    /// Open every space persisted under `db_path`. Returns how many opened.
    pub fn open_persisted(&self) -> Result<usize> {
        let Some(dir) = self.config.db_path.as_ref() else {
            return Ok(0);
        };
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(LoomError::Config(format!("{}: {e}", dir.display()))),
        };
        let mut opened = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| SpaceId::parse(s).ok()) else {
                tracing::warn!(path = %path.display(), "skipping file without a space id name");
                continue;
            };
            self.open_space(id)?;
            opened += 1;
        }
        Ok(opened)
    }

    pub fn space(&self, id: SpaceId) -> Result<Arc<Space>> {
        self.spaces.get(&id).map(|s| s.clone()).ok_or(LoomError::UnknownSpace(id))
    }

    pub fn spaces(&self) -> Vec<SpaceId> {
        let mut ids: Vec<_> = self.spaces.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Inbound entry point for the activity layer.
    pub fn submit_event(
        &self,
        space: SpaceId,
        object: ObjectId,
        payload: serde_json::Value,
        ctx: &TimelineContext,
        author: PrincipalId,
    ) -> Result<Submission> {
        self.space(space)?.submit_event(object, payload, ctx, author)
    }

    /// Close a space. Its store stays on disk.
    pub fn close_space(&self, id: SpaceId) -> bool {
        self.spaces.remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spaces_are_independent() {
        let loom = Loom::new(LoomConfig::default());
        let author = PrincipalId::new();
        let (a, root_a) = loom.create_space(Some("a".into()), author).unwrap();
        let (b, root_b) = loom.create_space(Some("b".into()), author).unwrap();

        loom.submit_event(a.id(), "doc:x".into(), json!({"n": 1}), &root_a, author).unwrap();
        assert_eq!(a.log().len(), 2);
        assert_eq!(b.log().len(), 1);

        // A context from one space means nothing in another.
        let err = loom.submit_event(b.id(), "doc:x".into(), json!({}), &root_a, author).unwrap_err();
        assert_eq!(err.code(), Some("UNKNOWN_BRANCH"));
        loom.submit_event(b.id(), "doc:x".into(), json!({}), &root_b, author).unwrap();

        assert_eq!(loom.spaces().len(), 2);
    }

    #[test]
    fn test_unknown_space() {
        let loom = Loom::new(LoomConfig::default());
        assert!(matches!(loom.space(SpaceId::new()), Err(LoomError::UnknownSpace(_))));
    }

    #[test]
    fn test_open_space_is_shared() {
        let loom = Loom::new(LoomConfig::default());
        let id = SpaceId::new();
        let first = loom.open_space(id).unwrap();
        let second = loom.open_space(id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_persisted_spaces_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoomConfig { db_path: Some(dir.path().to_path_buf()), ..LoomConfig::default() };
        let author = PrincipalId::new();

        let id = {
            let loom = Loom::new(config.clone());
            let (space, root) = loom.create_space(None, author).unwrap();
            space.submit_event("doc:x".into(), json!({}), &root, author).unwrap();
            space.id()
        };

        let loom = Loom::new(config);
        assert_eq!(loom.open_persisted().unwrap(), 1);
        let space = loom.space(id).unwrap();
        assert_eq!(space.log().len(), 2);
        assert!(space.branches().root().is_some());
    }
}
