//! Durable backing for a space's event log and branch table.
//!
//! Layout mirrors the log's access paths: events keyed by
//! `(branch_id, event_id)`, a head index `branch_id → head_event_id`, and
//! branch metadata keyed by `branch_id`. Events are append-only; the only
//! rows ever rewritten are heads and branch metadata.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use loom_types::{Branch, BranchId, Event, EventId, EventKind, ObjectId, PrincipalId};

use crate::error::{StorageError, StorageResult};

/// Storage backend for one space.
pub trait LogStore: Send + Sync {
    /// Persist `events` in order and move the branch head to `head`, atomically.
    fn append_events(&self, branch: BranchId, events: &[Event], head: EventId) -> StorageResult<()>;

    fn put_branch(&self, branch: &Branch) -> StorageResult<()>;

    /// Forget branch metadata and its head. Events stay.
    fn remove_branch(&self, branch: BranchId) -> StorageResult<()>;

    /// Every event, parents before children.
    fn load_events(&self) -> StorageResult<Vec<Event>>;

    fn load_heads(&self) -> StorageResult<Vec<(BranchId, EventId)>>;

    fn load_branches(&self) -> StorageResult<Vec<Branch>>;

    fn put_meta(&self, key: &str, value: &str) -> StorageResult<()>;

    fn get_meta(&self, key: &str) -> StorageResult<Option<String>>;
}

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    events: Vec<Event>,
    heads: std::collections::HashMap<BranchId, EventId>,
    branches: std::collections::HashMap<BranchId, Branch>,
    meta: std::collections::HashMap<String, String>,
}

/// Volatile store. Loses everything on drop.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryStore {
    fn append_events(&self, branch: BranchId, events: &[Event], head: EventId) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.events.extend_from_slice(events);
        inner.heads.insert(branch, head);
        Ok(())
    }

    fn put_branch(&self, branch: &Branch) -> StorageResult<()> {
        self.inner.lock().branches.insert(branch.id, branch.clone());
        Ok(())
    }

    fn remove_branch(&self, branch: BranchId) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.branches.remove(&branch);
        inner.heads.remove(&branch);
        Ok(())
    }

    fn load_events(&self) -> StorageResult<Vec<Event>> {
        Ok(self.inner.lock().events.clone())
    }

    fn load_heads(&self) -> StorageResult<Vec<(BranchId, EventId)>> {
        Ok(self.inner.lock().heads.iter().map(|(b, e)| (*b, *e)).collect())
    }

    fn load_branches(&self) -> StorageResult<Vec<Branch>> {
        Ok(self.inner.lock().branches.values().cloned().collect())
    }

    fn put_meta(&self, key: &str, value: &str) -> StorageResult<()> {
        self.inner.lock().meta.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.inner.lock().meta.get(key).cloned())
    }
}

// ============================================================================
// SqliteStore
// ============================================================================

const SCHEMA: &str = r#"
-- Events (append-only, immutable). seq preserves insertion order for replay.
CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    branch_id BLOB NOT NULL,
    event_id BLOB NOT NULL UNIQUE,
    parent_id BLOB,
    extra_parents BLOB,
    kind TEXT NOT NULL,
    object_id TEXT,
    payload TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    author BLOB NOT NULL,
    origin BLOB
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_branch ON events(branch_id, event_id);

-- Head index
CREATE TABLE IF NOT EXISTS heads (
    branch_id BLOB PRIMARY KEY,
    head_event_id BLOB NOT NULL
);

-- Branch metadata
CREATE TABLE IF NOT EXISTS branches (
    branch_id BLOB PRIMARY KEY,
    label TEXT,
    parent_branch_id BLOB,
    fork_point_event_id BLOB,
    is_primary INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    creator BLOB NOT NULL,
    reason TEXT,
    decoherent INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SQLite-backed store. One connection, serialized behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

fn id_bytes<const N: usize>(raw: Vec<u8>, what: &str) -> StorageResult<[u8; N]> {
    raw.try_into()
        .map_err(|v: Vec<u8>| StorageError::Corrupt(format!("{what}: expected {N} bytes, got {}", v.len())))
}

fn opt_event_id(raw: Option<Vec<u8>>, what: &str) -> StorageResult<Option<EventId>> {
    raw.map(|b| id_bytes(b, what).map(EventId::from_bytes)).transpose()
}

impl LogStore for SqliteStore {
    fn append_events(&self, branch: BranchId, events: &[Event], head: EventId) -> StorageResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO events (branch_id, event_id, parent_id, extra_parents, kind, object_id,
                                     payload, timestamp, author, origin)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for event in events {
                let extra = if event.merge_parents.is_empty() {
                    None
                } else {
                    Some(postcard::to_stdvec(&event.merge_parents)?)
                };
                stmt.execute(params![
                    event.branch_id.as_bytes().as_slice(),
                    event.id.as_bytes().as_slice(),
                    event.parent_id.map(|p| p.as_bytes().to_vec()),
                    extra,
                    event.kind.as_str(),
                    event.object_id.as_ref().map(|o| o.as_str()),
                    serde_json::to_string(&event.payload)?,
                    event.timestamp as i64,
                    event.author.as_bytes().as_slice(),
                    event.origin.map(|o| o.as_bytes().to_vec()),
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO heads (branch_id, head_event_id) VALUES (?1, ?2)
             ON CONFLICT(branch_id) DO UPDATE SET head_event_id = excluded.head_event_id",
            params![branch.as_bytes().as_slice(), head.as_bytes().as_slice()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn put_branch(&self, branch: &Branch) -> StorageResult<()> {
        self.conn.lock().execute(
            "INSERT INTO branches (branch_id, label, parent_branch_id, fork_point_event_id,
                                   is_primary, created_at, creator, reason, decoherent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(branch_id) DO UPDATE SET
                label = excluded.label,
                is_primary = excluded.is_primary,
                reason = excluded.reason,
                decoherent = excluded.decoherent",
            params![
                branch.id.as_bytes().as_slice(),
                branch.label,
                branch.parent_branch_id.map(|p| p.as_bytes().to_vec()),
                branch.fork_point_event_id.map(|e| e.as_bytes().to_vec()),
                branch.is_primary,
                branch.created_at as i64,
                branch.creator.as_bytes().as_slice(),
                branch.reason,
                branch.decoherent,
            ],
        )?;
        Ok(())
    }

    fn remove_branch(&self, branch: BranchId) -> StorageResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM branches WHERE branch_id = ?1", params![branch.as_bytes().as_slice()])?;
        tx.execute("DELETE FROM heads WHERE branch_id = ?1", params![branch.as_bytes().as_slice()])?;
        tx.commit()?;
        Ok(())
    }

    fn load_events(&self) -> StorageResult<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT branch_id, event_id, parent_id, extra_parents, kind, object_id,
                    payload, timestamp, author, origin
             FROM events ORDER BY seq",
        )?;
        let mut rows = stmt.query([])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let extra: Option<Vec<u8>> = row.get(3)?;
            let merge_parents = match extra {
                Some(bytes) => postcard::from_bytes(&bytes)?,
                None => Vec::new(),
            };
            let kind: String = row.get(4)?;
            let object_id: Option<String> = row.get(5)?;
            let payload: String = row.get(6)?;
            let timestamp: i64 = row.get(7)?;
            events.push(Event {
                branch_id: BranchId::from_bytes(id_bytes(row.get(0)?, "branch_id")?),
                id: EventId::from_bytes(id_bytes(row.get(1)?, "event_id")?),
                parent_id: opt_event_id(row.get(2)?, "parent_id")?,
                merge_parents,
                kind: EventKind::parse(&kind),
                object_id: object_id.map(ObjectId::from),
                payload: serde_json::from_str(&payload)?,
                timestamp: timestamp as u64,
                author: PrincipalId::from_bytes(id_bytes(row.get(8)?, "author")?),
                origin: opt_event_id(row.get(9)?, "origin")?,
            });
        }
        Ok(events)
    }

    fn load_heads(&self) -> StorageResult<Vec<(BranchId, EventId)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT branch_id, head_event_id FROM heads")?;
        let mut rows = stmt.query([])?;
        let mut heads = Vec::new();
        while let Some(row) = rows.next()? {
            heads.push((
                BranchId::from_bytes(id_bytes(row.get(0)?, "branch_id")?),
                EventId::from_bytes(id_bytes(row.get(1)?, "head_event_id")?),
            ));
        }
        Ok(heads)
    }

    fn load_branches(&self) -> StorageResult<Vec<Branch>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT branch_id, label, parent_branch_id, fork_point_event_id, is_primary,
                    created_at, creator, reason, decoherent
             FROM branches ORDER BY created_at",
        )?;
        let mut rows = stmt.query([])?;
        let mut branches = Vec::new();
        while let Some(row) = rows.next()? {
            let parent: Option<Vec<u8>> = row.get(2)?;
            let created_at: i64 = row.get(5)?;
            branches.push(Branch {
                id: BranchId::from_bytes(id_bytes(row.get(0)?, "branch_id")?),
                label: row.get(1)?,
                parent_branch_id: parent
                    .map(|b| id_bytes(b, "parent_branch_id").map(BranchId::from_bytes))
                    .transpose()?,
                fork_point_event_id: opt_event_id(row.get(3)?, "fork_point_event_id")?,
                is_primary: row.get(4)?,
                created_at: created_at as u64,
                creator: PrincipalId::from_bytes(id_bytes(row.get(6)?, "creator")?),
                reason: row.get(7)?,
                decoherent: row.get(8)?,
            });
        }
        Ok(branches)
    }

    fn put_meta(&self, key: &str, value: &str) -> StorageResult<()> {
        self.conn.lock().execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<String>> {
        let value = self
            .conn
            .lock()
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }
}

// ============================================================================
// Tests
// ============================================================================
