//! Persistence substrate and the session-scoped snapshot cache.
//!
//! The cache keeps one "last viewed" content snapshot per `(session, file)`
//! pair in an injected key-value store. Reads are self-healing: corrupt
//! entries are purged instead of surfaced. Writes are best-effort: a quota
//! failure triggers one eviction-and-retry round, then degrades to `false`.
//! No storage failure ever propagates to the caller as an error.

use awb_core::{CacheEntry, CacheStats};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Common prefix for every snapshot key across all sessions.
pub const SNAPSHOT_PREFIX: &str = "awb:snapshot:";

pub const KV_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
}

/// Synchronous key-value persistence substrate.
///
/// Writes are fallible (quota exhaustion, I/O); reads may fail as well.
/// Implementations provide whatever single-key atomicity the backing
/// medium offers; the cache layers no locking on top.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// SQLite-backed key-value store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv_entries (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );",
            )?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }
        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO kv_entries (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM kv_entries WHERE key = ?1", [key])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut statement = self.conn.prepare("SELECT key FROM kv_entries")?;
        let rows = statement.query_map([], |row| row.get(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

/// In-memory key-value store with an optional entry quota.
///
/// Overwriting an existing key always succeeds; inserting a new key past
/// the quota fails with `QuotaExceeded`, which is the failure mode the
/// cache's eviction-and-retry path is built around.
#[derive(Default)]
pub struct MemoryStore {
    entries: RefCell<BTreeMap<String, String>>,
    max_entries: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(max_entries: usize) -> Self {
        Self {
            entries: RefCell::new(BTreeMap::new()),
            max_entries: Some(max_entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.borrow_mut();
        if let Some(limit) = self.max_entries {
            if !entries.contains_key(key) && entries.len() >= limit {
                return Err(StorageError::QuotaExceeded(format!(
                    "store holds {limit} entries"
                )));
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.borrow().keys().cloned().collect())
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Per-session entry ceiling; overflow is evicted oldest-first.
    pub max_entries_per_session: usize,
    /// How many entries one quota-failure eviction round removes.
    pub eviction_batch: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries_per_session: 50,
            eviction_batch: 10,
        }
    }
}

/// Session-scoped cache of last-viewed document snapshots.
///
/// Every operation is best-effort: storage failures and corrupt entries
/// degrade to absence (`None`/`false`/`0`) and a diagnostic log line,
/// never a panic or a propagated error.
pub struct SnapshotCache<S: KeyValueStore> {
    kv: S,
    config: CacheConfig,
}

impl<S: KeyValueStore> SnapshotCache<S> {
    pub fn new(kv: S) -> Self {
        Self::with_config(kv, CacheConfig::default())
    }

    pub fn with_config(kv: S, config: CacheConfig) -> Self {
        Self { kv, config }
    }

    /// Returns the last-viewed snapshot for `(session_id, file_path)`.
    ///
    /// A stored value that fails to deserialize or validate is deleted as
    /// a side effect and reported as absent, so a corrupt entry can never
    /// poison future reads.
    pub fn cached(&self, session_id: &str, file_path: &str) -> Option<CacheEntry> {
        let key = entry_key(session_id, file_path);
        let raw = match self.kv.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(event = "snapshot_read_error", key = %key, error = %err);
                return None;
            }
        };

        let parsed = serde_json::from_str::<CacheEntry>(&raw)
            .map_err(|err| err.to_string())
            .and_then(|entry| {
                entry
                    .validate()
                    .map_err(|err| err.to_string())
                    .map(|_| entry)
            });

        match parsed {
            Ok(entry) => Some(entry),
            Err(reason) => {
                warn!(event = "snapshot_corrupt_purged", key = %key, reason = %reason);
                if let Err(err) = self.kv.remove(&key) {
                    warn!(event = "snapshot_purge_error", key = %key, error = %err);
                }
                None
            }
        }
    }

    /// Records `content` as the new last-viewed snapshot.
    ///
    /// On a write failure the cache evicts one batch of the session's
    /// oldest entries and retries exactly once; a second failure returns
    /// `false`. On success the per-session entry ceiling is enforced by
    /// evicting the overflow. Callers treat the return as advisory.
    pub fn store(&self, session_id: &str, file_path: &str, content: &str) -> bool {
        let entry = CacheEntry::new(session_id, file_path, content, Utc::now());
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(event = "snapshot_encode_error", error = %err);
                return false;
            }
        };

        let key = entry_key(session_id, file_path);
        if let Err(first) = self.kv.set(&key, &raw) {
            warn!(
                event = "snapshot_write_retry",
                key = %key,
                evicting = self.config.eviction_batch,
                error = %first
            );
            self.evict_oldest(session_id, self.config.eviction_batch);
            if let Err(err) = self.kv.set(&key, &raw) {
                warn!(event = "snapshot_write_failed", key = %key, error = %err);
                return false;
            }
        }

        let session_count = self
            .session_keys(session_id)
            .map(|keys| keys.len())
            .unwrap_or(0);
        if session_count > self.config.max_entries_per_session {
            self.evict_oldest(
                session_id,
                session_count - self.config.max_entries_per_session,
            );
        }

        true
    }

    /// Removes one entry, or every entry of the session when `file_path`
    /// is `None`. Clearing something that does not exist is not an error.
    pub fn clear(&self, session_id: &str, file_path: Option<&str>) {
        let keys = match file_path {
            Some(path) => vec![entry_key(session_id, path)],
            None => self.session_keys(session_id).unwrap_or_else(|err| {
                warn!(event = "snapshot_clear_scan_error", session_id, error = %err);
                Vec::new()
            }),
        };
        for key in keys {
            if let Err(err) = self.kv.remove(&key) {
                warn!(event = "snapshot_clear_error", key = %key, error = %err);
            }
        }
    }

    /// Evicts the `count` least-recently-stored entries of the session.
    ///
    /// Entries that fail to parse during the scan are skipped, not
    /// deleted; purging corrupt data is the read path's job. Returns the
    /// number actually removed, which may be less than requested.
    pub fn evict_oldest(&self, session_id: &str, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let keys = match self.session_keys(session_id) {
            Ok(keys) => keys,
            Err(err) => {
                warn!(event = "snapshot_evict_scan_error", session_id, error = %err);
                return 0;
            }
        };

        let mut candidates: Vec<(DateTime<Utc>, String)> = Vec::new();
        for key in keys {
            let Ok(Some(raw)) = self.kv.get(&key) else {
                continue;
            };
            let Ok(entry) = serde_json::from_str::<CacheEntry>(&raw) else {
                continue;
            };
            let Ok(viewed_at) = DateTime::parse_from_rfc3339(&entry.viewed_at) else {
                continue;
            };
            candidates.push((viewed_at.with_timezone(&Utc), key));
        }
        candidates.sort_by(|left, right| left.0.cmp(&right.0).then(left.1.cmp(&right.1)));

        let mut evicted = 0usize;
        for (_, key) in candidates.into_iter().take(count) {
            match self.kv.remove(&key) {
                Ok(()) => evicted += 1,
                Err(err) => {
                    warn!(event = "snapshot_evict_error", key = %key, error = %err);
                }
            }
        }
        evicted
    }

    /// Recomputes occupancy figures by scanning every snapshot key.
    ///
    /// O(n) over all storage keys; diagnostics only, not the hot path.
    pub fn stats(&self, session_id: &str) -> CacheStats {
        let keys = match self.kv.keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(event = "snapshot_stats_error", session_id, error = %err);
                return CacheStats::default();
            }
        };

        let prefix = session_prefix(session_id);
        let mut stats = CacheStats::default();
        for key in keys {
            if !key.starts_with(SNAPSHOT_PREFIX) {
                continue;
            }
            stats.total_entries += 1;
            if key.starts_with(&prefix) {
                stats.session_entries += 1;
            }
            if let Ok(Some(raw)) = self.kv.get(&key) {
                stats.estimated_bytes += raw.len();
            }
        }
        stats
    }

    /// Removes every snapshot entry across all sessions, leaving keys
    /// outside the snapshot prefix untouched.
    pub fn clear_all(&self) {
        let keys = match self.kv.keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(event = "snapshot_clear_all_scan_error", error = %err);
                return;
            }
        };
        for key in keys {
            if !key.starts_with(SNAPSHOT_PREFIX) {
                continue;
            }
            if let Err(err) = self.kv.remove(&key) {
                warn!(event = "snapshot_clear_error", key = %key, error = %err);
            }
        }
    }

    /// Direct access to the backing store, mainly for diagnostics and tests.
    pub fn kv(&self) -> &S {
        &self.kv
    }

    fn session_keys(&self, session_id: &str) -> Result<Vec<String>, StorageError> {
        let prefix = session_prefix(session_id);
        Ok(self
            .kv
            .keys()?
            .into_iter()
            .filter(|key| key.starts_with(&prefix))
            .collect())
    }
}

/// Key for one `(session, file)` snapshot.
pub fn entry_key(session_id: &str, file_path: &str) -> String {
    format!("{}{}:{}", SNAPSHOT_PREFIX, encode_segment(session_id), file_path)
}

/// Prefix shared by every key of one session.
pub fn session_prefix(session_id: &str) -> String {
    format!("{}{}:", SNAPSHOT_PREFIX, encode_segment(session_id))
}

/// Escapes the key delimiter inside a session id so two sessions can never
/// collide or prefix-shadow each other, whatever their file paths are.
fn encode_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace(':', "%3A")
}
