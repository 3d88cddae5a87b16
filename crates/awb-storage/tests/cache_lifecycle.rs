use awb_core::CacheEntry;
use awb_storage::{
    entry_key, CacheConfig, KeyValueStore, MemoryStore, SnapshotCache, SqliteStore,
    SNAPSHOT_PREFIX,
};
use chrono::{TimeZone, Utc};
use tempfile::NamedTempFile;

fn raw_entry(session_id: &str, file_path: &str, content: &str, hour: u32) -> String {
    let viewed_at = Utc
        .with_ymd_and_hms(2026, 3, 1, hour, 0, 0)
        .single()
        .expect("valid timestamp");
    serde_json::to_string(&CacheEntry::new(session_id, file_path, content, viewed_at))
        .expect("serialize entry")
}

#[test]
fn store_then_read_then_clear_round_trip() {
    let cache = SnapshotCache::new(MemoryStore::new());

    assert!(cache.cached("s1", "docs/a.md").is_none());
    assert!(cache.store("s1", "docs/a.md", "v1"));

    let entry = cache.cached("s1", "docs/a.md").expect("entry present");
    assert_eq!(entry.content, "v1");
    assert_eq!(entry.session_id, "s1");
    assert_eq!(entry.file_path, "docs/a.md");
    assert!(chrono::DateTime::parse_from_rfc3339(&entry.viewed_at).is_ok());

    cache.clear("s1", Some("docs/a.md"));
    assert!(cache.cached("s1", "docs/a.md").is_none());
    // Clearing again is a no-op, not an error.
    cache.clear("s1", Some("docs/a.md"));
}

#[test]
fn sessions_never_observe_each_other() {
    let cache = SnapshotCache::new(MemoryStore::new());
    assert!(cache.store("s1", "f", "A"));
    assert!(cache.store("s2", "f", "B"));

    assert_eq!(cache.cached("s1", "f").expect("s1 entry").content, "A");
    assert_eq!(cache.cached("s2", "f").expect("s2 entry").content, "B");

    cache.clear("s1", None);
    assert!(cache.cached("s1", "f").is_none());
    assert_eq!(cache.cached("s2", "f").expect("s2 survives").content, "B");
}

#[test]
fn corrupt_entry_is_purged_on_read() {
    let cache = SnapshotCache::new(MemoryStore::new());
    let key = entry_key("s1", "broken.md");
    cache.kv().set(&key, "not json at all").expect("seed garbage");

    assert!(cache.cached("s1", "broken.md").is_none());
    assert!(
        !cache.kv().keys().expect("keys").contains(&key),
        "corrupt key must be deleted as a side effect of the read"
    );
}

#[test]
fn structurally_invalid_entry_is_treated_as_corrupt() {
    let cache = SnapshotCache::new(MemoryStore::new());
    let key = entry_key("s1", "hollow.md");
    // Valid JSON, but sessionId is empty, violating the entry invariant.
    let hollow = r#"{"filePath":"hollow.md","sessionId":"","content":"x","viewedAt":"2026-03-01T09:00:00+00:00"}"#;
    cache.kv().set(&key, hollow).expect("seed entry");

    assert!(cache.cached("s1", "hollow.md").is_none());
    assert!(!cache.kv().keys().expect("keys").contains(&key));
}

#[test]
fn session_entry_count_stays_under_the_ceiling() {
    let config = CacheConfig {
        max_entries_per_session: 5,
        eviction_batch: 2,
    };
    let cache = SnapshotCache::with_config(MemoryStore::new(), config);

    for index in 0..20 {
        assert!(cache.store("s1", &format!("file-{index}.md"), "body"));
    }

    let stats = cache.stats("s1");
    assert!(
        stats.session_entries <= 5,
        "eviction bound violated: {} entries",
        stats.session_entries
    );
}

#[test]
fn evict_oldest_removes_least_recently_stored_first() {
    let cache = SnapshotCache::new(MemoryStore::new());
    // Seed entries with explicit timestamps so ordering is deterministic.
    for (file, hour) in [("old.md", 8), ("mid.md", 10), ("new.md", 12)] {
        cache
            .kv()
            .set(&entry_key("s1", file), &raw_entry("s1", file, "x", hour))
            .expect("seed entry");
    }

    assert_eq!(cache.evict_oldest("s1", 2), 2);
    assert!(cache.cached("s1", "old.md").is_none());
    assert!(cache.cached("s1", "mid.md").is_none());
    assert!(cache.cached("s1", "new.md").is_some());
}

#[test]
fn evict_oldest_reports_actual_count_and_skips_corrupt_entries() {
    let cache = SnapshotCache::new(MemoryStore::new());
    cache
        .kv()
        .set(&entry_key("s1", "ok.md"), &raw_entry("s1", "ok.md", "x", 9))
        .expect("seed entry");
    cache
        .kv()
        .set(&entry_key("s1", "bad.md"), "garbage")
        .expect("seed garbage");

    // Only the parseable entry is an eviction candidate; the corrupt one
    // is left for the read path to purge.
    assert_eq!(cache.evict_oldest("s1", 5), 1);
    let keys = cache.kv().keys().expect("keys");
    assert!(keys.contains(&entry_key("s1", "bad.md")));
    assert_eq!(cache.evict_oldest("s1", 0), 0);
}

#[test]
fn quota_failure_evicts_a_batch_and_retries_once() {
    let config = CacheConfig {
        max_entries_per_session: 50,
        eviction_batch: 2,
    };
    let cache = SnapshotCache::with_config(MemoryStore::with_quota(3), config);

    assert!(cache.store("s1", "a.md", "1"));
    assert!(cache.store("s1", "b.md", "2"));
    assert!(cache.store("s1", "c.md", "3"));

    // Store is full; the next write fails once, evicts two oldest
    // entries for the session, and the retry lands.
    assert!(cache.store("s1", "d.md", "4"));
    assert!(cache.cached("s1", "d.md").is_some());
    assert!(cache.cached("s1", "c.md").is_some());
    assert!(cache.cached("s1", "a.md").is_none());
    assert!(cache.cached("s1", "b.md").is_none());
}

#[test]
fn write_failure_after_retry_degrades_to_false() {
    // A zero-capacity store can never accept the write; eviction frees
    // nothing, the retry fails, and the caller just sees `false`.
    let cache = SnapshotCache::new(MemoryStore::with_quota(0));
    assert!(!cache.store("s1", "a.md", "1"));
    assert!(cache.cached("s1", "a.md").is_none());
}

#[test]
fn stats_scan_counts_sessions_and_bytes() {
    let cache = SnapshotCache::new(MemoryStore::new());
    assert!(cache.store("s1", "a.md", "alpha"));
    assert!(cache.store("s1", "b.md", "beta"));
    assert!(cache.store("s2", "c.md", "gamma"));
    cache
        .kv()
        .set("unrelated:key", "ignored")
        .expect("seed unrelated");

    let stats = cache.stats("s1");
    assert_eq!(stats.total_entries, 3);
    assert_eq!(stats.session_entries, 2);
    assert!(stats.estimated_bytes > 0);

    let other = cache.stats("s2");
    assert_eq!(other.total_entries, 3);
    assert_eq!(other.session_entries, 1);
}

#[test]
fn clear_all_spares_keys_outside_the_snapshot_prefix() {
    let cache = SnapshotCache::new(MemoryStore::new());
    assert!(cache.store("s1", "a.md", "1"));
    assert!(cache.store("s2", "b.md", "2"));
    cache
        .kv()
        .set("unrelated:key", "survives")
        .expect("seed unrelated");

    cache.clear_all();

    let keys = cache.kv().keys().expect("keys");
    assert!(keys.iter().all(|key| !key.starts_with(SNAPSHOT_PREFIX)));
    assert!(keys.contains(&"unrelated:key".to_string()));
}

#[test]
fn sqlite_backed_cache_survives_reopen() {
    let file = NamedTempFile::new().expect("temp db");
    {
        let cache = SnapshotCache::new(SqliteStore::open(file.path()).expect("open"));
        assert!(cache.store("s1", "docs/a.md", "v1"));
    }
    let cache = SnapshotCache::new(SqliteStore::open(file.path()).expect("reopen"));
    let entry = cache.cached("s1", "docs/a.md").expect("persisted entry");
    assert_eq!(entry.content, "v1");
}
