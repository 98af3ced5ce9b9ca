use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::identity::Platform;

/// Durable record of a previously fetched artifact.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub resource_id: String,
    pub platform: String,
    pub variant_id: String,
    pub source_url: String,
    pub title: String,
    pub resolution: String,
    pub download_count: i64,
    pub last_accessed_at: DateTime<Utc>,
    pub size_bytes: i64,
    pub file_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Insert payload; the store fills in counters and timestamps.
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub resource_id: String,
    pub platform: Platform,
    pub variant_id: String,
    pub source_url: String,
    pub title: String,
    pub resolution: String,
    pub file_path: PathBuf,
    pub size_bytes: i64,
}

/// Content-addressed artifact index with a storage budget.
///
/// The store owns its SQLite index and every file it references; callers
/// release artifacts through [`CacheStore::release`] rather than deleting
/// files directly. All methods are blocking; async callers go through
/// `tokio::task::spawn_blocking`. The single connection mutex also
/// serializes the read-then-write sequences in the self-healing lookup
/// and in the eviction sweep.
#[derive(Clone)]
pub struct CacheStore {
    conn: Arc<Mutex<Connection>>,
    max_bytes: i64,
}

impl CacheStore {
    pub fn open(cache_dir: &Path, max_bytes: i64, retention: Duration) -> Result<Self> {
        fs::create_dir_all(cache_dir)
            .with_context(|| format!("Failed to create cache dir {}", cache_dir.display()))?;

        let db_path = cache_dir.join("media_cache.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open cache index {}", db_path.display()))?;
        init_schema(&conn)?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            max_bytes,
        };

        match store.evict_expired(retention) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Startup retention sweep removed stale cache entries"),
            Err(err) => warn!("Startup retention sweep failed: {err:#}"),
        }

        Ok(store)
    }

    /// Looks up an artifact by its composite identity. An indexed file
    /// that no longer exists on disk is purged and reported as a miss;
    /// the index is never trusted blindly.
    pub fn lookup(
        &self,
        resource_id: &str,
        platform: Platform,
        variant_id: &str,
    ) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock().expect("cache mutex poisoned");

        let row = conn
            .query_row(
                "SELECT id, resource_id, platform, variant_id, source_url, title, resolution,
                        download_count, last_accessed_at, file_size, file_path, created_at
                 FROM media_cache
                 WHERE resource_id = ?1 AND platform = ?2 AND variant_id = ?3",
                params![resource_id, platform.as_str(), variant_id],
                |row| {
                    let id: i64 = row.get(0)?;
                    Ok((id, entry_from_row(row)?))
                },
            )
            .optional()
            .context("Cache lookup query failed")?;

        let Some((row_id, entry)) = row else {
            return Ok(None);
        };

        if !entry.file_path.exists() {
            warn!(
                resource_id,
                file_path = %entry.file_path.display(),
                "Cached file missing from disk, purging stale index row"
            );
            conn.execute("DELETE FROM media_cache WHERE id = ?1", params![row_id])
                .context("Failed to purge stale cache row")?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// Registers an artifact, evicting least-recently-accessed entries
    /// first if the budget would be exceeded. Re-inserting an existing
    /// identity refreshes the metadata and bumps the download counter
    /// instead of duplicating the row.
    pub fn insert(&self, entry: NewCacheEntry) -> Result<()> {
        let conn = self.conn.lock().expect("cache mutex poisoned");

        ensure_budget(&conn, entry.size_bytes, self.max_bytes)?;

        let now = now_stamp();
        conn.execute(
            "INSERT INTO media_cache
                 (resource_id, platform, variant_id, source_url, title, resolution,
                  download_count, last_accessed_at, file_size, file_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9, ?7)
             ON CONFLICT(resource_id, platform, variant_id) DO UPDATE SET
                 source_url = excluded.source_url,
                 title = excluded.title,
                 resolution = excluded.resolution,
                 file_size = excluded.file_size,
                 file_path = excluded.file_path,
                 last_accessed_at = excluded.last_accessed_at,
                 download_count = download_count + 1",
            params![
                entry.resource_id,
                entry.platform.as_str(),
                entry.variant_id,
                entry.source_url,
                entry.title,
                entry.resolution,
                now,
                entry.size_bytes,
                path_str(&entry.file_path),
            ],
        )
        .context("Failed to upsert cache entry")?;

        debug!(
            resource_id = %entry.resource_id,
            platform = entry.platform.as_str(),
            variant_id = %entry.variant_id,
            size_bytes = entry.size_bytes,
            "Artifact registered in cache"
        );
        Ok(())
    }

    /// Records a cache hit: bumps the download counter and refreshes the
    /// access timestamp that drives eviction order.
    pub fn increment_hit(
        &self,
        resource_id: &str,
        platform: Platform,
        variant_id: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("cache mutex poisoned");
        conn.execute(
            "UPDATE media_cache
             SET download_count = download_count + 1, last_accessed_at = ?1
             WHERE resource_id = ?2 AND platform = ?3 AND variant_id = ?4",
            params![now_stamp(), resource_id, platform.as_str(), variant_id],
        )
        .context("Failed to bump download counter")?;
        Ok(())
    }

    /// Entries with at least `min_downloads` hits, most popular first.
    pub fn popular(&self, min_downloads: i64) -> Result<Vec<CacheEntry>> {
        let conn = self.conn.lock().expect("cache mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, resource_id, platform, variant_id, source_url, title, resolution,
                    download_count, last_accessed_at, file_size, file_path, created_at
             FROM media_cache
             WHERE download_count >= ?1
             ORDER BY download_count DESC, last_accessed_at DESC",
        )?;

        let rows = stmt.query_map(params![min_downloads], |row| entry_from_row(row))?;
        let mut entries = Vec::new();
        for row in rows {
            match row {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!("Skipping unreadable cache row: {err}"),
            }
        }
        Ok(entries)
    }

    /// Removes entries not accessed within `max_age`, file first and index
    /// row second. A file that cannot be deleted keeps its row; the batch
    /// continues with the next entry.
    pub fn evict_expired(&self, max_age: Duration) -> Result<usize> {
        let conn = self.conn.lock().expect("cache mutex poisoned");
        let cutoff = stamp(Utc::now() - chrono::Duration::from_std(max_age)?);

        let candidates: Vec<(i64, String)> = {
            let mut stmt = conn.prepare(
                "SELECT id, file_path FROM media_cache WHERE last_accessed_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.filter_map(|r| r.ok()).collect()
        };

        let mut removed = 0;
        for (row_id, file_path) in candidates {
            if let Err(err) = remove_file_tolerant(Path::new(&file_path)) {
                warn!(file_path = %file_path, "Could not delete expired cache file: {err}");
                continue;
            }
            if let Err(err) = conn.execute("DELETE FROM media_cache WHERE id = ?1", params![row_id])
            {
                warn!(file_path = %file_path, "Could not delete expired cache row: {err}");
                continue;
            }
            info!(file_path = %file_path, "Expired cache entry removed");
            removed += 1;
        }
        Ok(removed)
    }

    /// Explicitly gives up an artifact: deletes the file and its index
    /// row. This is the only sanctioned way to remove a registered file.
    pub fn release(&self, resource_id: &str, platform: Platform, variant_id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("cache mutex poisoned");

        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, file_path FROM media_cache
                 WHERE resource_id = ?1 AND platform = ?2 AND variant_id = ?3",
                params![resource_id, platform.as_str(), variant_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Cache release query failed")?;

        let Some((row_id, file_path)) = row else {
            return Ok(false);
        };

        remove_file_tolerant(Path::new(&file_path))
            .with_context(|| format!("Failed to release cached file {file_path}"))?;
        conn.execute("DELETE FROM media_cache WHERE id = ?1", params![row_id])
            .context("Failed to delete released cache row")?;
        info!(resource_id, variant_id, "Cache entry released");
        Ok(true)
    }

    pub fn total_bytes(&self) -> Result<i64> {
        let conn = self.conn.lock().expect("cache mutex poisoned");
        let total = conn.query_row(
            "SELECT COALESCE(SUM(file_size), 0) FROM media_cache",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    #[cfg(test)]
    fn backdate(&self, resource_id: &str, variant_id: &str, accessed_at: DateTime<Utc>) {
        let conn = self.conn.lock().expect("cache mutex poisoned");
        conn.execute(
            "UPDATE media_cache SET last_accessed_at = ?1
             WHERE resource_id = ?2 AND variant_id = ?3",
            params![stamp(accessed_at), resource_id, variant_id],
        )
        .expect("backdate update");
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS media_cache (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             resource_id TEXT NOT NULL,
             platform TEXT NOT NULL,
             variant_id TEXT NOT NULL,
             source_url TEXT NOT NULL,
             title TEXT NOT NULL,
             resolution TEXT NOT NULL,
             download_count INTEGER NOT NULL DEFAULT 1,
             last_accessed_at TEXT NOT NULL,
             file_size INTEGER NOT NULL,
             file_path TEXT NOT NULL,
             created_at TEXT NOT NULL
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_platform_variant
             ON media_cache(resource_id, platform, variant_id);
         CREATE INDEX IF NOT EXISTS idx_download_count ON media_cache(download_count);
         CREATE INDEX IF NOT EXISTS idx_last_accessed ON media_cache(last_accessed_at);",
    )
    .context("Failed to initialize cache schema")
}

/// LRU sweep run before an insert lands: oldest-accessed entries go first
/// until the incoming artifact fits the budget. Entries whose file cannot
/// be deleted are skipped so a bad file never wedges eviction.
fn ensure_budget(conn: &Connection, incoming_bytes: i64, max_bytes: i64) -> Result<()> {
    let mut total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(file_size), 0) FROM media_cache",
        [],
        |row| row.get(0),
    )?;

    if total + incoming_bytes <= max_bytes {
        return Ok(());
    }

    info!(
        total_bytes = total,
        incoming_bytes, max_bytes, "Cache over budget, evicting least recently accessed entries"
    );

    let victims: Vec<(i64, String, i64)> = {
        let mut stmt = conn.prepare(
            "SELECT id, file_path, file_size FROM media_cache ORDER BY last_accessed_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        rows.filter_map(|r| r.ok()).collect()
    };

    for (row_id, file_path, file_size) in victims {
        if let Err(err) = remove_file_tolerant(Path::new(&file_path)) {
            warn!(file_path = %file_path, "Eviction could not delete file, skipping entry: {err}");
            continue;
        }
        if let Err(err) = conn.execute("DELETE FROM media_cache WHERE id = ?1", params![row_id]) {
            warn!(file_path = %file_path, "Eviction could not delete index row: {err}");
            continue;
        }
        total -= file_size;
        info!(file_path = %file_path, file_size, "Evicted cache entry");

        if total + incoming_bytes <= max_bytes {
            break;
        }
    }

    Ok(())
}

/// A file that is already gone counts as deleted; its stale row holds no
/// bytes and removing it is what restores the index to the truth.
fn remove_file_tolerant(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        resource_id: row.get(1)?,
        platform: row.get(2)?,
        variant_id: row.get(3)?,
        source_url: row.get(4)?,
        title: row.get(5)?,
        resolution: row.get(6)?,
        download_count: row.get(7)?,
        last_accessed_at: parse_stamp(&row.get::<_, String>(8)?),
        size_bytes: row.get(9)?,
        file_path: PathBuf::from(row.get::<_, String>(10)?),
        created_at: parse_stamp(&row.get::<_, String>(11)?),
    })
}

// Fixed-width UTC stamps so lexicographic ordering in SQL matches time order.
fn stamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_stamp() -> String {
    stamp(Utc::now())
}

fn parse_stamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::{CacheStore, NewCacheEntry};
    use crate::identity::Platform;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::{fs, path::PathBuf, time::Duration};
    use tempfile::TempDir;

    const NO_RETENTION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    fn open_store(dir: &TempDir, max_bytes: i64) -> CacheStore {
        CacheStore::open(dir.path(), max_bytes, NO_RETENTION).expect("open store")
    }

    fn write_artifact(dir: &TempDir, name: &str, size: usize) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, vec![0u8; size]).expect("write artifact");
        path
    }

    fn entry(dir: &TempDir, resource_id: &str, size: i64) -> NewCacheEntry {
        let path = write_artifact(dir, &format!("{resource_id}.mp4"), size as usize);
        NewCacheEntry {
            resource_id: resource_id.to_string(),
            platform: Platform::Youtube,
            variant_id: "137".to_string(),
            source_url: format!("https://youtube.com/watch?v={resource_id}"),
            title: format!("video {resource_id}"),
            resolution: "1080p".to_string(),
            file_path: path,
            size_bytes: size,
        }
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1 << 30);

        store.insert(entry(&dir, "vid_a", 100)).unwrap();

        let found = store
            .lookup("vid_a", Platform::Youtube, "137")
            .unwrap()
            .expect("entry present");
        assert_eq!(found.resource_id, "vid_a");
        assert_eq!(found.size_bytes, 100);
        assert_eq!(found.download_count, 1);
        assert_eq!(found.resolution, "1080p");

        assert!(store
            .lookup("vid_a", Platform::Tiktok, "137")
            .unwrap()
            .is_none());
        assert!(store
            .lookup("vid_a", Platform::Youtube, "22")
            .unwrap()
            .is_none());
    }

    #[test]
    fn reinsert_updates_instead_of_duplicating() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1 << 30);

        store.insert(entry(&dir, "vid_a", 100)).unwrap();
        let mut second = entry(&dir, "vid_a", 150);
        second.title = "refreshed".to_string();
        store.insert(second).unwrap();

        let found = store
            .lookup("vid_a", Platform::Youtube, "137")
            .unwrap()
            .expect("entry present");
        assert_eq!(found.download_count, 2);
        assert_eq!(found.title, "refreshed");
        assert_eq!(found.size_bytes, 150);
        // One surviving row only.
        assert_eq!(store.total_bytes().unwrap(), 150);
    }

    #[test]
    fn increment_hit_bumps_counter_and_recency() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1 << 30);

        store.insert(entry(&dir, "vid_a", 10)).unwrap();
        store.backdate("vid_a", "137", Utc::now() - ChronoDuration::days(3));

        store
            .increment_hit("vid_a", Platform::Youtube, "137")
            .unwrap();

        let found = store
            .lookup("vid_a", Platform::Youtube, "137")
            .unwrap()
            .expect("entry present");
        assert_eq!(found.download_count, 2);
        assert!(found.last_accessed_at > Utc::now() - ChronoDuration::minutes(1));
    }

    #[test]
    fn budget_is_enforced_with_lru_eviction() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 6);

        // A(5 bytes) at t=1, then B(4 bytes) at t=2: A must be evicted.
        let a = entry(&dir, "vid_a", 5);
        let a_path = a.file_path.clone();
        store.insert(a).unwrap();
        store.backdate("vid_a", "137", Utc::now() - ChronoDuration::hours(1));

        store.insert(entry(&dir, "vid_b", 4)).unwrap();

        assert!(store
            .lookup("vid_a", Platform::Youtube, "137")
            .unwrap()
            .is_none());
        assert!(store
            .lookup("vid_b", Platform::Youtube, "137")
            .unwrap()
            .is_some());
        assert!(!a_path.exists());
        assert_eq!(store.total_bytes().unwrap(), 4);
    }

    #[test]
    fn eviction_removes_oldest_accessed_first() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 30);

        store.insert(entry(&dir, "old", 10)).unwrap();
        store.insert(entry(&dir, "mid", 10)).unwrap();
        store.insert(entry(&dir, "new", 10)).unwrap();
        store.backdate("old", "137", Utc::now() - ChronoDuration::days(3));
        store.backdate("mid", "137", Utc::now() - ChronoDuration::days(2));
        store.backdate("new", "137", Utc::now() - ChronoDuration::days(1));

        // Needs 10 bytes freed; only the oldest entry should go.
        store.insert(entry(&dir, "incoming", 10)).unwrap();

        assert!(store.lookup("old", Platform::Youtube, "137").unwrap().is_none());
        assert!(store.lookup("mid", Platform::Youtube, "137").unwrap().is_some());
        assert!(store.lookup("new", Platform::Youtube, "137").unwrap().is_some());
        assert!(store.total_bytes().unwrap() <= 30);
    }

    #[test]
    fn budget_holds_across_insert_sequences() {
        let dir = TempDir::new().unwrap();
        let budget = 25;
        let store = open_store(&dir, budget);

        for i in 0..12 {
            store.insert(entry(&dir, &format!("vid_{i}"), 7)).unwrap();
            assert!(store.total_bytes().unwrap() <= budget);
        }
    }

    #[test]
    fn lookup_self_heals_when_file_vanishes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1 << 30);

        let e = entry(&dir, "vid_a", 20);
        let path = e.file_path.clone();
        store.insert(e).unwrap();

        // Someone deletes the file behind the store's back.
        fs::remove_file(&path).unwrap();

        assert!(store
            .lookup("vid_a", Platform::Youtube, "137")
            .unwrap()
            .is_none());
        // The stale row is gone too, so popularity queries no longer see it.
        assert!(store.popular(1).unwrap().is_empty());
    }

    #[test]
    fn popular_orders_by_count_then_recency() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1 << 30);

        store.insert(entry(&dir, "one_hit", 10)).unwrap();
        store.insert(entry(&dir, "warm", 10)).unwrap();
        store.insert(entry(&dir, "hot", 10)).unwrap();
        for _ in 0..4 {
            store.increment_hit("hot", Platform::Youtube, "137").unwrap();
        }
        store.increment_hit("warm", Platform::Youtube, "137").unwrap();

        let popular = store.popular(2).unwrap();
        let ids: Vec<&str> = popular.iter().map(|e| e.resource_id.as_str()).collect();
        assert_eq!(ids, vec!["hot", "warm"]);
    }

    #[test]
    fn evict_expired_removes_only_stale_entries() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1 << 30);

        let stale = entry(&dir, "stale", 10);
        let stale_path = stale.file_path.clone();
        store.insert(stale).unwrap();
        store.insert(entry(&dir, "fresh", 10)).unwrap();
        store.backdate("stale", "137", Utc::now() - ChronoDuration::days(40));

        let removed = store.evict_expired(Duration::from_secs(30 * 24 * 60 * 60)).unwrap();
        assert_eq!(removed, 1);
        assert!(!stale_path.exists());
        assert!(store.lookup("stale", Platform::Youtube, "137").unwrap().is_none());
        assert!(store.lookup("fresh", Platform::Youtube, "137").unwrap().is_some());
    }

    #[test]
    fn release_deletes_file_and_row() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1 << 30);

        let e = entry(&dir, "vid_a", 10);
        let path = e.file_path.clone();
        store.insert(e).unwrap();

        assert!(store.release("vid_a", Platform::Youtube, "137").unwrap());
        assert!(!path.exists());
        assert!(store
            .lookup("vid_a", Platform::Youtube, "137")
            .unwrap()
            .is_none());
        // Releasing again is a no-op.
        assert!(!store.release("vid_a", Platform::Youtube, "137").unwrap());
    }
}
