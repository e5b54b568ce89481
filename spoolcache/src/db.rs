//! SQLite metadata layer for the stream cache.
//!
//! One row per cached stream, keyed by the caller-supplied id. A row exists
//! if and only if its backing file was completely written; the cache layer
//! only inserts the row after the file write succeeded.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

/// One cached stream's metadata.
#[derive(Debug, Serialize, Clone)]
pub struct StreamCacheEntry {
    /// Caller-supplied key, unique per entry.
    pub id: String,
    /// On-disk file name; equals `id` (the cache is keyed, not
    /// content-hashed).
    pub filename: String,
    /// Byte length of the stored file.
    pub size: i64,
    /// MIME type supplied by the provider at population time.
    pub content_type: String,
    /// Population timestamp (RFC3339), set once.
    pub created_at: String,
    /// Last successful read timestamp (RFC3339), bumped on every hit.
    pub accessed_at: String,
}

/// Aggregate view used by the trimmer, computed fresh per pass.
#[derive(Debug, Clone)]
pub struct CacheInfo {
    /// Sum of all entries' sizes.
    pub total_size: i64,
    /// Entry with the oldest `accessed_at`, if any entry exists.
    pub oldest: Option<StreamCacheEntry>,
}

const COLUMNS: &str = "id, filename, size, content_type, created_at, accessed_at";

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StreamCacheEntry> {
    Ok(StreamCacheEntry {
        id: row.get(0)?,
        filename: row.get(1)?,
        size: row.get(2)?,
        content_type: row.get(3)?,
        created_at: row.get(4)?,
        accessed_at: row.get(5)?,
    })
}

/// SQLite-backed store for [`StreamCacheEntry`] rows.
#[derive(Debug)]
pub struct DB {
    conn: Mutex<Connection>,
}

impl DB {
    /// Opens (creating if needed) the database at `path`.
    pub fn init(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS stream_cache_entries (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                size INTEGER NOT NULL,
                content_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                accessed_at TEXT NOT NULL
            )",
            [],
        )?;

        // eviction scans by least recent access
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_stream_cache_accessed_at
             ON stream_cache_entries (accessed_at ASC)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bumps `accessed_at` and returns the entry, or `None` when the id is
    /// not cached. A miss is an expected outcome, not an error.
    pub fn touch_and_get(&self, id: &str) -> rusqlite::Result<Option<StreamCacheEntry>> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE stream_cache_entries SET accessed_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;

        conn.query_row(
            &format!("SELECT {COLUMNS} FROM stream_cache_entries WHERE id = ?1"),
            [id],
            entry_from_row,
        )
        .optional()
    }

    /// Inserts (or replaces) an entry. Only called after the backing file
    /// was completely written.
    pub fn insert(&self, entry: &StreamCacheEntry) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO stream_cache_entries (id, filename, size, content_type, created_at, accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 filename = excluded.filename,
                 size = excluded.size,
                 content_type = excluded.content_type,
                 created_at = excluded.created_at,
                 accessed_at = excluded.accessed_at",
            params![
                entry.id,
                entry.filename,
                entry.size,
                entry.content_type,
                entry.created_at,
                entry.accessed_at,
            ],
        )?;
        Ok(())
    }

    /// Deletes the row and returns its filename, or `None` when the id was
    /// not cached.
    pub fn delete_returning(&self, id: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();

        let filename: Option<String> = conn
            .query_row(
                "SELECT filename FROM stream_cache_entries WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;

        if filename.is_some() {
            conn.execute("DELETE FROM stream_cache_entries WHERE id = ?1", [id])?;
        }

        Ok(filename)
    }

    /// Total size plus the oldest-accessed entry, for one trim iteration.
    pub fn cache_info(&self) -> rusqlite::Result<CacheInfo> {
        let conn = self.conn.lock().unwrap();

        let total_size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM stream_cache_entries",
            [],
            |row| row.get(0),
        )?;

        let oldest = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM stream_cache_entries
                     ORDER BY accessed_at ASC LIMIT 1"
                ),
                [],
                entry_from_row,
            )
            .optional()?;

        Ok(CacheInfo { total_size, oldest })
    }

    /// Number of entries.
    pub fn count(&self) -> rusqlite::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM stream_cache_entries", [], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }

    /// Reads an entry without bumping `accessed_at`.
    pub fn get(&self, id: &str) -> rusqlite::Result<Option<StreamCacheEntry>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM stream_cache_entries WHERE id = ?1"),
            [id],
            entry_from_row,
        )
        .optional()
    }

    /// Rewrites `accessed_at` for an existing entry. Mainly useful to age
    /// entries artificially when exercising the trimmer.
    pub fn set_accessed_at(&self, id: &str, accessed_at: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE stream_cache_entries SET accessed_at = ?1 WHERE id = ?2",
            params![accessed_at, id],
        )?;
        Ok(())
    }
}
