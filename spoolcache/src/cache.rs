//! Disk-backed stream cache with a get-or-fill protocol.
//!
//! Bytes live as one file per entry in the cache directory; metadata lives
//! in SQLite ([`crate::db`]). Per-key locking goes through a
//! [`StripedRwLock`], which is what lets unlimited readers share an entry
//! while population and eviction stay exclusive.

use crate::db::{StreamCacheEntry, DB};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use spoolutils::{format_bytes, format_bytes_with_magnitude, GuardedReader, ReadToken, StripedRwLock};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

/// Byte stream handed over by a provider on a cache miss.
pub type ProviderStream = Box<dyn AsyncRead + Send + Unpin>;

/// Reader over a cached file; holds a shared stripe token so eviction
/// cannot delete the file mid-read. Dropping it releases the token.
pub type CachedReader = GuardedReader<tokio::fs::File, ReadToken>;

const LOCK_STRIPES: usize = 64;

/// Keyed stream cache: readers share, population and eviction exclude.
///
/// Designed to be cloned freely; clones share the same directory, database
/// and locks.
#[derive(Debug, Clone)]
pub struct StreamCache {
    dir: PathBuf,
    max_size: i64,
    min_lifetime: chrono::Duration,
    db: Arc<DB>,
    lock: Arc<StripedRwLock>,
    trim_guard: Arc<Mutex<()>>,
}

impl StreamCache {
    /// Opens the cache in `dir` (created if missing) with a size budget in
    /// bytes and a floor on how recently-accessed an entry must be to
    /// survive eviction.
    pub fn new(
        dir: impl AsRef<Path>,
        max_size: i64,
        min_lifetime: std::time::Duration,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let db = DB::init(&dir.join("streamcache.db"))?;

        Ok(Self {
            dir,
            max_size,
            min_lifetime: chrono::Duration::from_std(min_lifetime)?,
            db: Arc::new(db),
            lock: Arc::new(StripedRwLock::new(LOCK_STRIPES)),
            trim_guard: Arc::new(Mutex::new(())),
        })
    }

    /// Returns the cached bytes for `id`, populating the cache via
    /// `provider` on a miss.
    ///
    /// At most one population runs per key at a time; concurrent callers
    /// either wait it out or, once the entry exists, read it in parallel.
    /// Every successful return schedules a detached trim attempt.
    pub async fn get_or_fill<P, Fut>(
        &self,
        id: &str,
        provider: P,
    ) -> Result<(StreamCacheEntry, CachedReader)>
    where
        P: Fn() -> Fut,
        Fut: Future<Output = Result<(String, ProviderStream)>>,
    {
        loop {
            let write_token = loop {
                let read_token = self.lock.read(id).await;
                if let Some((entry, file)) = self.read_entry(id).await? {
                    self.spawn_trim();
                    return Ok((entry, GuardedReader::new(file, read_token)));
                }
                drop(read_token);

                // We won't get the write lock if:
                //  - another miss on the same key got it first and is
                //    populating; the next iteration blocks on the read lock
                //    until it finishes
                //  - readers are streaming the entry; then the read attempt
                //    above should have succeeded, retry
                //  - eviction holds it; wait it out the same way
                if let Some(token) = self.lock.try_write(id) {
                    break token;
                }
            };

            // double-checked: someone may have populated the entry between
            // our failed read and acquiring the write lock
            if self.read_entry(id).await?.is_some() {
                drop(write_token);
                // restart so the result is always served under a read lock
                // acquired after the write lock was released
                continue;
            }

            tracing::debug!("Populating stream cache for item id=`{}`", id);
            let (content_type, mut stream) = match provider().await {
                Ok(provided) => provided,
                Err(err) => {
                    drop(write_token);
                    return Err(err);
                }
            };

            let written = self.write_entry(id, &content_type, &mut stream).await;
            drop(stream);
            drop(write_token);
            written?;

            // loop back to step 1: the fast path now serves the fresh file
        }
    }

    /// Metadata lookup plus file open; `None` is a miss (no row, or a row
    /// whose file vanished and must be repopulated).
    async fn read_entry(&self, id: &str) -> Result<Option<(StreamCacheEntry, tokio::fs::File)>> {
        let entry = match self.db.touch_and_get(id)? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        match tokio::fs::File::open(self.dir.join(&entry.filename)).await {
            Ok(file) => Ok(Some((entry, file))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Streams the provider's bytes to disk, then persists the row. The row
    /// is the last step, so a half-written file is never reported as valid.
    async fn write_entry(
        &self,
        id: &str,
        content_type: &str,
        stream: &mut ProviderStream,
    ) -> Result<()> {
        let path = self.dir.join(id);
        let file = tokio::fs::File::create(&path).await?;
        let mut writer = BufWriter::new(file);

        let size = tokio::io::copy(stream, &mut writer).await?;
        writer.flush().await?;

        let now = Utc::now().to_rfc3339();
        self.db.insert(&StreamCacheEntry {
            id: id.to_string(),
            filename: id.to_string(),
            size: size as i64,
            content_type: content_type.to_string(),
            created_at: now.clone(),
            accessed_at: now,
        })?;

        Ok(())
    }

    /// Deletes an entry: row first (capturing the filename), then the file,
    /// tolerating the file already being absent.
    ///
    /// Fails without waiting when the entry is currently being read or
    /// populated.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let token = self
            .lock
            .try_write(id)
            .ok_or_else(|| anyhow!("couldn't acquire a write lock for item id=`{}`", id))?;

        let result = self.delete_locked(id).await;
        drop(token);
        result
    }

    async fn delete_locked(&self, id: &str) -> Result<()> {
        let filename = match self.db.delete_returning(id)? {
            Some(filename) => filename,
            None => return Ok(()),
        };

        match tokio::fs::remove_file(self.dir.join(&filename)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn spawn_trim(&self) {
        let cache = self.clone();
        tokio::spawn(async move {
            if let Err(err) = cache.trim().await {
                tracing::warn!("Stream data cache trimming failed: {}", err);
            }
        });
    }

    /// One best-effort trim pass: deletes least-recently-accessed entries
    /// until the cache fits the budget or no entry is old enough to evict.
    ///
    /// At most one pass runs at a time; a concurrent call is a no-op. A
    /// contended entry aborts the pass instead of fighting its readers.
    pub async fn trim(&self) -> Result<()> {
        let _guard = match self.trim_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::trace!("Stream cache is already being trimmed, skipping");
                return Ok(());
            }
        };

        tracing::debug!("Trimming stream data cache");

        loop {
            let info = self.db.cache_info()?;

            let Some(oldest) = info.oldest else {
                tracing::debug!("Stream data cache seems empty - done trimming");
                break;
            };

            let free_space = self.max_size - info.total_size;
            let space_stats = format!(
                "{} / {} taken, {} free",
                format_bytes_with_magnitude(info.total_size, self.max_size),
                format_bytes(self.max_size),
                format_bytes(free_space),
            );

            if free_space > 0 {
                tracing::debug!(
                    "Stream data cache has enough free space - done trimming ({})",
                    space_stats
                );
                break;
            }

            let accessed_at = DateTime::parse_from_rfc3339(&oldest.accessed_at)?;
            if accessed_at.with_timezone(&Utc) + self.min_lifetime > Utc::now() {
                tracing::warn!(
                    "No suitable candidates for deletion found in stream data cache, aborting trimming ({})",
                    space_stats
                );
                break;
            }

            tracing::debug!(
                "Deleting stream data cache item id=`{}` to free up {} ({})",
                oldest.id,
                format_bytes(oldest.size),
                space_stats
            );

            if let Err(err) = self.delete(&oldest.id).await {
                tracing::warn!(
                    "Failed to delete stream data cache item id=`{}`, aborting trimming ({}): {}",
                    oldest.id,
                    space_stats,
                    err
                );
                break;
            }
        }

        tracing::debug!("Stream data cache trimming finished");
        Ok(())
    }

    pub fn cache_dir(&self) -> &Path {
        &self.dir
    }

    pub fn db(&self) -> &Arc<DB> {
        &self.db
    }
}
