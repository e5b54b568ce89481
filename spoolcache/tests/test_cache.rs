use chrono::Utc;
use spoolcache::{ProviderStream, StreamCache};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

fn provided(content_type: &str, bytes: &[u8]) -> (String, ProviderStream) {
    (
        content_type.to_string(),
        Box::new(std::io::Cursor::new(bytes.to_vec())),
    )
}

/// Populates `id` with `bytes` and drains the returned reader.
async fn fill(cache: &StreamCache, id: &str, bytes: &'static [u8]) {
    let (_, mut reader) = cache
        .get_or_fill(id, || async move { Ok(provided("audio/mpeg", bytes)) })
        .await
        .unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, bytes);
}

#[tokio::test]
async fn concurrent_misses_populate_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StreamCache::new(dir.path(), 1024 * 1024, Duration::from_secs(3600)).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let calls = calls.clone();
        tasks.push(tokio::spawn(async move {
            let (entry, mut reader) = cache
                .get_or_fill("track-1", move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // keep the population window open so the other
                        // callers pile up on the lock
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(provided("audio/mpeg", b"the one true payload"))
                    }
                })
                .await
                .unwrap();

            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            (entry, out)
        }));
    }

    for task in tasks {
        let (entry, bytes) = task.await.unwrap();
        assert_eq!(entry.content_type, "audio/mpeg");
        assert_eq!(bytes, b"the one true payload");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.db().count().unwrap(), 1);
}

#[tokio::test]
async fn hit_serves_same_bytes_and_bumps_accessed_at() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StreamCache::new(dir.path(), 1024 * 1024, Duration::from_secs(3600)).unwrap();

    fill(&cache, "track-2", b"stable bytes").await;
    let first = cache.db().get("track-2").unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let (entry, mut reader) = cache
        .get_or_fill("track-2", || async {
            panic!("a hit must not call the provider")
        })
        .await
        .unwrap();

    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"stable bytes");
    assert_eq!(entry.content_type, first.content_type);
    assert_eq!(entry.created_at, first.created_at);

    let before = chrono::DateTime::parse_from_rfc3339(&first.accessed_at).unwrap();
    let after = chrono::DateTime::parse_from_rfc3339(&entry.accessed_at).unwrap();
    assert!(after > before);
}

#[tokio::test]
async fn trim_spares_recently_accessed_entries() {
    let dir = tempfile::tempdir().unwrap();
    // over budget immediately, but everything is too fresh to evict
    let cache = StreamCache::new(dir.path(), 1, Duration::from_secs(60)).unwrap();

    fill(&cache, "fresh", b"way over the one byte budget").await;

    cache.trim().await.unwrap();
    assert_eq!(cache.db().count().unwrap(), 1);

    // age the entry past the retention floor, now it goes
    let aged = (Utc::now() - chrono::Duration::seconds(90)).to_rfc3339();
    cache.db().set_accessed_at("fresh", &aged).unwrap();

    cache.trim().await.unwrap();
    assert_eq!(cache.db().count().unwrap(), 0);
    assert!(!dir.path().join("fresh").exists());
}

#[tokio::test]
async fn trim_deletes_least_recently_accessed_until_under_budget() {
    let dir = tempfile::tempdir().unwrap();

    // populate with a long retention floor so the background trims that
    // successful gets schedule cannot evict anything yet
    let populate = StreamCache::new(dir.path(), 10, Duration::from_secs(3600)).unwrap();
    fill(&populate, "oldest", b"8 bytes!").await;
    fill(&populate, "middle", b"8 bytes!").await;
    fill(&populate, "newest", b"8 bytes!").await;

    let now = Utc::now();
    for (id, age) in [("oldest", 30), ("middle", 20), ("newest", 10)] {
        populate
            .db()
            .set_accessed_at(id, &(now - chrono::Duration::seconds(age)).to_rfc3339())
            .unwrap();
    }

    let trimmer = StreamCache::new(dir.path(), 10, Duration::ZERO).unwrap();
    trimmer.trim().await.unwrap();

    // 24 bytes over a 10 byte budget: two deletions bring it to 8
    assert_eq!(trimmer.db().count().unwrap(), 1);
    assert!(trimmer.db().get("newest").unwrap().is_some());
    assert!(!dir.path().join("oldest").exists());
    assert!(!dir.path().join("middle").exists());
}

#[tokio::test]
async fn held_reader_blocks_deletion_and_trimming() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StreamCache::new(dir.path(), 1, Duration::ZERO).unwrap();

    // a background trim may evict between calls with this budget, so the
    // provider has to be able to repopulate; what matters is that once the
    // reader is out, the entry is pinned
    let (_, reader) = cache
        .get_or_fill("guarded", || async {
            Ok(provided("audio/mpeg", b"do not tear this"))
        })
        .await
        .unwrap();

    // direct deletion refuses rather than waits
    assert!(cache.delete("guarded").await.is_err());

    // the trimmer gives up on the contended entry and leaves it intact
    cache.trim().await.unwrap();
    assert!(cache.db().get("guarded").unwrap().is_some());
    assert!(dir.path().join("guarded").exists());

    drop(reader);

    cache.delete("guarded").await.unwrap();
    assert!(cache.db().get("guarded").unwrap().is_none());
    assert!(!dir.path().join("guarded").exists());
}

#[tokio::test]
async fn provider_failure_leaves_no_entry_behind() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StreamCache::new(dir.path(), 1024, Duration::from_secs(3600)).unwrap();

    let result = cache
        .get_or_fill("broken", || async {
            Err(anyhow::anyhow!("source is unavailable"))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(cache.db().count().unwrap(), 0);
    assert!(!dir.path().join("broken").exists());

    // the key is not poisoned, a later attempt can still populate
    fill(&cache, "broken", b"second try works").await;
}

#[tokio::test]
async fn missing_file_behind_a_row_triggers_repopulation() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StreamCache::new(dir.path(), 1024, Duration::from_secs(3600)).unwrap();

    fill(&cache, "vanished", b"first payload").await;
    std::fs::remove_file(cache.cache_dir().join("vanished")).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let provider_calls = calls.clone();
    let (_, mut reader) = cache
        .get_or_fill("vanished", move || {
            let calls = provider_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(provided("audio/mpeg", b"fresh payload"))
            }
        })
        .await
        .unwrap();

    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"fresh payload");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
