//! Per-key read/write locking over a fixed set of stripes.
//!
//! Keys are hashed into a small, fixed number of `RwLock` stripes, which
//! bounds memory no matter how many distinct keys are ever locked. Two
//! unrelated keys landing in the same stripe serialize against each other;
//! callers must only rely on same-key mutual exclusion.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Shared token for a stripe; dropping it releases the shared hold.
pub type ReadToken = OwnedRwLockReadGuard<()>;

/// Exclusive token for a stripe; dropping it releases the exclusive hold.
pub type WriteToken = OwnedRwLockWriteGuard<()>;

/// Advisory per-key reader/writer lock with a bounded number of stripes.
#[derive(Debug)]
pub struct StripedRwLock {
    stripes: Vec<Arc<RwLock<()>>>,
    mask: usize,
}

impl StripedRwLock {
    /// Creates a lock with at least `stripes` stripes, rounded up to the
    /// next power of two.
    pub fn new(stripes: usize) -> Self {
        let count = stripes.max(1).next_power_of_two();
        Self {
            stripes: (0..count).map(|_| Arc::new(RwLock::new(()))).collect(),
            mask: count - 1,
        }
    }

    fn stripe(&self, key: &str) -> Arc<RwLock<()>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Arc::clone(&self.stripes[hasher.finish() as usize & self.mask])
    }

    /// Acquires a shared hold on `key`'s stripe, waiting out any exclusive
    /// holder.
    pub async fn read(&self, key: &str) -> ReadToken {
        self.stripe(key).read_owned().await
    }

    /// Attempts an exclusive hold on `key`'s stripe without blocking.
    ///
    /// Returns `None` if any shared or exclusive holder currently occupies
    /// the stripe.
    pub fn try_write(&self, key: &str) -> Option<WriteToken> {
        self.stripe(key).try_write_owned().ok()
    }

    /// Number of stripes actually allocated.
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rounds_stripe_count_up_to_power_of_two() {
        assert_eq!(StripedRwLock::new(1).stripe_count(), 1);
        assert_eq!(StripedRwLock::new(5).stripe_count(), 8);
        assert_eq!(StripedRwLock::new(64).stripe_count(), 64);
    }

    #[tokio::test]
    async fn readers_on_the_same_key_coexist() {
        let lock = StripedRwLock::new(16);

        let first = lock.read("track-1").await;
        let second = lock.read("track-1").await;

        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn try_write_fails_while_a_reader_holds_the_key() {
        let lock = StripedRwLock::new(16);

        let reader = lock.read("track-1").await;
        assert!(lock.try_write("track-1").is_none());

        drop(reader);
        assert!(lock.try_write("track-1").is_some());
    }

    #[tokio::test]
    async fn read_blocks_until_the_writer_releases() {
        let lock = Arc::new(StripedRwLock::new(16));

        let writer = lock.try_write("track-1").expect("uncontended write");

        let blocked = tokio::time::timeout(Duration::from_millis(50), lock.read("track-1")).await;
        assert!(blocked.is_err(), "read must wait for the writer");

        drop(writer);
        let _reader = tokio::time::timeout(Duration::from_millis(50), lock.read("track-1"))
            .await
            .expect("read must proceed once the writer is gone");
    }

    #[tokio::test]
    async fn try_write_fails_while_another_writer_holds_the_key() {
        let lock = StripedRwLock::new(16);

        let writer = lock.try_write("track-1").expect("uncontended write");
        assert!(lock.try_write("track-1").is_none());
        drop(writer);
    }
}
