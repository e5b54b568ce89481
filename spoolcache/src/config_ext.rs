//! Extension trait wiring the stream cache into `spoolconfig::Config`.
//!
//! Only compiled with the `spoolconfig` feature, so the cache itself stays
//! usable without the configuration layer.

use crate::StreamCache;
use anyhow::Result;
use spoolconfig::Config;
use std::time::Duration;

const DEFAULT_DIR: &str = "stream";
const DEFAULT_SIZE: i64 = 512 * 1024 * 1024;
const DEFAULT_MIN_LIFETIME: Duration = Duration::from_secs(3600);

/// Stream-cache settings read from the `stream_cache` section.
pub trait StreamCacheConfigExt {
    /// Cache directory, created on first use. Relative values resolve
    /// against the config directory.
    fn get_stream_cache_dir(&self) -> Result<String>;

    /// Size budget in bytes.
    fn get_stream_cache_size(&self) -> Result<i64>;

    /// Minimum time since last access before an entry may be evicted.
    fn get_stream_cache_min_lifetime(&self) -> Result<Duration>;

    /// Factory: a [`StreamCache`] built from the configured settings.
    fn create_stream_cache(&self) -> Result<StreamCache>;
}

impl StreamCacheConfigExt for Config {
    fn get_stream_cache_dir(&self) -> Result<String> {
        self.get_managed_dir(&["stream_cache", "directory"], DEFAULT_DIR)
    }

    fn get_stream_cache_size(&self) -> Result<i64> {
        self.get_size_or(&["stream_cache", "size"], DEFAULT_SIZE)
    }

    fn get_stream_cache_min_lifetime(&self) -> Result<Duration> {
        self.get_duration_or(&["stream_cache", "min_lifetime"], DEFAULT_MIN_LIFETIME)
    }

    fn create_stream_cache(&self) -> Result<StreamCache> {
        StreamCache::new(
            self.get_stream_cache_dir()?,
            self.get_stream_cache_size()?,
            self.get_stream_cache_min_lifetime()?,
        )
    }
}
