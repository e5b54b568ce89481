//! # spoolcache - on-disk stream cache for SpoolSonic
//!
//! Caches transcoded audio streams as files in a managed directory, with
//! SQLite metadata and LRU trimming to a size budget. The central entry
//! point is [`StreamCache::get_or_fill`]: concurrent readers of the same
//! key share the cached file while exactly one caller populates it on a
//! miss.

pub mod cache;
pub mod db;

#[cfg(feature = "spoolconfig")]
pub mod config_ext;

pub use cache::{CachedReader, ProviderStream, StreamCache};
pub use db::{CacheInfo, StreamCacheEntry, DB};

#[cfg(feature = "spoolconfig")]
pub use config_ext::StreamCacheConfigExt;
