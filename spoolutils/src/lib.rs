//! # spoolutils - shared infrastructure for SpoolSonic
//!
//! Small, dependency-light building blocks used across the workspace:
//!
//! - [`StripedRwLock`]: advisory per-key reader/writer locking over a fixed
//!   number of stripes
//! - [`GuardedReader`]: a readable/seekable stream that keeps an owned guard
//!   alive for as long as it is being read
//! - byte-count formatting and audio format/MIME mapping helpers

pub mod bytes_fmt;
pub mod io;
pub mod media;
pub mod striped_lock;

pub use bytes_fmt::{format_bytes, format_bytes_with_magnitude};
pub use io::GuardedReader;
pub use media::{format_to_media_type, media_type_to_format};
pub use striped_lock::{ReadToken, StripedRwLock, WriteToken};
