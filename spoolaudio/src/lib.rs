//! # spoolaudio - subprocess audio transcoding for SpoolSonic
//!
//! Streams audio through an external transcoder process (ffmpeg). The
//! pipeline reads the source from an [`SourceReader`] over stdin, clips it
//! to an offset/duration window, and exposes the transcoded bytes as an
//! [`FfmpegStream`] that only signals end-of-stream once the process exited
//! cleanly. Cancellation of the controlling token kills the process.

pub mod error;
pub mod ffmpeg;
pub mod source;

pub use error::TranscodeError;
pub use ffmpeg::{Ffmpeg, FfmpegStream, ANY_FORMAT, FALLBACK_FORMAT, SEEKABLE_FORMAT};
pub use source::SourceReader;
