//! # spoolstream - track serving glue for SpoolSonic
//!
//! Decides, per request, between streaming a track's file directly and
//! serving a cached transcode. A track qualifies for direct streaming only
//! when the whole file is requested and its codec is on the allow-list;
//! anything else goes through the stream cache, populated by the transcode
//! pipeline on a miss.

use anyhow::Result;
use async_trait::async_trait;
use spoolaudio::{Ffmpeg, SourceReader, ANY_FORMAT};
use spoolcache::{ProviderStream, StreamCache};
use spoolutils::format_to_media_type;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Codecs clients are assumed to play natively; anything else is
/// transcoded.
pub const ALLOWED_STREAMING_CODECS: [&str; 3] = ["mp3", "flac", "opus"];

/// Everything the serving layer needs to know about a playable track.
#[derive(Debug, Clone)]
pub struct TrackSource {
    pub id: String,
    pub local_path: PathBuf,
    /// Audio codec of the file (e.g. `mp3`, `pcm_s16le`).
    pub codec: String,
    /// Container format of the file (e.g. `mp3`, `flac`, `wav`).
    pub format: String,
    /// Requested playback window start, milliseconds into the source.
    pub start_offset_ms: i64,
    /// Requested playback window end, milliseconds into the source.
    pub end_offset_ms: i64,
    /// Full length of the source in milliseconds.
    pub source_duration_ms: i64,
}

impl TrackSource {
    fn requests_whole_file(&self) -> bool {
        self.start_offset_ms == 0 && self.end_offset_ms == self.source_duration_ms
    }
}

/// Catalog lookup: maps a track id to its source. Implemented by whatever
/// library backend owns the metadata.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, id: &str) -> Result<TrackSource>;
}

/// One playable stream handed to the caller.
pub struct AudioStream {
    pub media_type: String,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("media_type", &self.media_type)
            .finish_non_exhaustive()
    }
}

/// Serving facade over a resolver, the stream cache and the transcoder.
pub struct StreamService<R> {
    resolver: R,
    cache: StreamCache,
    ffmpeg: Arc<Ffmpeg>,
}

impl<R: TrackResolver> StreamService<R> {
    pub fn new(resolver: R, cache: StreamCache, ffmpeg: Arc<Ffmpeg>) -> Self {
        Self {
            resolver,
            cache,
            ffmpeg,
        }
    }

    /// Resolves `id` and streams it, directly when possible, otherwise
    /// through the cache.
    pub async fn stream(&self, id: &str) -> Result<AudioStream> {
        let track = self.resolver.resolve(id).await?;

        if let Some(reason) = direct_streaming_obstacle(&track) {
            tracing::debug!(
                "Direct streaming for track id=`{}` forbidden because {}",
                track.id,
                reason
            );
            return self.stream_cached_transcode(track).await;
        }

        tracing::debug!(
            "Streaming track id=`{}` directly from `{}`",
            track.id,
            track.local_path.display()
        );
        let file = tokio::fs::File::open(&track.local_path).await?;
        Ok(AudioStream {
            media_type: format_to_media_type(&track.format).to_string(),
            reader: Box::new(file),
        })
    }

    async fn stream_cached_transcode(&self, track: TrackSource) -> Result<AudioStream> {
        let key = format!("spoolsonic-{}", track.id);
        let ffmpeg = self.ffmpeg.clone();

        // the cache may invoke the provider again after losing a race with
        // eviction, so it has to reopen the source each time
        let provider = move || {
            let ffmpeg = ffmpeg.clone();
            let track = track.clone();
            async move {
                let file = tokio::fs::File::open(&track.local_path).await?;
                let source = SourceReader::new(
                    format!("file:{}", track.local_path.display()),
                    file,
                );

                let stream = ffmpeg
                    .stream_from(
                        CancellationToken::new(),
                        &track.codec,
                        ANY_FORMAT,
                        track.start_offset_ms,
                        track.end_offset_ms - track.start_offset_ms,
                        source,
                    )
                    .await?;

                let content_type = format_to_media_type(stream.format()).to_string();
                Ok((content_type, Box::new(stream) as ProviderStream))
            }
        };

        let (entry, reader) = self.cache.get_or_fill(&key, provider).await?;
        Ok(AudioStream {
            media_type: entry.content_type,
            reader: Box::new(reader),
        })
    }
}

fn direct_streaming_obstacle(track: &TrackSource) -> Option<String> {
    if !track.requests_whole_file() {
        return Some(format!(
            "a partial window {}..{} ms of {} ms was requested",
            track.start_offset_ms, track.end_offset_ms, track.source_duration_ms
        ));
    }
    if !ALLOWED_STREAMING_CODECS.contains(&track.codec.as_str()) {
        return Some(format!("codec `{}` is not directly streamable", track.codec));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(codec: &str, start: i64, end: i64, duration: i64) -> TrackSource {
        TrackSource {
            id: "t".to_string(),
            local_path: PathBuf::from("/music/t"),
            codec: codec.to_string(),
            format: "mp3".to_string(),
            start_offset_ms: start,
            end_offset_ms: end,
            source_duration_ms: duration,
        }
    }

    #[test]
    fn whole_file_with_allowed_codec_streams_directly() {
        assert!(direct_streaming_obstacle(&track("mp3", 0, 180_000, 180_000)).is_none());
        assert!(direct_streaming_obstacle(&track("flac", 0, 180_000, 180_000)).is_none());
        assert!(direct_streaming_obstacle(&track("opus", 0, 180_000, 180_000)).is_none());
    }

    #[test]
    fn partial_window_goes_through_the_cache() {
        let obstacle = direct_streaming_obstacle(&track("mp3", 5_000, 180_000, 180_000));
        assert!(obstacle.unwrap().contains("partial window"));

        let obstacle = direct_streaming_obstacle(&track("mp3", 0, 90_000, 180_000));
        assert!(obstacle.is_some());
    }

    #[test]
    fn disallowed_codec_goes_through_the_cache() {
        let obstacle = direct_streaming_obstacle(&track("pcm_s16le", 0, 180_000, 180_000));
        assert!(obstacle.unwrap().contains("pcm_s16le"));
    }
}
