#![cfg(unix)]

use anyhow::Result;
use async_trait::async_trait;
use spoolaudio::Ffmpeg;
use spoolcache::StreamCache;
use spoolstream::{AudioStream, StreamService, TrackResolver, TrackSource};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

struct FixedResolver(TrackSource);

#[async_trait]
impl TrackResolver for FixedResolver {
    async fn resolve(&self, _id: &str) -> Result<TrackSource> {
        Ok(self.0.clone())
    }
}

/// Executable passthrough stand-in for the transcoder binary.
fn stub_transcoder(dir: &Path) -> String {
    let path = dir.join("cat-stub");
    std::fs::write(&path, "#!/bin/sh\ncat\n").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().to_string()
}

fn service(
    track: TrackSource,
    cache_dir: &Path,
    transcoder: &str,
) -> StreamService<FixedResolver> {
    let cache = StreamCache::new(cache_dir, 1024 * 1024, Duration::from_secs(3600)).unwrap();
    StreamService::new(
        FixedResolver(track),
        cache,
        Arc::new(Ffmpeg::new(transcoder)),
    )
}

async fn drain(stream: AudioStream) -> Vec<u8> {
    let mut reader = stream.reader;
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}

fn track_at(path: PathBuf) -> TrackSource {
    TrackSource {
        id: "track-77".to_string(),
        local_path: path,
        codec: "mp3".to_string(),
        format: "mp3".to_string(),
        start_offset_ms: 0,
        end_offset_ms: 200_000,
        source_duration_ms: 200_000,
    }
}

#[tokio::test]
async fn whole_file_allowed_codec_is_served_straight_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("song.mp3");
    std::fs::write(&file, b"raw mp3 bytes").unwrap();

    // a transcoder that cannot even spawn proves the direct path never
    // touches it
    let service = service(
        track_at(file),
        &dir.path().join("cache"),
        "/nonexistent/transcoder-binary",
    );

    let stream = service.stream("track-77").await.unwrap();
    assert_eq!(stream.media_type, "audio/mpeg");
    assert_eq!(drain(stream).await, b"raw mp3 bytes");
}

#[tokio::test]
async fn partial_window_is_transcoded_and_cached() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("song.mp3");
    std::fs::write(&file, b"bytes through the pipeline").unwrap();

    let mut track = track_at(file);
    track.start_offset_ms = 5_000;
    track.end_offset_ms = 60_000;

    let transcoder = stub_transcoder(dir.path());
    let cache_dir = dir.path().join("cache");
    let service = service(track, &cache_dir, &transcoder);

    let stream = service.stream("track-77").await.unwrap();
    assert_eq!(stream.media_type, "audio/mpeg");
    assert_eq!(drain(stream).await, b"bytes through the pipeline");

    // the cache now owns the bytes under the namespaced key
    assert!(cache_dir.join("spoolsonic-track-77").exists());

    // a second request is a pure cache hit: breaking the transcoder has no
    // effect anymore
    std::fs::remove_file(&transcoder).unwrap();
    let stream = service.stream("track-77").await.unwrap();
    assert_eq!(drain(stream).await, b"bytes through the pipeline");
}

#[tokio::test]
async fn disallowed_codec_is_transcoded_even_for_the_whole_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("song.wav");
    std::fs::write(&file, b"pcm payload").unwrap();

    let mut track = track_at(file);
    track.codec = "pcm_s16le".to_string();
    track.format = "wav".to_string();

    let transcoder = stub_transcoder(dir.path());
    let cache_dir = dir.path().join("cache");
    let service = service(track, &cache_dir, &transcoder);

    let stream = service.stream("track-77").await.unwrap();
    assert_eq!(drain(stream).await, b"pcm payload");
    assert!(cache_dir.join("spoolsonic-track-77").exists());
}

#[tokio::test]
async fn resolver_failure_propagates() {
    struct NoSuchTrack;

    #[async_trait]
    impl TrackResolver for NoSuchTrack {
        async fn resolve(&self, id: &str) -> Result<TrackSource> {
            Err(anyhow::anyhow!("no track with id=`{id}`"))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let cache = StreamCache::new(dir.path(), 1024, Duration::from_secs(3600)).unwrap();
    let service = StreamService::new(NoSuchTrack, cache, Arc::new(Ffmpeg::new("ffmpeg")));

    let err = service.stream("missing").await.unwrap_err();
    assert!(err.to_string().contains("missing"));
}
