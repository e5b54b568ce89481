//! Probes the transcoder binary and streams one file through it.
//!
//! Usage: cargo run --example transcode_file -- <audio file> [codec]

use spoolaudio::{Ffmpeg, SourceReader, ANY_FORMAT};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let path = std::env::args()
        .nth(1)
        .expect("usage: transcode_file <audio file> [codec]");
    let codec = std::env::args().nth(2).unwrap_or_else(|| "mp3".to_string());

    let ffmpeg = Ffmpeg::new("ffmpeg");
    println!("transcoder version: {}", ffmpeg.current_version().await?);

    let file = tokio::fs::File::open(&path).await?;
    let source = SourceReader::new(format!("file:{path}"), file);

    let mut stream = ffmpeg
        .stream_from(
            CancellationToken::new(),
            &codec,
            ANY_FORMAT,
            0,
            30_000,
            source,
        )
        .await?;

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    println!(
        "transcoded a 30s window to `{}` ({} bytes)",
        stream.format(),
        out.len()
    );

    Ok(())
}
