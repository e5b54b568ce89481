//! Subprocess transcoding pipeline.
//!
//! Each transcode spawns one external transcoder process (ffmpeg by
//! default), feeds it the source bytes over stdin and exposes its stdout as
//! an [`FfmpegStream`]. The true outcome of a transcode is only known when
//! the process exits, so end-of-stream waits for the exit status and turns a
//! non-zero exit into an error carrying whatever the process wrote to
//! stderr.

use crate::error::TranscodeError;
use crate::source::SourceReader;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Resolve the target format from the source codec at spawn time.
pub const ANY_FORMAT: &str = "";
/// Opus produces different bytes on each encode, which breaks seeking;
/// use this when clients need stable output.
pub const SEEKABLE_FORMAT: &str = "mp3";
/// Used when the source codec has no streamable container of its own.
pub const FALLBACK_FORMAT: &str = "opus";

// alac/mp4a are not supported by Chromium-based clients; mp4 output over a
// pipe is not supported by ffmpeg either, so neither appears here.
fn codec_to_format(codec: &str) -> Option<&'static str> {
    match codec {
        "flac" => Some("flac"),
        "mp3" => Some("mp3"),
        "opus" => Some("opus"),
        _ => None,
    }
}

fn format_supports_codec(format: &str, codec: &str) -> bool {
    matches!(
        (format, codec),
        ("flac", "flac") | ("mp3", "mp3") | ("opus", "opus")
    )
}

/// Builds the transcoder argument list and resolves the output format.
fn build_args(
    source_codec: &str,
    target_format: &str,
    offset_ms: i64,
    duration_ms: i64,
    format_hint: Option<&str>,
) -> (String, Vec<String>) {
    // only the codec name matters, not its parameters (ex. "mp4a.40.2")
    let source_codec = source_codec.split('.').next().unwrap_or_default();

    let mut args: Vec<String> = vec!["-v".into(), "error".into()];

    if offset_ms > 0 {
        args.push("-ss".into());
        args.push(format!("{:.3}", offset_ms as f64 / 1000.0));
    }

    if let Some(hint) = format_hint {
        args.push("-f".into());
        args.push(hint.into());
    }

    args.push("-i".into());
    args.push("pipe:0".into());

    args.push("-t".into());
    args.push(format!("{:.3}", duration_ms as f64 / 1000.0));

    args.push("-vn".into());

    let resolved = if target_format == ANY_FORMAT {
        codec_to_format(source_codec)
            .unwrap_or(FALLBACK_FORMAT)
            .to_string()
    } else {
        target_format.to_string()
    };

    // ffmpeg fails to copy opus data when the starting position is not 0,
    // so seeking into opus forces a re-encode
    // https://stackoverflow.com/questions/60621646
    let must_reencode = resolved == "opus" && offset_ms > 0;
    if !must_reencode && format_supports_codec(&resolved, source_codec) {
        args.push("-c:a".into());
        args.push("copy".into());
    }

    args.push("-f".into());
    args.push(resolved.clone());
    args.push("-".into());

    (resolved, args)
}

fn parse_version(output: &str) -> Option<String> {
    let rest = output.split("ffmpeg version ").nth(1)?;
    let version = rest.split_whitespace().next()?;
    (!version.is_empty()).then(|| version.to_string())
}

/// Handle on an external transcoder binary.
pub struct Ffmpeg {
    path: String,
}

impl Ffmpeg {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Probes the binary with `-version` and extracts the version string.
    pub async fn current_version(&self) -> Result<String, TranscodeError> {
        let output = Command::new(&self.path)
            .arg("-version")
            .output()
            .await
            .map_err(|source| TranscodeError::Spawn {
                command: self.path.clone(),
                source,
            })?;

        let text = String::from_utf8_lossy(&output.stdout);
        parse_version(&text).ok_or_else(|| TranscodeError::VersionParse(text.trim().to_string()))
    }

    /// Spawns a transcode of `source`, clipped to
    /// `[offset_ms, offset_ms + duration_ms)`.
    ///
    /// `target_format` selects the output container ([`ANY_FORMAT`] resolves
    /// it from `source_codec`). The returned stream pumps bytes straight
    /// from the process's stdout; canceling `cancel` tears the process down
    /// so it cannot be orphaned.
    pub async fn stream_from<R>(
        &self,
        cancel: CancellationToken,
        source_codec: &str,
        target_format: &str,
        offset_ms: i64,
        duration_ms: i64,
        source: SourceReader<R>,
    ) -> Result<FfmpegStream, TranscodeError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let format_hint = source.format_hint();
        let (format, args) = build_args(
            source_codec,
            target_format,
            offset_ms,
            duration_ms,
            format_hint,
        );
        let (label, mut reader) = source.into_parts();

        let command_line = format!("{} {}", self.path, args.join(" "));
        tracing::trace!("Streaming `{}` via transcoder: {}", label, command_line);

        let mut child = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                command: command_line,
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("transcoder stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("transcoder stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("transcoder stderr not captured"))?;

        // Pump the source into the child's stdin. The child exiting early
        // (duration limit reached) shows up here as a broken pipe, which is
        // not a failure of the stream itself.
        let pump_label = label.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::io::copy(&mut reader, &mut stdin).await {
                tracing::debug!("Transcoder input pump for `{}` stopped: {}", pump_label, err);
            }
            // dropping stdin closes the pipe and signals end of input
        });

        let stderr_task = tokio::spawn(async move {
            let mut captured = String::new();
            let _ = stderr.read_to_string(&mut captured).await;
            captured
        });

        let child = Arc::new(Mutex::new(child));

        // Kill the child as soon as the caller's context is canceled; the
        // watcher itself ends when the stream is closed or dropped, both of
        // which cancel the token.
        let watcher_child = Arc::clone(&child);
        let watcher_token = cancel.clone();
        tokio::spawn(async move {
            watcher_token.cancelled().await;
            let _ = watcher_child.lock().await.start_kill();
        });

        Ok(FfmpegStream {
            format,
            label,
            cancel,
            child,
            stdout,
            stderr_task: Some(stderr_task),
            state: ReadState::Streaming,
        })
    }
}

enum ReadState {
    Streaming,
    Finishing(Pin<Box<dyn Future<Output = io::Result<()>> + Send>>),
    Finished,
}

/// Readable, closeable output of one transcoder process.
///
/// Reading pumps bytes from the process's stdout. End-of-stream is only
/// reported after the process exited successfully; a non-zero exit turns the
/// final read into an error embedding the exit status and any captured
/// stderr output.
pub struct FfmpegStream {
    format: String,
    label: String,
    cancel: CancellationToken,
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    stderr_task: Option<JoinHandle<String>>,
    state: ReadState,
}

impl FfmpegStream {
    /// Output container format actually selected for this transcode.
    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Cancels the transcode (terminating the process if it is still
    /// running) and waits for it to exit, reporting a non-success exit the
    /// same way the final read would.
    ///
    /// Safe to call after the stream was already fully read.
    pub async fn close(&mut self) -> Result<(), TranscodeError> {
        self.cancel.cancel();

        let status = {
            let mut child = self.child.lock().await;
            let _ = child.start_kill();
            child.wait().await.map_err(TranscodeError::Io)?
        };

        if status.success() {
            return Ok(());
        }

        let diagnostics = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        Err(TranscodeError::exited(
            self.label.clone(),
            status,
            diagnostics,
        ))
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        // wakes the watcher so it exits; kill_on_drop reaps the child
        self.cancel.cancel();
    }
}

async fn wait_for_exit(
    child: Arc<Mutex<Child>>,
    stderr_task: Option<JoinHandle<String>>,
    label: String,
) -> io::Result<()> {
    let diagnostics = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    let status = child.lock().await.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(TranscodeError::exited(
            label,
            status,
            diagnostics,
        )))
    }
}

impl AsyncRead for FfmpegStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ReadState::Streaming => {
                    // a full buffer makes no progress; without this check
                    // the zero-byte read below would be taken for EOF
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let before = buf.filled().len();
                    match Pin::new(&mut this.stdout).poll_read(cx, buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                        Poll::Ready(Ok(())) => {
                            if buf.filled().len() > before {
                                return Poll::Ready(Ok(()));
                            }
                            // stdout hit EOF: success vs. failure is only
                            // known once the process exits
                            this.state = ReadState::Finishing(Box::pin(wait_for_exit(
                                Arc::clone(&this.child),
                                this.stderr_task.take(),
                                this.label.clone(),
                            )));
                        }
                    }
                }
                ReadState::Finishing(future) => {
                    let result = match future.as_mut().poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(result) => result,
                    };
                    this.state = ReadState::Finished;
                    return Poll::Ready(result);
                }
                ReadState::Finished => return Poll::Ready(Ok(())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clips_with_fractional_seconds() {
        let (_, args) = build_args("flac", ANY_FORMAT, 5000, 10_000, None);

        let ss = args.iter().position(|a| a == "-ss").unwrap();
        assert_eq!(args[ss + 1], "5.000");
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "10.000");
        assert!(args.contains(&"-vn".to_string()));
        assert!(args.contains(&"pipe:0".to_string()));
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn omits_the_seek_flag_at_offset_zero() {
        let (_, args) = build_args("flac", ANY_FORMAT, 0, 10_000, None);
        assert!(!args.contains(&"-ss".to_string()));
    }

    #[test]
    fn resolves_the_format_from_the_source_codec() {
        let (format, args) = build_args("mp3", ANY_FORMAT, 0, 1000, None);
        assert_eq!(format, "mp3");
        // matching codec and container stream without a re-encode
        assert!(args.contains(&"-c:a".to_string()));
        assert!(args.contains(&"copy".to_string()));
    }

    #[test]
    fn unknown_codecs_fall_back_to_opus() {
        let (format, args) = build_args("mp4a.40.2", ANY_FORMAT, 0, 1000, None);
        assert_eq!(format, FALLBACK_FORMAT);
        assert!(!args.contains(&"copy".to_string()));
    }

    #[test]
    fn seeking_into_opus_forces_a_reencode() {
        let (format, args) = build_args("opus", ANY_FORMAT, 3000, 1000, None);
        assert_eq!(format, "opus");
        assert!(!args.contains(&"copy".to_string()));
    }

    #[test]
    fn format_hint_is_passed_before_the_input() {
        let (_, args) = build_args("flac", ANY_FORMAT, 0, 1000, Some("flac"));
        let f = args.iter().position(|a| a == "-f").unwrap();
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[f + 1], "flac");
        assert!(f < i);
    }

    #[test]
    fn extracts_the_version_string() {
        let output = "ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023";
        assert_eq!(parse_version(output).unwrap(), "6.1.1-3ubuntu5");
        assert!(parse_version("not ffmpeg at all").is_none());
    }
}
