//! Source stream plus the metadata the transcoder needs about it.

use tokio::io::AsyncRead;

/// A byte stream destined for the transcoder's standard input, labeled with
/// a virtual filename.
///
/// Since stdin has no extension, the label is the only format hint the
/// transcoder gets; it also identifies the source in logs and errors.
pub struct SourceReader<R> {
    label: String,
    reader: R,
}

impl<R: AsyncRead + Send + Unpin> SourceReader<R> {
    pub fn new(label: impl Into<String>, reader: R) -> Self {
        Self {
            label: label.into(),
            reader,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Demuxer name derived from the label's extension, if recognized.
    pub fn format_hint(&self) -> Option<&'static str> {
        let extension = self.label.rsplit('.').next()?;
        match extension.to_lowercase().as_str() {
            "flac" => Some("flac"),
            "mp3" => Some("mp3"),
            "ogg" | "oga" | "opus" => Some("ogg"),
            "wav" => Some("wav"),
            "mkv" | "webm" => Some("matroska"),
            _ => None,
        }
    }

    pub fn into_parts(self) -> (String, R) {
        (self.label, self.reader)
    }
}
