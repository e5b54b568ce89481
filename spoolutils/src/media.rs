//! Container format <-> MIME type mapping for the audio formats the
//! transcoder is allowed to emit.

/// Maps a container format name (as the transcoder calls it) to a MIME type.
///
/// Unknown formats fall back to `application/octet-stream` with a warning,
/// so a new transcoder output never breaks serving, only labeling.
pub fn format_to_media_type(format: &str) -> &'static str {
    match format {
        "flac" => "audio/flac",
        "mp3" => "audio/mpeg",
        "opus" => "audio/opus",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "matroska" | "webm" => "audio/x-matroska",
        _ => {
            tracing::warn!("No media type mapping for format `{}`", format);
            "application/octet-stream"
        }
    }
}

/// Inverse mapping, used when only a MIME type is known.
pub fn media_type_to_format(media_type: &str) -> &'static str {
    match media_type {
        "audio/flac" => "flac",
        "audio/mpeg" => "mp3",
        "audio/opus" => "opus",
        "audio/ogg" => "ogg",
        "audio/mp4" => "m4a",
        "audio/wav" => "wav",
        "audio/x-matroska" => "matroska",
        _ => {
            tracing::warn!("Unknown media type `{}`", media_type);
            "bin"
        }
    }
}
