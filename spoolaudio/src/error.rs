use std::io;
use std::process::ExitStatus;

#[derive(thiserror::Error, Debug)]
pub enum TranscodeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to spawn transcoder `{command}`: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("transcoder exited with {status} while streaming `{label}`")]
    Exited { label: String, status: ExitStatus },
    #[error("transcoder exited with {status} while streaming `{label}`: {diagnostics}")]
    ExitedWithOutput {
        label: String,
        status: ExitStatus,
        diagnostics: String,
    },
    #[error("can't extract transcoder version from `{0}`")]
    VersionParse(String),
}

impl TranscodeError {
    /// Builds the right exit variant: diagnostics are attached only when the
    /// process actually produced some.
    pub fn exited(label: String, status: ExitStatus, diagnostics: String) -> Self {
        let diagnostics = diagnostics.trim().to_string();
        if diagnostics.is_empty() {
            TranscodeError::Exited { label, status }
        } else {
            TranscodeError::ExitedWithOutput {
                label,
                status,
                diagnostics,
            }
        }
    }
}
