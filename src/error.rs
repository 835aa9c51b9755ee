//! Error types for lyrebird operations.

use thiserror::Error;

/// Result type for lyrebird operations.
pub type Result<T> = std::result::Result<T, LyrebirdError>;

/// Errors that can occur while loading model assets or generating audio.
///
/// None of these are transient: the pipeline never retries internally, and a
/// failure anywhere in the generation loop aborts the whole request without
/// partial output.
#[derive(Error, Debug)]
pub enum LyrebirdError {
    /// An unknown voice, or a required model/tensor file is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed tensor container, unsupported element type, or a malformed
    /// tokenizer descriptor / model configuration.
    #[error("data format error: {0}")]
    DataFormat(String),

    /// The caller passed an empty or otherwise unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The inference runtime rejected a shape or failed internally.
    #[error("model execution failed: {0}")]
    ModelExecution(String),

    /// The request was cancelled cooperatively between frames.
    #[error("generation cancelled")]
    Cancelled,

    /// Filesystem error while reading model assets.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LyrebirdError {
    fn from(e: std::io::Error) -> Self {
        LyrebirdError::Io(e.to_string())
    }
}

impl From<ort::Error> for LyrebirdError {
    fn from(e: ort::Error) -> Self {
        LyrebirdError::ModelExecution(e.to_string())
    }
}

impl From<serde_json::Error> for LyrebirdError {
    fn from(e: serde_json::Error) -> Self {
        LyrebirdError::DataFormat(e.to_string())
    }
}
