// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VqError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FFmpeg/FFprobe command failed: {0}")]
    Command(String),

    #[error("Failed to parse: {0}")]
    Parse(String),

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Plotting error: {0}")]
    Plot(String),

    #[error("Video source unavailable: {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("Incomplete session configuration: {0}")]
    IncompleteConfiguration(String),

    #[error("Rating {score} is not a valid score on the 0-10 scale")]
    OutOfRange { score: f64 },

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Input error: {0}")]
    Input(String),
}

impl VqError {
    pub(crate) fn unavailable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        VqError::SourceUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

// Define a standard Result type for the crate
pub type Result<T> = std::result::Result<T, VqError>;
