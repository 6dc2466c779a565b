//! Error types for the vocal isolation pipeline

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline and serving errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A local input path does not exist
    #[error("Input file not found: {}", .0.display())]
    MissingInput(PathBuf),

    /// Nothing usable was supplied
    #[error("No valid input files found. Provide local files or YouTube URLs.")]
    NoValidInputs,

    /// Every input failed
    #[error("No files were successfully processed.")]
    NothingProcessed,

    /// Upload request carried no file
    #[error("Please choose a media file to upload.")]
    NoFile,

    /// Upload extension is not on the allow-list
    #[error("Unsupported file type. Please upload audio or video media.")]
    InvalidType(String),

    /// Request body exceeded the configured maximum
    #[error("The uploaded file is too large for the server to process.")]
    PayloadTooLarge,

    /// Unknown, unfinished or already collected task
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// External tool could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// External tool exited unsuccessfully
    #[error("{program} exited with status {}", exit_label(.code))]
    ToolFailed { program: String, code: Option<i32> },

    /// Expected artifact did not appear on disk
    #[error("Expected output missing: {}", .0.display())]
    MissingOutput(PathBuf),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

impl Error {
    /// Create a tool failure error
    pub fn tool_failed(program: impl Into<String>, code: Option<i32>) -> Self {
        Self::ToolFailed {
            program: program.into(),
            code,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this is an external process failure (the narrow per-file class)
    pub fn is_tool_failure(&self) -> bool {
        matches!(self, Error::ToolFailed { .. } | Error::Spawn { .. })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::NoFile => (StatusCode::BAD_REQUEST, "no_file"),
            Error::InvalidType(_) => (StatusCode::BAD_REQUEST, "invalid_type"),
            Error::Config(_) => (StatusCode::BAD_REQUEST, "config_error"),
            Error::MissingInput(_) | Error::NoValidInputs => {
                (StatusCode::BAD_REQUEST, "invalid_input")
            }
            Error::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "too_large"),
            Error::TaskNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Json(_) => (StatusCode::BAD_REQUEST, "json_error"),
            Error::NothingProcessed => (StatusCode::INTERNAL_SERVER_ERROR, "no_output"),
            Error::Spawn { .. } | Error::ToolFailed { .. } | Error::MissingOutput(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "processing_error")
            }
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": error_type,
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}
