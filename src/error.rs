// MangaShelf - Offline Manga Reader Core
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Error types for MangaShelf
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are categorized by domain (network, storage, persistence, etc.) so
//! callers can decide between retrying, degrading, or surfacing the failure.
//!
//! Most public operations in the engine return best-effort values for expected
//! failures (a missing cache entry, a single failed page). `ShelfError` is what
//! travels between components and what unrecoverable setup failures surface as.

use thiserror::Error;

/// Result type alias using our ShelfError type
pub type Result<T> = std::result::Result<T, ShelfError>;

/// Main error type for MangaShelf
#[derive(Error, Debug)]
pub enum ShelfError {
    // ===== Download Errors =====

    /// Generic download failure
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    /// Server returned unexpected status code
    #[error("Server responded with unexpected status code {status_code} for {url}")]
    UnexpectedStatusCode {
        status_code: u16,
        url: String,
    },

    /// Invalid download URL format or protocol
    #[error("Invalid download URL: {0}")]
    InvalidDownloadUrl(String),

    /// The external fetch layer could not produce a page list for a chapter
    #[error("Could not resolve pages for chapter {chapter_number} of manga {manga_id}: {message}")]
    ChapterResolutionFailed {
        manga_id: String,
        chapter_number: String,
        message: String,
    },

    // ===== File/Storage Errors =====

    /// File or directory not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Generic file I/O error
    #[error("File I/O error: {0}")]
    FileIoError(String),

    /// Insufficient disk space for operation
    #[error("Insufficient disk space (need {need} bytes, have {have} bytes)")]
    InsufficientDiskSpace {
        need: u64,
        have: u64,
    },

    /// Invalid file path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Base directory could not be created; nothing can work without it
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    // ===== Persistence Errors =====

    /// Generic database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Database schema migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Record not found
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // ===== Validation/State Errors =====

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Application state is invalid for the requested operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration is invalid or incomplete
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ===== General Errors =====

    /// Operation was cancelled by user or system
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Database driver error from sqlx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<std::string::FromUtf8Error> for ShelfError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ShelfError::InternalError(format!("UTF-8 conversion error: {}", err))
    }
}

// Helper methods for creating common errors
impl ShelfError {
    /// Create a RecordNotFound error with a resource name
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        ShelfError::RecordNotFound(resource.into())
    }

    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        ShelfError::InvalidInput(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        ShelfError::InternalError(message.into())
    }

    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        ShelfError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Check if error is retryable (network errors, timeouts, 5xx, etc.)
    ///
    /// Returns `true` for transient errors that might succeed on retry:
    /// - Network errors marked as transient
    /// - Timeouts
    /// - 5xx and 429 status codes
    /// - reqwest connect/timeout errors
    /// - Interrupted or would-block I/O
    pub fn is_retryable(&self) -> bool {
        match self {
            ShelfError::NetworkError { is_transient, .. } => *is_transient,
            ShelfError::Timeout(_) => true,
            ShelfError::UnexpectedStatusCode { status_code, .. } => {
                *status_code == 429 || (500..=599).contains(status_code)
            }
            ShelfError::ReqwestError(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            ShelfError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Check if error is related to file/disk operations
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            ShelfError::FileNotFound(_)
                | ShelfError::FileIoError(_)
                | ShelfError::InsufficientDiskSpace { .. }
                | ShelfError::InvalidPath(_)
                | ShelfError::InitializationFailed(_)
                | ShelfError::IoError(_)
        )
    }

    /// Get user-friendly error message suitable for display
    ///
    /// Technical details are omitted where a shorter actionable message exists.
    pub fn user_message(&self) -> String {
        match self {
            ShelfError::InsufficientDiskSpace { need, have } => {
                format!(
                    "Insufficient disk space. Need {} MB, but only {} MB available.",
                    need / 1_000_000,
                    have / 1_000_000
                )
            }
            ShelfError::NetworkError { .. } | ShelfError::ReqwestError(_) => {
                "Network problem while downloading. Please check your connection and try again."
                    .to_string()
            }
            ShelfError::Timeout(_) => "The download took too long and was stopped.".to_string(),
            ShelfError::UnexpectedStatusCode { status_code: 404, .. } => {
                "The image is no longer available on the server.".to_string()
            }
            ShelfError::InitializationFailed(_) => {
                "Storage could not be prepared. Please check available space and permissions."
                    .to_string()
            }
            _ => self.to_string(),
        }
    }
}
