//! Error types for patch-dl
//!
//! This module provides comprehensive error handling for the library, including:
//! - Domain-specific error types (Manifest, Transfer, Extraction)
//! - Aggregate phase failures carrying the count of failed entries
//! - Context information (paths, offsets, attempt counts)
//!
//! Per-file failures inside the validator and the download scheduler are
//! collected, not thrown; only the aggregate outcome of a phase surfaces as an
//! [`Error`]. The orchestrator is the sole layer that decides whether a phase
//! failure is retried or becomes a terminal abort.

use std::path::PathBuf;
use thiserror::Error;

use crate::worker::FlowPhase;

/// Result type alias for patch-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for patch-dl
///
/// This is the primary error type used throughout the library. Each variant
/// includes contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Local manifest error (missing or corrupt, recoverable upstream)
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Remote manifest fetch failed
    #[error("manifest fetch failed: {0}")]
    ManifestFetch(String),

    /// File transfer error
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Bundled-asset or package extraction error
    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// External install step failed
    #[error("install failed: {0}")]
    Install(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid URL
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Operation cancelled via the cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// A phase drained its worker pool but one or more entries failed
    #[error("{phase} phase failed: {failed} file(s) failed: {detail}")]
    PhaseFailed {
        /// The phase that failed
        phase: FlowPhase,
        /// Number of entries that ultimately failed
        failed: usize,
        /// Summary of the first failure, for diagnostics
        detail: String,
    },

    /// The retry policy denied a retry; the flow aborted
    #[error("retry denied for {phase} phase after {attempts} attempt(s): {cause}")]
    RetryDenied {
        /// The phase whose retry was denied
        phase: FlowPhase,
        /// Total attempts made (initial + retries)
        attempts: u32,
        /// The error from the final attempt
        cause: String,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Local manifest errors
///
/// Both file-level variants are recoverable conditions, not fatal errors: a
/// missing or corrupt local manifest triggers bundled-asset extraction during
/// Preprocess.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Manifest file does not exist
    #[error("manifest not found at {path}")]
    NotFound {
        /// Path where the manifest was expected
        path: PathBuf,
    },

    /// Manifest file exists but is unreadable or fails its signature check
    #[error("manifest at {path} is corrupt: {reason}")]
    Corrupt {
        /// Path of the corrupt manifest
        path: PathBuf,
        /// Why the manifest was rejected
        reason: String,
    },

    /// Two entries share the same path
    #[error("duplicate manifest path: {path}")]
    DuplicatePath {
        /// The duplicated entry path
        path: String,
    },
}

/// Per-file transfer errors
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network failure mid-transfer (resumable, the partial file is kept)
    #[error("network failure downloading {path}: {reason}")]
    Network {
        /// Manifest-relative path of the file
        path: String,
        /// Underlying failure description
        reason: String,
    },

    /// Final on-disk size does not match the manifest-declared size
    #[error("size mismatch for {path}: expected {expected} bytes, wrote {actual}")]
    SizeMismatch {
        /// Manifest-relative path of the file
        path: String,
        /// Size declared by the manifest
        expected: u64,
        /// Size actually present on disk
        actual: u64,
    },

    /// Local write or stat failure
    #[error("I/O failure for {path}: {reason}")]
    Io {
        /// Manifest-relative path of the file
        path: String,
        /// Underlying failure description
        reason: String,
    },
}

/// Extraction errors (bundled assets, installer packages)
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Archive could not be opened
    #[error("failed to open archive {archive}: {reason}")]
    OpenFailed {
        /// The archive that could not be opened
        archive: PathBuf,
        /// Why opening failed
        reason: String,
    },

    /// A specific entry could not be extracted
    #[error("failed to extract {entry} from {archive}: {reason}")]
    EntryFailed {
        /// The archive being extracted
        archive: PathBuf,
        /// The entry inside the archive
        entry: String,
        /// Why extraction failed
        reason: String,
    },
}
