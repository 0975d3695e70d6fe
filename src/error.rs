//! Error types for packaging and signing.
//!
//! Fatal conditions are returned as [`enum@Error`]. Per-file problems that only
//! degrade the output are collected as [`PartialFailure`] records instead.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for apkpack operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A required input path is absent.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// An encoder was given structurally insufficient input, or could not
    /// keep one of its size/offset fields consistent with its output.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Filesystem read or write failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP framing could not be read or written.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// An external decompile/build tool failed. Always recovered by the
    /// built-in fallback, never surfaced from [`crate::apk::tool::Toolchain`].
    #[error("tool error: {0}")]
    Tool(String),
}

impl Error {
    pub(crate) fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }
}

/// Non-fatal failure of a single file or entry. The operation that produced
/// it still succeeded, just without that file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PartialFailure {
    pub path: String,
    pub reason: String,
}

impl PartialFailure {
    pub fn new(path: impl Into<String>, reason: impl ToString) -> Self {
        let failure = Self {
            path: path.into(),
            reason: reason.to_string(),
        };
        tracing::warn!("skipping `{}`: {}", failure.path, failure.reason);
        failure
    }
}

pub type Result<T> = std::result::Result<T, Error>;
