// src/error.rs
//! Error handling for the resource subsystem.
//!
//! - **Cheap to fan out**: every variant is `Clone`, so one failed decode can be
//!   handed to every callback and future waiting on the same path.
//! - **Recovered at the worker boundary**: decoder failures become
//!   [`Error::Decode`] on the worker thread and only ever reach the caller through
//!   the normal completion channel.
//! - **Stale handles are not errors**: pool and manager queries answer "not found"
//!   (`None`, an invalid handle, or `0`) instead.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::texture_importer::ImportError;

/// Main error type. Send + Sync + 'static + Clone.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The file could not be read or decoded (missing, malformed, unsupported).
    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: Arc<ImportError>,
    },

    /// The graphics backend rejected a decoded payload.
    #[error("failed to upload {label} to the GPU: {message}")]
    Upload { label: String, message: String },

    /// A load was requested after the loader started shutting down.
    #[error("resource loader is shutting down")]
    ShutdownInProgress,

    /// The request was cancelled before a worker picked it up.
    #[error("load request was cancelled")]
    Cancelled,

    /// The resource manager is not between `initialize()` and `shutdown()`.
    #[error("resource manager is not initialized")]
    NotInitialized,

    /// I/O outside of decoding (spawning workers, reading config files).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Context chaining.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    /// Add context to any error (chainable, like `.context()` in anyhow).
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    #[inline]
    pub fn decode(path: &Path, source: ImportError) -> Self {
        Self::Decode {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }

    /// Flattens a backend error (with its `anyhow` chain) into an upload failure.
    #[inline]
    pub fn upload(label: impl Into<String>, err: anyhow::Error) -> Self {
        Self::Upload {
            label: label.into(),
            message: format!("{err:#}"),
        }
    }

    #[inline]
    pub fn is_decode(&self) -> bool {
        matches!(self, Error::Decode { .. })
    }

    #[inline]
    pub fn is_upload(&self) -> bool {
        matches!(self, Error::Upload { .. })
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::ShutdownInProgress)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Custom(format!("invalid configuration: {err}"))
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_keeps_path_and_source() {
        let err = Error::decode(
            Path::new("textures/missing.png"),
            ImportError::Unsupported("bmp".into()),
        );
        assert!(err.is_decode());
        let text = err.to_string();
        assert!(text.contains("textures/missing.png"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn upload_error_flattens_anyhow_chain() {
        let inner = anyhow::anyhow!("device lost").context("creating texture");
        let err = Error::upload("albedo.png", inner);
        assert!(err.is_upload());
        assert!(err.to_string().contains("creating texture: device lost"));
    }

    #[test]
    fn context_wraps_and_clones() {
        let err = Error::custom("boom").context("while draining");
        let copy = err.clone();
        assert_eq!(copy.to_string(), "while draining: boom");
    }
}
