//! Error kinds surfaced by the filesystem core
//!
//! Backends report failures as `anyhow::Error`; the core wraps them into
//! one of these kinds at the boundary, keeping the backend's message chain.

use thiserror::Error;

use crate::ident::StreamIdentifier;

#[derive(Debug, Error)]
pub enum SkError {
    #[error("Unable to open image {path}: {message}")]
    ImageOpenFailed { path: String, message: String },

    #[error("Unable to open filesystem in image {path}: {message}")]
    FilesystemOpenFailed { path: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Scan failed at {context}: {message}")]
    ScanFailed { context: String, message: String },

    #[error("Out of memory allocating {0} byte read buffer")]
    OutOfMemory(usize),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
}

impl SkError {
    /// Wrap a backend failure, keeping its full cause chain
    pub fn scan(context: impl Into<String>, err: anyhow::Error) -> Self {
        SkError::ScanFailed {
            context: context.into(),
            message: format!("{:#}", err),
        }
    }

    pub fn inode_not_found(inode: u64) -> Self {
        SkError::NotFound(format!("inode {}", inode))
    }

    pub fn path_not_found(path: &str) -> Self {
        SkError::NotFound(format!("path {}", path))
    }

    pub fn stream_not_found(id: StreamIdentifier) -> Self {
        SkError::NotFound(format!("stream {}", id))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SkError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, SkError>;
