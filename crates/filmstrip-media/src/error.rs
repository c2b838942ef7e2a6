//! Error types for filmstrip-media.

use std::io;
use thiserror::Error;

/// Result type for filmstrip-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for filmstrip-media operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while walking a box tree.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The initialization segment could not be turned into a decoder config.
    #[error("Malformed init segment: {0}")]
    MalformedInit(String),

    /// A media segment could not be turned into coded frames.
    #[error("Malformed media segment: {0}")]
    MalformedSegment(String),

    /// Segment descriptors are out of order or overlap.
    #[error("Invalid segment catalog: {0}")]
    InvalidCatalog(String),

    /// Unsupported feature or codec.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Buffer too small for operation.
    #[error("Buffer underflow: need {need} bytes, have {have}")]
    BufferUnderflow { need: usize, have: usize },
}

impl Error {
    /// Create a malformed init segment error.
    pub fn malformed_init(msg: impl Into<String>) -> Self {
        Self::MalformedInit(msg.into())
    }

    /// Create a malformed media segment error.
    pub fn malformed_segment(msg: impl Into<String>) -> Self {
        Self::MalformedSegment(msg.into())
    }

    /// Create an unsupported error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Whether this error came from init segment parsing.
    pub fn is_init_error(&self) -> bool {
        matches!(self, Self::MalformedInit(_))
    }
}
