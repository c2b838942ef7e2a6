//! Engine error taxonomy.
//!
//! Container and fetch failures are contained per segment; only a decoder
//! configuration failure disables the engine for a rendition.

use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The init segment could not be parsed into a decoder configuration.
    #[error("malformed init segment: {0}")]
    MalformedInit(String),

    /// A media segment could not be parsed into coded frames.
    #[error("malformed media segment: {0}")]
    MalformedSegment(String),

    /// The decoder rejected the configuration; fatal for the rendition.
    #[error("decoder unsupported: {0}")]
    DecoderUnsupported(String),

    /// Fetching a segment or init segment failed.
    #[error("fetch failed for {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    /// A one-shot request exceeded its ceiling.
    #[error("decode timed out after {0:?}")]
    DecodeTimeout(Duration),

    /// Encrypted content without key material or a decryptor.
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    /// The decoder failed on one batch; the rendition stays usable.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The segment catalog could not be obtained or addressed.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// The decode worker has stopped.
    #[error("engine closed")]
    EngineClosed,
}

impl EngineError {
    pub fn fetch_failed(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::FetchFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error disables decoding for the whole rendition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DecoderUnsupported(_))
    }
}

impl From<filmstrip_media::Error> for EngineError {
    fn from(e: filmstrip_media::Error) -> Self {
        match e {
            filmstrip_media::Error::MalformedInit(msg) => Self::MalformedInit(msg),
            filmstrip_media::Error::InvalidCatalog(msg) => Self::Catalog(msg),
            other => Self::MalformedSegment(other.to_string()),
        }
    }
}
