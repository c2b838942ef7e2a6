//! Filmstrip - segmented decode and thumbnail cache engine
//!
//! Decodes video segments into thumbnails on demand for an interactive
//! timeline, classifies frames for GOP display, serves single-frame save
//! requests and keeps memory bounded to the neighbourhood of the viewport.
//! Container parsing lives in the `filmstrip-media` crate.

pub mod bitmap;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod engine;
pub mod error;
pub mod frames;
pub mod layout;
pub mod source;
mod worker;

pub use bitmap::DecodedBitmap;
pub use cache::{CacheKey, CacheSnapshot, CacheStats, FrameCache, VisibleRange};
pub use coordinator::{IntraRequest, IntraSegment, RangeRequest, RequestFingerprint};
pub use decode::{DecodeEngine, DecodeMode, DecodedFrame, DecoderFactory, DecoderState, VideoDecoder};
pub use engine::{BoundaryPreview, EngineBuilder, EngineStatus, FilmstripEngine};
pub use error::{EngineError, Result};
pub use source::{Decryptor, KeyMaterial, ManifestSource, RenditionId, StreamSource};

pub use filmstrip_media::{
    ByteRange, CodedFrame, DecoderConfig, FrameType, GopEntry, GopStructure, InitDescriptor,
    SegmentCatalog, SegmentDescriptor,
};
