//! Filmstrip-Media: ISO-BMFF parsing and GOP classification for filmstrip
//!
//! This crate is the I/O-free container layer of the filmstrip engine. It
//! turns fetched bytes into decoder input without touching a decoder.
//!
//! # Modules
//!
//! - `mp4` - MP4 box-tree reading (moov, sample entries, sample tables)
//! - `init` - Initialization segment to [`DecoderConfig`]
//! - `fmp4` - Fragment (moof/trun) parsing and fMP4 writers
//! - `segment` - Media segment to [`CodedFrame`]s, fragmented or whole-file
//! - `classify` - I/P/B classification from timestamps and sync flags
//! - `catalog` - Segment timeline of one rendition
//!
//! # Data flow
//!
//! 1. The init segment is parsed once per rendition into a [`DecoderConfig`]
//! 2. Each media segment is parsed lazily into decode-ordered [`CodedFrame`]s
//! 3. Frames go to a decoder, or to [`classify`] for a decode-free GOP view

pub mod catalog;
pub mod classify;
pub mod error;
pub mod fmp4;
pub mod init;
pub mod mp4;
pub mod segment;

pub use catalog::{ByteRange, InitDescriptor, SegmentCatalog, SegmentDescriptor};
pub use classify::{classify, FrameType, GopEntry, GopStructure};
pub use error::{Error, Result};
pub use init::{codec_string, parse_init, DecoderConfig};
pub use mp4::{Mp4File, TrackDefaults};
pub use segment::{is_whole_file, parse_media_segment, CodedFrame};
