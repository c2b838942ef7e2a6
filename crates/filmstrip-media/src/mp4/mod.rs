//! MP4 container parsing.
//!
//! Walks the `moov` box tree to find the video track, its sample entry and
//! codec configuration, fragment defaults, and (for progressive files) the
//! full sample table.

mod atoms;
mod reader;
mod sample_table;

pub use atoms::{Atom, AtomType, HandlerType, TrackDefaults, TrackInfo, VisualSampleEntry};
pub use reader::Mp4Reader;
pub use sample_table::{SampleEntry, SampleTable, SampleTableBuilder};

pub(crate) use atoms::{atom_data, read_i32, read_u32, read_u64, AtomIter};

use crate::Result;
use std::io::{Cursor, Read, Seek};

/// Parsed MP4 metadata.
#[derive(Debug)]
pub struct Mp4File {
    /// Duration in movie timescale units.
    pub duration: u64,
    /// Movie timescale (time units per second).
    pub timescale: u32,
    /// First video track, if any.
    pub video_track: Option<TrackInfo>,
    /// `trex` defaults keyed by track id.
    pub track_defaults: Vec<(u32, TrackDefaults)>,
    /// Whether `moov` carries an `mvex` (fragmented stream).
    pub is_fragmented: bool,
    /// Whether a top-level `moov` was seen.
    pub has_moov: bool,
    /// Whether a top-level `moof` was seen.
    pub has_moof: bool,
}

impl Mp4File {
    /// Parse MP4 metadata from a reader.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        Mp4Reader::new(reader).parse()
    }

    /// Parse MP4 metadata from an in-memory buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::parse(&mut Cursor::new(bytes))
    }

    /// Get the duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.timescale == 0 {
            0.0
        } else {
            self.duration as f64 / self.timescale as f64
        }
    }

    /// Fragment defaults for a track, zeroed when `trex` is absent.
    pub fn defaults_for(&self, track_id: u32) -> TrackDefaults {
        self.track_defaults
            .iter()
            .find(|(id, _)| *id == track_id)
            .map(|(_, d)| *d)
            .unwrap_or_default()
    }

    /// Video sample table, if the file is progressive.
    pub fn video_samples(&self) -> Option<&SampleTable> {
        self.video_track
            .as_ref()
            .map(|t| &t.sample_table)
            .filter(|t| !t.is_empty())
    }
}
