//! MP4 atom definitions and slice-level box navigation.

use super::SampleTable;
use crate::{Error, Result};

/// Four-character atom type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomType(pub [u8; 4]);

impl AtomType {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const STYP: Self = Self(*b"styp");
    pub const MOOV: Self = Self(*b"moov");
    pub const MDAT: Self = Self(*b"mdat");
    pub const MVHD: Self = Self(*b"mvhd");
    pub const MVEX: Self = Self(*b"mvex");
    pub const TREX: Self = Self(*b"trex");
    pub const TRAK: Self = Self(*b"trak");
    pub const TKHD: Self = Self(*b"tkhd");
    pub const MDIA: Self = Self(*b"mdia");
    pub const MDHD: Self = Self(*b"mdhd");
    pub const HDLR: Self = Self(*b"hdlr");
    pub const MINF: Self = Self(*b"minf");
    pub const STBL: Self = Self(*b"stbl");
    pub const STSD: Self = Self(*b"stsd");
    pub const STTS: Self = Self(*b"stts");
    pub const STSS: Self = Self(*b"stss");
    pub const STSC: Self = Self(*b"stsc");
    pub const STSZ: Self = Self(*b"stsz");
    pub const STCO: Self = Self(*b"stco");
    pub const CO64: Self = Self(*b"co64");
    pub const CTTS: Self = Self(*b"ctts");
    pub const MOOF: Self = Self(*b"moof");
    pub const MFHD: Self = Self(*b"mfhd");
    pub const TRAF: Self = Self(*b"traf");
    pub const TFHD: Self = Self(*b"tfhd");
    pub const TFDT: Self = Self(*b"tfdt");
    pub const TRUN: Self = Self(*b"trun");
    pub const SINF: Self = Self(*b"sinf");
    pub const FRMA: Self = Self(*b"frma");
    pub const SCHI: Self = Self(*b"schi");
    pub const TENC: Self = Self(*b"tenc");
    pub const FREE: Self = Self(*b"free");
    pub const SKIP: Self = Self(*b"skip");
    pub const UDTA: Self = Self(*b"udta");

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Get the 4-char code as a string.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl std::fmt::Display for AtomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed atom header.
#[derive(Debug, Clone)]
pub struct Atom {
    /// Atom type code.
    pub atom_type: AtomType,
    /// Atom size including header.
    pub size: u64,
    /// Offset where atom data starts (after header).
    pub data_offset: u64,
    /// Size of the header (8 or 16 bytes).
    pub header_size: u8,
}

impl Atom {
    /// Get the data size (size - header).
    pub fn data_size(&self) -> u64 {
        self.size.saturating_sub(self.header_size as u64)
    }

    /// Offset of the first byte of the header.
    pub fn start(&self) -> u64 {
        self.data_offset - self.header_size as u64
    }

    /// Offset one past the last byte of the atom.
    pub fn end(&self) -> u64 {
        self.start() + self.size
    }

    /// Check if this atom contains child atoms.
    pub fn is_container(&self) -> bool {
        matches!(
            self.atom_type,
            AtomType::MOOV
                | AtomType::TRAK
                | AtomType::MDIA
                | AtomType::MINF
                | AtomType::STBL
                | AtomType::MVEX
                | AtomType::MOOF
                | AtomType::TRAF
                | AtomType::SINF
                | AtomType::SCHI
                | AtomType::UDTA
        )
    }
}

/// Handler type for a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    Video,
    Audio,
    Hint,
    Meta,
    Text,
    Unknown([u8; 4]),
}

impl HandlerType {
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        match &bytes {
            b"vide" => Self::Video,
            b"soun" => Self::Audio,
            b"hint" => Self::Hint,
            b"meta" => Self::Meta,
            b"text" => Self::Text,
            _ => Self::Unknown(bytes),
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Visual sample entry found in `stsd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisualSampleEntry {
    /// Sample entry format as stored (`avc1`, `hvc1`, `encv`, ...).
    pub format: [u8; 4],
    /// Original format from `sinf/frma` for protected entries.
    pub original_format: Option<[u8; 4]>,
    /// Coded width from the sample entry.
    pub width: u16,
    /// Coded height from the sample entry.
    pub height: u16,
    /// Type of the codec configuration box (`avcC`, `hvcC`, `vpcC`, `av1C`).
    pub config_type: Option<[u8; 4]>,
    /// Codec configuration record, box header excluded.
    pub config: Vec<u8>,
}

impl VisualSampleEntry {
    /// The format a decoder sees once protection is removed.
    pub fn effective_format(&self) -> [u8; 4] {
        self.original_format.unwrap_or(self.format)
    }

    /// Whether the entry is wrapped in a protection scheme.
    pub fn is_protected(&self) -> bool {
        &self.format == b"encv" || self.original_format.is_some()
    }
}

/// Per-track fragment defaults from `mvex/trex`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackDefaults {
    /// Default sample duration in track timescale units.
    pub sample_duration: u32,
    /// Default sample size in bytes.
    pub sample_size: u32,
    /// Default sample flags.
    pub sample_flags: u32,
}

/// Track information extracted from trak atom.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// Track ID.
    pub track_id: u32,
    /// Handler type (video/audio/etc).
    pub handler_type: HandlerType,
    /// Track duration in media timescale.
    pub duration: u64,
    /// Media timescale (ticks per second for this track).
    pub timescale: u32,
    /// Sample table with all sample info (empty for fragmented files).
    pub sample_table: SampleTable,
    /// Video sample entry, when the track carries one.
    pub sample_entry: Option<VisualSampleEntry>,
    /// Width from tkhd.
    pub width: Option<u32>,
    /// Height from tkhd.
    pub height: Option<u32>,
}

impl TrackInfo {
    /// Create empty track info.
    pub fn new(track_id: u32) -> Self {
        Self {
            track_id,
            handler_type: HandlerType::Unknown([0; 4]),
            duration: 0,
            timescale: 1,
            sample_table: SampleTable::default(),
            sample_entry: None,
            width: None,
            height: None,
        }
    }

    /// Get duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.timescale == 0 {
            0.0
        } else {
            self.duration as f64 / self.timescale as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Slice helpers
// ---------------------------------------------------------------------------

fn underflow(data: &[u8], offset: usize, len: usize) -> Error {
    Error::BufferUnderflow {
        need: offset + len,
        have: data.len(),
    }
}

pub(crate) fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| underflow(data, offset, 2))
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| underflow(data, offset, 4))
}

pub(crate) fn read_i32(data: &[u8], offset: usize) -> Result<i32> {
    read_u32(data, offset).map(|v| v as i32)
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> Result<u64> {
    data.get(offset..offset + 8)
        .map(|b| u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .ok_or_else(|| underflow(data, offset, 8))
}

pub(crate) fn read_fourcc(data: &[u8], offset: usize) -> Result<[u8; 4]> {
    data.get(offset..offset + 4)
        .map(|b| [b[0], b[1], b[2], b[3]])
        .ok_or_else(|| underflow(data, offset, 4))
}

/// Iterator over sibling boxes laid out in a byte slice.
///
/// Offsets in the yielded [`Atom`]s are relative to `base`, so a child
/// iterator over a sub-slice can still report absolute positions.
pub(crate) struct AtomIter<'a> {
    data: &'a [u8],
    pos: usize,
    base: u64,
}

impl<'a> AtomIter<'a> {
    pub(crate) fn new(data: &'a [u8], base: u64) -> Self {
        Self { data, pos: 0, base }
    }
}

impl Iterator for AtomIter<'_> {
    type Item = Result<Atom>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + 8 > self.data.len() {
            return None;
        }

        let size = match read_u32(self.data, self.pos) {
            Ok(size) => size as u64,
            Err(e) => return Some(Err(e)),
        };
        let atom_type = match read_fourcc(self.data, self.pos + 4) {
            Ok(code) => AtomType(code),
            Err(e) => return Some(Err(e)),
        };

        let remaining = (self.data.len() - self.pos) as u64;
        let (actual_size, header_size) = match size {
            1 => match read_u64(self.data, self.pos + 8) {
                Ok(ext) => (ext, 16u8),
                Err(e) => return Some(Err(e)),
            },
            0 => (remaining, 8u8),
            _ => (size, 8u8),
        };

        if actual_size < header_size as u64 || actual_size > remaining {
            self.pos = self.data.len();
            return Some(Err(Error::BufferUnderflow {
                need: self.pos.saturating_add(actual_size as usize),
                have: self.data.len(),
            }));
        }

        let atom = Atom {
            atom_type,
            size: actual_size,
            data_offset: self.base + self.pos as u64 + header_size as u64,
            header_size,
        };
        self.pos += actual_size as usize;
        Some(Ok(atom))
    }
}

/// Content bytes of an atom found by [`AtomIter`] over `data` with base `base`.
pub(crate) fn atom_data<'a>(data: &'a [u8], base: u64, atom: &Atom) -> &'a [u8] {
    let start = (atom.data_offset - base) as usize;
    let end = start + atom.data_size() as usize;
    &data[start..end.min(data.len())]
}
