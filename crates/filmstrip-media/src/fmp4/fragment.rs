//! Media fragment (`moof`) parsing.
//!
//! Resolves every sample described by `traf/tfhd/tfdt/trun` into a byte
//! range inside the segment plus decode timing and a sync flag. Payloads are
//! not touched here; see [`crate::segment`].

use crate::mp4::{atom_data, read_i32, read_u32, read_u64, AtomIter, AtomType, TrackDefaults};
use crate::{Error, Result};

/// Non-sync bit of ISO-BMFF sample flags.
const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

mod tfhd_flags {
    pub const BASE_DATA_OFFSET: u32 = 0x000001;
    pub const SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
    pub const DEFAULT_DURATION: u32 = 0x000008;
    pub const DEFAULT_SIZE: u32 = 0x000010;
    pub const DEFAULT_FLAGS: u32 = 0x000020;
}

mod trun_flags {
    pub const DATA_OFFSET: u32 = 0x000001;
    pub const FIRST_SAMPLE_FLAGS: u32 = 0x000004;
    pub const DURATION: u32 = 0x000100;
    pub const SIZE: u32 = 0x000200;
    pub const FLAGS: u32 = 0x000400;
    pub const CTS_OFFSET: u32 = 0x000800;
}

/// A sample located inside a media segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSampleInfo {
    /// Byte offset of the payload from the start of the segment.
    pub offset: u64,
    /// Payload size in bytes.
    pub size: u32,
    /// Decode timestamp in track timescale units.
    pub dts: u64,
    /// Duration in track timescale units.
    pub duration: u32,
    /// Composition offset in track timescale units.
    pub cts_offset: i32,
    /// Whether the sample is a sync sample.
    pub is_sync: bool,
}

impl FragmentSampleInfo {
    /// Presentation timestamp in track timescale units.
    pub fn pts(&self) -> i64 {
        self.dts as i64 + self.cts_offset as i64
    }
}

/// `tfhd` contents with `trex` defaults folded in.
#[derive(Debug, Clone, Copy)]
struct FragmentHeader {
    track_id: u32,
    base_data_offset: Option<u64>,
    defaults: TrackDefaults,
}

fn parse_tfhd(data: &[u8], trex: &TrackDefaults) -> Result<FragmentHeader> {
    let flags = read_u32(data, 0)? & 0x00ff_ffff;
    let track_id = read_u32(data, 4)?;
    let mut pos = 8;
    let mut header = FragmentHeader {
        track_id,
        base_data_offset: None,
        defaults: *trex,
    };

    if flags & tfhd_flags::BASE_DATA_OFFSET != 0 {
        header.base_data_offset = Some(read_u64(data, pos)?);
        pos += 8;
    }
    if flags & tfhd_flags::SAMPLE_DESCRIPTION_INDEX != 0 {
        pos += 4;
    }
    if flags & tfhd_flags::DEFAULT_DURATION != 0 {
        header.defaults.sample_duration = read_u32(data, pos)?;
        pos += 4;
    }
    if flags & tfhd_flags::DEFAULT_SIZE != 0 {
        header.defaults.sample_size = read_u32(data, pos)?;
        pos += 4;
    }
    if flags & tfhd_flags::DEFAULT_FLAGS != 0 {
        header.defaults.sample_flags = read_u32(data, pos)?;
    }

    Ok(header)
}

fn parse_tfdt(data: &[u8]) -> Result<u64> {
    match data.first() {
        Some(1) => read_u64(data, 4),
        _ => read_u32(data, 4).map(u64::from),
    }
}

/// Walks one `trun`, appending samples and advancing the data cursor and
/// decode clock.
fn parse_trun(
    data: &[u8],
    header: &FragmentHeader,
    base: u64,
    cursor: &mut u64,
    dts: &mut u64,
    out: &mut Vec<FragmentSampleInfo>,
) -> Result<()> {
    let flags = read_u32(data, 0)? & 0x00ff_ffff;
    let count = read_u32(data, 4)? as usize;
    let mut pos = 8;

    if flags & trun_flags::DATA_OFFSET != 0 {
        let offset = read_i32(data, pos)? as i64;
        *cursor = u64::try_from(base as i64 + offset)
            .map_err(|_| Error::malformed_segment("trun data offset before segment start"))?;
        pos += 4;
    }
    let mut first_flags = None;
    if flags & trun_flags::FIRST_SAMPLE_FLAGS != 0 {
        first_flags = Some(read_u32(data, pos)?);
        pos += 4;
    }

    for i in 0..count {
        let mut duration = header.defaults.sample_duration;
        let mut size = header.defaults.sample_size;
        let mut sample_flags = header.defaults.sample_flags;
        let mut cts_offset = 0;

        if flags & trun_flags::DURATION != 0 {
            duration = read_u32(data, pos)?;
            pos += 4;
        }
        if flags & trun_flags::SIZE != 0 {
            size = read_u32(data, pos)?;
            pos += 4;
        }
        if flags & trun_flags::FLAGS != 0 {
            sample_flags = read_u32(data, pos)?;
            pos += 4;
        }
        if flags & trun_flags::CTS_OFFSET != 0 {
            cts_offset = read_i32(data, pos)?;
            pos += 4;
        }
        if i == 0 {
            if let Some(first) = first_flags {
                sample_flags = first;
            }
        }

        out.push(FragmentSampleInfo {
            offset: *cursor,
            size,
            dts: *dts,
            duration,
            cts_offset,
            is_sync: sample_flags & SAMPLE_IS_NON_SYNC == 0,
        });
        *cursor += size as u64;
        *dts += duration as u64;
    }

    Ok(())
}

/// Resolve every sample of `track_id` across all `moof` boxes in `data`.
///
/// Samples come back in decode order. Truncated boxes and short tables are
/// reported as [`Error::MalformedSegment`].
pub fn parse_fragments(
    data: &[u8],
    track_id: u32,
    trex: &TrackDefaults,
) -> Result<Vec<FragmentSampleInfo>> {
    let mut samples = Vec::new();
    let mut dts = 0u64;

    for atom in AtomIter::new(data, 0) {
        let moof = atom.map_err(to_segment_error)?;
        if moof.atom_type != AtomType::MOOF {
            continue;
        }
        let moof_start = moof.start();
        let moof_body = atom_data(data, 0, &moof);

        for traf in AtomIter::new(moof_body, moof.data_offset) {
            let traf = traf.map_err(to_segment_error)?;
            if traf.atom_type != AtomType::TRAF {
                continue;
            }
            let traf_body = atom_data(moof_body, moof.data_offset, &traf);
            parse_traf(traf_body, traf.data_offset, track_id, trex, moof_start, &mut dts, &mut samples)
                .map_err(to_segment_error)?;
        }
    }

    Ok(samples)
}

fn parse_traf(
    body: &[u8],
    body_base: u64,
    track_id: u32,
    trex: &TrackDefaults,
    moof_start: u64,
    dts: &mut u64,
    out: &mut Vec<FragmentSampleInfo>,
) -> Result<()> {
    let mut header: Option<FragmentHeader> = None;
    let mut cursor = moof_start;

    for child in AtomIter::new(body, body_base) {
        let child = child?;
        let content = atom_data(body, body_base, &child);
        match child.atom_type {
            AtomType::TFHD => {
                let parsed = parse_tfhd(content, trex)?;
                if parsed.track_id != track_id {
                    return Ok(());
                }
                cursor = parsed.base_data_offset.unwrap_or(moof_start);
                header = Some(parsed);
            }
            AtomType::TFDT => *dts = parse_tfdt(content)?,
            AtomType::TRUN => {
                let header = header
                    .as_ref()
                    .ok_or_else(|| Error::malformed_segment("trun before tfhd"))?;
                let base = header.base_data_offset.unwrap_or(moof_start);
                parse_trun(content, header, base, &mut cursor, dts, out)?;
            }
            _ => {}
        }
    }

    Ok(())
}

fn to_segment_error(e: Error) -> Error {
    match e {
        Error::MalformedSegment(_) => e,
        other => Error::malformed_segment(other.to_string()),
    }
}
