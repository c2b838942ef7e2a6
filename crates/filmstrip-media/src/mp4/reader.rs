//! MP4 box-tree reader for `moov` metadata.

use super::atoms::{atom_data, read_fourcc, read_u16, read_u32, read_u64, AtomIter};
use super::{
    Atom, AtomType, HandlerType, Mp4File, SampleTableBuilder, TrackDefaults, TrackInfo,
    VisualSampleEntry,
};
use crate::Result;
use std::io::{Read, Seek, SeekFrom};

/// Maximum allowed atom data size (64 MB) to prevent OOM on malformed input.
const MAX_ATOM_DATA_SIZE: u64 = 64 * 1024 * 1024;

/// Size of the fixed VisualSampleEntry fields after the 8-byte box header.
const VISUAL_SAMPLE_ENTRY_FIELDS: usize = 78;

/// Reads the metadata boxes of an MP4 stream.
pub struct Mp4Reader<R> {
    reader: R,
    len: u64,
}

impl<R: Read + Seek> Mp4Reader<R> {
    /// Create a new MP4 reader.
    pub fn new(mut reader: R) -> Self {
        let len = reader.seek(SeekFrom::End(0)).unwrap_or(0);
        let _ = reader.seek(SeekFrom::Start(0));
        Self { reader, len }
    }

    /// Parse the top-level boxes and the first video track.
    pub fn parse(&mut self) -> Result<Mp4File> {
        let mut mp4 = Mp4File {
            duration: 0,
            timescale: 1000,
            video_track: None,
            track_defaults: Vec::new(),
            is_fragmented: false,
            has_moov: false,
            has_moof: false,
        };

        for atom in self.read_atoms(0, self.len)? {
            match atom.atom_type {
                AtomType::MOOV => {
                    mp4.has_moov = true;
                    self.parse_moov(&atom, &mut mp4)?;
                }
                AtomType::MOOF => mp4.has_moof = true,
                _ => {}
            }
        }

        Ok(mp4)
    }

    /// Read atoms at the given level.
    fn read_atoms(&mut self, start: u64, end: u64) -> Result<Vec<Atom>> {
        let mut atoms = Vec::new();
        let mut pos = start;

        while pos + 8 <= end {
            self.reader.seek(SeekFrom::Start(pos))?;

            let mut header = [0u8; 8];
            if self.reader.read_exact(&mut header).is_err() {
                break;
            }

            let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
            let atom_type = AtomType::from_bytes([header[4], header[5], header[6], header[7]]);

            let (actual_size, header_size) = match size {
                1 => {
                    let mut ext = [0u8; 8];
                    self.reader.read_exact(&mut ext)?;
                    (u64::from_be_bytes(ext), 16u8)
                }
                0 => (end - pos, 8u8),
                _ => (size, 8u8),
            };

            if actual_size < header_size as u64 {
                break;
            }

            atoms.push(Atom {
                atom_type,
                size: actual_size,
                data_offset: pos + header_size as u64,
                header_size,
            });

            pos += actual_size;
        }

        Ok(atoms)
    }

    fn children(&mut self, parent: &Atom) -> Result<Vec<Atom>> {
        let end = (parent.data_offset + parent.data_size()).min(self.len);
        self.read_atoms(parent.data_offset, end)
    }

    /// Read and validate atom data, rejecting oversized atoms.
    fn read_atom_data(&mut self, atom: &Atom) -> Result<Vec<u8>> {
        let size = atom.data_size();
        if size > MAX_ATOM_DATA_SIZE {
            return Err(crate::Error::malformed_init(format!(
                "atom {} data size {} exceeds maximum {}",
                atom.atom_type, size, MAX_ATOM_DATA_SIZE
            )));
        }
        self.reader.seek(SeekFrom::Start(atom.data_offset))?;
        let mut data = vec![0u8; size as usize];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    fn parse_moov(&mut self, moov: &Atom, mp4: &mut Mp4File) -> Result<()> {
        for child in self.children(moov)? {
            match child.atom_type {
                AtomType::MVHD => self.parse_mvhd(&child, mp4)?,
                AtomType::MVEX => {
                    mp4.is_fragmented = true;
                    self.parse_mvex(&child, mp4)?;
                }
                AtomType::TRAK => match self.parse_trak(&child) {
                    Ok(track) if track.handler_type.is_video() && mp4.video_track.is_none() => {
                        mp4.video_track = Some(track);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!(error = %e, "skipping unreadable trak"),
                },
                _ => {}
            }
        }

        Ok(())
    }

    fn parse_mvhd(&mut self, atom: &Atom, mp4: &mut Mp4File) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let Some(&version) = data.first() else {
            return Ok(());
        };

        if version == 0 {
            mp4.timescale = read_u32(&data, 12)?;
            mp4.duration = read_u32(&data, 16)? as u64;
        } else {
            mp4.timescale = read_u32(&data, 20)?;
            mp4.duration = read_u64(&data, 24)?;
        }

        Ok(())
    }

    fn parse_mvex(&mut self, mvex: &Atom, mp4: &mut Mp4File) -> Result<()> {
        for child in self.children(mvex)? {
            if child.atom_type != AtomType::TREX {
                continue;
            }
            let data = self.read_atom_data(&child)?;
            // version/flags(4) track_id(4) description_index(4) duration size flags
            let track_id = read_u32(&data, 4)?;
            let defaults = TrackDefaults {
                sample_duration: read_u32(&data, 12)?,
                sample_size: read_u32(&data, 16)?,
                sample_flags: read_u32(&data, 20)?,
            };
            mp4.track_defaults.push((track_id, defaults));
        }
        Ok(())
    }

    fn parse_trak(&mut self, trak: &Atom) -> Result<TrackInfo> {
        let mut track = TrackInfo::new(0);

        for child in self.children(trak)? {
            match child.atom_type {
                AtomType::TKHD => self.parse_tkhd(&child, &mut track)?,
                AtomType::MDIA => self.parse_mdia(&child, &mut track)?,
                _ => {}
            }
        }

        Ok(track)
    }

    fn parse_tkhd(&mut self, atom: &Atom, track: &mut TrackInfo) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let Some(&version) = data.first() else {
            return Ok(());
        };

        // Width and height are 16.16 fixed point after the matrix.
        let (id_at, size_at) = if version == 0 { (12, 76) } else { (20, 88) };
        track.track_id = read_u32(&data, id_at)?;
        if let (Ok(w), Ok(h)) = (read_u32(&data, size_at), read_u32(&data, size_at + 4)) {
            track.width = Some(w >> 16);
            track.height = Some(h >> 16);
        }

        Ok(())
    }

    fn parse_mdia(&mut self, mdia: &Atom, track: &mut TrackInfo) -> Result<()> {
        let children = self.children(mdia)?;

        // hdlr decides how stsd is read, so handle it before minf.
        for child in children.iter().filter(|c| c.atom_type == AtomType::HDLR) {
            let data = self.read_atom_data(child)?;
            track.handler_type = HandlerType::from_bytes(read_fourcc(&data, 8)?);
        }

        for child in &children {
            match child.atom_type {
                AtomType::MDHD => self.parse_mdhd(child, track)?,
                AtomType::MINF => {
                    for stbl in self.children(child)? {
                        if stbl.atom_type == AtomType::STBL {
                            self.parse_stbl(&stbl, track)?;
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn parse_mdhd(&mut self, atom: &Atom, track: &mut TrackInfo) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let Some(&version) = data.first() else {
            return Ok(());
        };

        if version == 0 {
            track.timescale = read_u32(&data, 12)?;
            track.duration = read_u32(&data, 16)? as u64;
        } else {
            track.timescale = read_u32(&data, 20)?;
            track.duration = read_u64(&data, 24)?;
        }

        Ok(())
    }

    fn parse_stbl(&mut self, stbl: &Atom, track: &mut TrackInfo) -> Result<()> {
        let mut builder = SampleTableBuilder::new();

        for child in self.children(stbl)? {
            let kind = child.atom_type;
            if !matches!(
                kind,
                AtomType::STSD
                    | AtomType::STTS
                    | AtomType::STSS
                    | AtomType::STSC
                    | AtomType::STSZ
                    | AtomType::STCO
                    | AtomType::CO64
                    | AtomType::CTTS
            ) {
                continue;
            }

            let data = self.read_atom_data(&child)?;
            match kind {
                AtomType::STSD if track.handler_type.is_video() => {
                    track.sample_entry = parse_visual_sample_entry(&data)?;
                }
                AtomType::STTS => builder.set_stts(table(&data, 8, |e| {
                    Ok((read_u32(e, 0)?, read_u32(e, 4)?))
                })?),
                AtomType::STSS => builder.set_sync_samples(table(&data, 4, |e| read_u32(e, 0))?),
                AtomType::STSC => builder.set_stsc(table(&data, 12, |e| {
                    Ok((read_u32(e, 0)?, read_u32(e, 4)?, read_u32(e, 8)?))
                })?),
                AtomType::STSZ => {
                    let uniform = read_u32(&data, 4)?;
                    let count = read_u32(&data, 8)? as usize;
                    let sizes = if uniform == 0 {
                        (0..count)
                            .map_while(|i| read_u32(&data, 12 + i * 4).ok())
                            .collect()
                    } else {
                        vec![uniform; count]
                    };
                    builder.set_stsz(uniform, sizes);
                }
                AtomType::STCO => builder.set_chunk_offsets(table(&data, 4, |e| {
                    Ok(read_u32(e, 0)? as u64)
                })?),
                AtomType::CO64 => builder.set_chunk_offsets(table(&data, 8, |e| read_u64(e, 0))?),
                AtomType::CTTS => {
                    // Version 0 stores unsigned offsets; reinterpreting as i32
                    // matches what encoders actually write.
                    builder.set_ctts(table(&data, 8, |e| {
                        Ok((read_u32(e, 0)?, read_u32(e, 4)? as i32))
                    })?)
                }
                _ => {}
            }
        }

        track.sample_table = builder.build();
        Ok(())
    }
}

/// Read a full-box table: `version/flags`, `entry_count`, then fixed-size rows.
///
/// Truncated tables yield the rows that are present.
fn table<T>(
    data: &[u8],
    row_size: usize,
    row: impl Fn(&[u8]) -> Result<T>,
) -> Result<Vec<T>> {
    let count = read_u32(data, 4)? as usize;
    let mut rows = Vec::with_capacity(count.min(data.len() / row_size.max(1)));
    for i in 0..count {
        let start = 8 + i * row_size;
        let Some(bytes) = data.get(start..start + row_size) else {
            break;
        };
        rows.push(row(bytes)?);
    }
    Ok(rows)
}

/// Parse the first sample entry of a video `stsd`.
///
/// `data` is the stsd content: version/flags(4), entry_count(4), entries.
pub(crate) fn parse_visual_sample_entry(data: &[u8]) -> Result<Option<VisualSampleEntry>> {
    if read_u32(data, 4)? == 0 {
        return Ok(None);
    }

    let entry_bytes = &data[8..];
    let Some(entry) = AtomIter::new(entry_bytes, 0).next().transpose()? else {
        return Ok(None);
    };
    let content = atom_data(entry_bytes, 0, &entry);

    // Fixed fields: reserved(6) dref(2) pre_defined/reserved(16) width(2) height(2) ...
    let width = read_u16(content, 24)?;
    let height = read_u16(content, 26)?;

    let mut sample_entry = VisualSampleEntry {
        format: entry.atom_type.0,
        original_format: None,
        width,
        height,
        config_type: None,
        config: Vec::new(),
    };

    let Some(children) = content.get(VISUAL_SAMPLE_ENTRY_FIELDS..) else {
        return Ok(Some(sample_entry));
    };

    for child in AtomIter::new(children, 0) {
        let child = child?;
        let body = atom_data(children, 0, &child);
        match &child.atom_type.0 {
            b"avcC" | b"hvcC" | b"vpcC" | b"av1C" => {
                sample_entry.config_type = Some(child.atom_type.0);
                sample_entry.config = body.to_vec();
            }
            b"sinf" => {
                for inner in AtomIter::new(body, 0) {
                    let inner = inner?;
                    if inner.atom_type == AtomType::FRMA {
                        sample_entry.original_format =
                            Some(read_fourcc(atom_data(body, 0, &inner), 0)?);
                    }
                }
            }
            _ => {}
        }
    }

    Ok(Some(sample_entry))
}
