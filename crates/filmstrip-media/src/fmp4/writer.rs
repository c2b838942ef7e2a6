//! ISO-BMFF writers for synthetic streams.
//!
//! These produce small but well-formed init segments, media fragments and
//! progressive files, which is what tests, benches and the CLI smoke path
//! feed back into the parsers.

use bytes::{BufMut, BytesMut};

/// One sample to be written into a fragment or progressive file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentSample {
    /// Sample payload.
    pub data: Vec<u8>,
    /// Duration in track timescale units.
    pub duration: u32,
    /// Composition offset (pts - dts) in track timescale units.
    pub cts_offset: i32,
    /// Whether the sample is a sync sample.
    pub is_sync: bool,
}

impl FragmentSample {
    pub fn new(data: Vec<u8>, duration: u32, cts_offset: i32, is_sync: bool) -> Self {
        Self {
            data,
            duration,
            cts_offset,
            is_sync,
        }
    }
}

/// Sample flags as written in `trun`.
fn sample_flags(is_sync: bool) -> u32 {
    if is_sync {
        0x0200_0000 // depends on no other sample
    } else {
        0x0101_0000 // depends on others, non-sync
    }
}

fn begin_box(buf: &mut BytesMut, box_type: &[u8; 4]) -> usize {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_slice(box_type);
    start
}

fn end_box(buf: &mut BytesMut, start: usize) {
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

/// Serialized initialization segment.
#[derive(Debug, Clone)]
pub struct InitSegment {
    /// Serialized `ftyp` + `moov`.
    pub data: Vec<u8>,
    /// Track timescale.
    pub timescale: u32,
}

/// Builder for single-video-track init segments and progressive files.
pub struct InitSegmentBuilder {
    track_id: u32,
    timescale: u32,
    width: u32,
    height: u32,
    video_codec: Option<Vec<u8>>,
    encrypted: bool,
    default_sample_duration: u32,
}

impl InitSegmentBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            track_id: 1,
            timescale: 90000,
            width: 1920,
            height: 1080,
            video_codec: None,
            encrypted: false,
            default_sample_duration: 0,
        }
    }

    /// Set video timescale.
    pub fn timescale(mut self, ts: u32) -> Self {
        self.timescale = ts;
        self
    }

    /// Set video dimensions.
    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the avcC configuration record.
    pub fn video_codec(mut self, data: Vec<u8>) -> Self {
        self.video_codec = Some(data);
        self
    }

    /// Wrap the sample entry as `encv` with a `sinf` box.
    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Default sample duration written into `trex`.
    pub fn default_sample_duration(mut self, duration: u32) -> Self {
        self.default_sample_duration = duration;
        self
    }

    /// Build a fragmented init segment (`ftyp` + `moov` with `mvex`).
    pub fn build(self) -> InitSegment {
        let mut buf = BytesMut::with_capacity(1024);
        self.write_ftyp(&mut buf);
        self.write_moov(&mut buf, &[], 0);

        InitSegment {
            data: buf.to_vec(),
            timescale: self.timescale,
        }
    }

    /// Build a progressive file (`ftyp` + `mdat` + `moov`) holding `samples`.
    pub fn build_progressive(self, samples: &[FragmentSample]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1024);
        self.write_ftyp(&mut buf);

        let mdat = begin_box(&mut buf, b"mdat");
        let first_sample_offset = buf.len() as u64;
        for sample in samples {
            buf.put_slice(&sample.data);
        }
        end_box(&mut buf, mdat);

        self.write_moov(&mut buf, samples, first_sample_offset);
        buf.to_vec()
    }

    fn write_ftyp(&self, buf: &mut BytesMut) {
        let start = begin_box(buf, b"ftyp");
        buf.put_slice(b"iso6"); // major brand
        buf.put_u32(0); // minor version
        for brand in [b"iso6", b"isom", b"dash", b"avc1"] {
            buf.put_slice(brand);
        }
        end_box(buf, start);
    }

    fn write_moov(&self, buf: &mut BytesMut, samples: &[FragmentSample], data_offset: u64) {
        let moov = begin_box(buf, b"moov");
        let duration: u64 = samples.iter().map(|s| s.duration as u64).sum();

        // mvhd (version 0)
        let mvhd = begin_box(buf, b"mvhd");
        buf.put_u32(0); // version/flags
        buf.put_u32(0); // creation time
        buf.put_u32(0); // modification time
        buf.put_u32(self.timescale);
        buf.put_u32(duration as u32);
        buf.put_u32(0x00010000); // rate
        buf.put_u16(0x0100); // volume
        buf.put_slice(&[0; 10]); // reserved
        write_matrix(buf);
        buf.put_slice(&[0; 24]); // pre_defined
        buf.put_u32(self.track_id + 1); // next track id
        end_box(buf, mvhd);

        let trak = begin_box(buf, b"trak");
        self.write_tkhd(buf, duration);

        let mdia = begin_box(buf, b"mdia");
        // mdhd (version 0)
        let mdhd = begin_box(buf, b"mdhd");
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(self.timescale);
        buf.put_u32(duration as u32);
        buf.put_u16(0x55C4); // language: und
        buf.put_u16(0);
        end_box(buf, mdhd);

        let hdlr = begin_box(buf, b"hdlr");
        buf.put_u32(0); // version/flags
        buf.put_u32(0); // pre_defined
        buf.put_slice(b"vide");
        buf.put_slice(&[0; 12]);
        buf.put_slice(b"VideoHandler\0");
        end_box(buf, hdlr);

        let minf = begin_box(buf, b"minf");
        let vmhd = begin_box(buf, b"vmhd");
        buf.put_u32(1); // version/flags
        buf.put_slice(&[0; 8]); // graphics mode + opcolor
        end_box(buf, vmhd);

        let dinf = begin_box(buf, b"dinf");
        let dref = begin_box(buf, b"dref");
        buf.put_u32(0);
        buf.put_u32(1);
        let url = begin_box(buf, b"url ");
        buf.put_u32(1); // self-contained
        end_box(buf, url);
        end_box(buf, dref);
        end_box(buf, dinf);

        let stbl = begin_box(buf, b"stbl");
        self.write_stsd(buf);
        write_sample_tables(buf, samples, data_offset);
        end_box(buf, stbl);

        end_box(buf, minf);
        end_box(buf, mdia);
        end_box(buf, trak);

        if samples.is_empty() {
            let mvex = begin_box(buf, b"mvex");
            let trex = begin_box(buf, b"trex");
            buf.put_u32(0); // version/flags
            buf.put_u32(self.track_id);
            buf.put_u32(1); // default sample description index
            buf.put_u32(self.default_sample_duration);
            buf.put_u32(0); // default sample size
            buf.put_u32(sample_flags(false));
            end_box(buf, trex);
            end_box(buf, mvex);
        }

        end_box(buf, moov);
    }

    fn write_tkhd(&self, buf: &mut BytesMut, duration: u64) {
        let tkhd = begin_box(buf, b"tkhd");
        buf.put_u32(0x0000_0007); // version 0, enabled | in_movie | in_preview
        buf.put_u32(0); // creation time
        buf.put_u32(0); // modification time
        buf.put_u32(self.track_id);
        buf.put_u32(0); // reserved
        buf.put_u32(duration as u32);
        buf.put_u64(0); // reserved
        buf.put_u16(0); // layer
        buf.put_u16(0); // alternate group
        buf.put_u16(0); // volume
        buf.put_u16(0); // reserved
        write_matrix(buf);
        buf.put_u32(self.width << 16);
        buf.put_u32(self.height << 16);
        end_box(buf, tkhd);
    }

    fn write_stsd(&self, buf: &mut BytesMut) {
        let stsd = begin_box(buf, b"stsd");
        buf.put_u32(0); // version/flags
        buf.put_u32(1); // entry count

        let entry = begin_box(buf, if self.encrypted { b"encv" } else { b"avc1" });
        buf.put_slice(&[0; 6]); // reserved
        buf.put_u16(1); // data reference index
        buf.put_slice(&[0; 16]); // pre_defined + reserved
        buf.put_u16(self.width as u16);
        buf.put_u16(self.height as u16);
        buf.put_u32(0x00480000); // horiz resolution 72 dpi
        buf.put_u32(0x00480000); // vert resolution 72 dpi
        buf.put_u32(0); // reserved
        buf.put_u16(1); // frame count
        buf.put_slice(&[0; 32]); // compressor name
        buf.put_u16(0x0018); // depth
        buf.put_i16(-1); // pre_defined

        if let Some(ref avcc) = self.video_codec {
            let avcc_box = begin_box(buf, b"avcC");
            buf.put_slice(avcc);
            end_box(buf, avcc_box);
        }

        if self.encrypted {
            let sinf = begin_box(buf, b"sinf");
            let frma = begin_box(buf, b"frma");
            buf.put_slice(b"avc1");
            end_box(buf, frma);
            let schm = begin_box(buf, b"schm");
            buf.put_u32(0);
            buf.put_slice(b"cenc");
            buf.put_u32(0x0001_0000);
            end_box(buf, schm);
            end_box(buf, sinf);
        }

        end_box(buf, entry);
        end_box(buf, stsd);
    }
}

impl Default for InitSegmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn write_matrix(buf: &mut BytesMut) {
    for value in [0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
        buf.put_u32(value);
    }
}

/// Write stts/stss/ctts/stsc/stsz/stco for `samples` stored in one chunk.
fn write_sample_tables(buf: &mut BytesMut, samples: &[FragmentSample], data_offset: u64) {
    let stts = begin_box(buf, b"stts");
    buf.put_u32(0);
    buf.put_u32(samples.len() as u32);
    for sample in samples {
        buf.put_u32(1);
        buf.put_u32(sample.duration);
    }
    end_box(buf, stts);

    if samples.iter().any(|s| !s.is_sync) {
        let sync: Vec<u32> = (1..=samples.len() as u32)
            .filter(|i| samples[*i as usize - 1].is_sync)
            .collect();
        let stss = begin_box(buf, b"stss");
        buf.put_u32(0);
        buf.put_u32(sync.len() as u32);
        for number in sync {
            buf.put_u32(number);
        }
        end_box(buf, stss);
    }

    if samples.iter().any(|s| s.cts_offset != 0) {
        let ctts = begin_box(buf, b"ctts");
        buf.put_u32(0x0100_0000); // version 1: signed offsets
        buf.put_u32(samples.len() as u32);
        for sample in samples {
            buf.put_u32(1);
            buf.put_i32(sample.cts_offset);
        }
        end_box(buf, ctts);
    }

    let stsc = begin_box(buf, b"stsc");
    buf.put_u32(0);
    if samples.is_empty() {
        buf.put_u32(0);
    } else {
        buf.put_u32(1);
        buf.put_u32(1); // first chunk
        buf.put_u32(samples.len() as u32);
        buf.put_u32(1); // sample description index
    }
    end_box(buf, stsc);

    let stsz = begin_box(buf, b"stsz");
    buf.put_u32(0);
    buf.put_u32(0); // no uniform size
    buf.put_u32(samples.len() as u32);
    for sample in samples {
        buf.put_u32(sample.data.len() as u32);
    }
    end_box(buf, stsz);

    let stco = begin_box(buf, b"stco");
    buf.put_u32(0);
    if samples.is_empty() {
        buf.put_u32(0);
    } else {
        buf.put_u32(1);
        buf.put_u32(data_offset as u32);
    }
    end_box(buf, stco);
}

/// Builder for one `moof` + `mdat` media fragment.
pub struct FragmentBuilder {
    sequence_number: u32,
    track_id: u32,
    base_media_decode_time: u64,
}

impl FragmentBuilder {
    /// Create a new fragment builder.
    pub fn new(sequence_number: u32, track_id: u32) -> Self {
        Self {
            sequence_number,
            track_id,
            base_media_decode_time: 0,
        }
    }

    /// Set base media decode time (tfdt).
    pub fn base_media_decode_time(mut self, time: u64) -> Self {
        self.base_media_decode_time = time;
        self
    }

    /// Serialize `moof` followed by an `mdat` carrying every payload.
    pub fn build(self, samples: &[FragmentSample]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(256 + samples.len() * 16);

        let styp = begin_box(&mut buf, b"styp");
        buf.put_slice(b"msdh");
        buf.put_u32(0);
        buf.put_slice(b"msdh");
        buf.put_slice(b"msix");
        end_box(&mut buf, styp);

        let moof = begin_box(&mut buf, b"moof");

        let mfhd = begin_box(&mut buf, b"mfhd");
        buf.put_u32(0);
        buf.put_u32(self.sequence_number);
        end_box(&mut buf, mfhd);

        let traf = begin_box(&mut buf, b"traf");

        let tfhd = begin_box(&mut buf, b"tfhd");
        buf.put_u32(0x020000); // default-base-is-moof
        buf.put_u32(self.track_id);
        end_box(&mut buf, tfhd);

        let tfdt = begin_box(&mut buf, b"tfdt");
        buf.put_u32(0x0100_0000); // version 1
        buf.put_u64(self.base_media_decode_time);
        end_box(&mut buf, tfdt);

        // data-offset | duration | size | flags | composition offset
        let trun = begin_box(&mut buf, b"trun");
        buf.put_u32(0x0100_0000 | 0x000001 | 0x000100 | 0x000200 | 0x000400 | 0x000800);
        buf.put_u32(samples.len() as u32);
        let data_offset_pos = buf.len();
        buf.put_i32(0); // patched below
        for sample in samples {
            buf.put_u32(sample.duration);
            buf.put_u32(sample.data.len() as u32);
            buf.put_u32(sample_flags(sample.is_sync));
            buf.put_i32(sample.cts_offset);
        }
        end_box(&mut buf, trun);

        end_box(&mut buf, traf);
        end_box(&mut buf, moof);

        // Relative to the moof start, past the 8-byte mdat header.
        let data_offset = (buf.len() - moof + 8) as i32;
        buf[data_offset_pos..data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());

        let mdat = begin_box(&mut buf, b"mdat");
        for sample in samples {
            buf.put_slice(&sample.data);
        }
        end_box(&mut buf, mdat);

        buf.to_vec()
    }
}
