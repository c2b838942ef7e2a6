//! Media segment parsing into coded frames.

use bytes::Bytes;

use crate::fmp4::parse_fragments;
use crate::init::DecoderConfig;
use crate::mp4::{AtomIter, AtomType, Mp4File};
use crate::{Error, Result};

/// One compressed video frame ready to be fed to a decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct CodedFrame {
    /// Raw sample payload, shared with the segment buffer.
    pub data: Bytes,
    /// Decode timestamp in seconds.
    pub decode_timestamp: f64,
    /// Display (presentation) timestamp in seconds.
    pub display_timestamp: f64,
    /// Frame duration in seconds.
    pub duration: f64,
    /// Whether the frame decodes without references.
    pub is_sync: bool,
    /// Payload size in bytes.
    pub byte_size: u32,
}

impl CodedFrame {
    /// Shift both timestamps by `offset` seconds.
    pub fn rebase(mut self, offset: f64) -> Self {
        self.decode_timestamp += offset;
        self.display_timestamp += offset;
        self
    }
}

/// Whether `bytes` is a self-contained progressive file rather than a
/// fragment. Progressive timestamps start at zero within the file.
pub fn is_whole_file(bytes: &[u8]) -> bool {
    let mut has_moov = false;
    for atom in AtomIter::new(bytes, 0) {
        match atom {
            Ok(a) if a.atom_type == AtomType::MOOF => return false,
            Ok(a) if a.atom_type == AtomType::MOOV => has_moov = true,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    has_moov
}

/// Parse a media segment into coded frames in decode order.
///
/// Fragmented segments (`moof` + `mdat`) are resolved with the track id,
/// timescale and `trex` defaults from `config`. Whole progressive files are
/// resolved through their own `moov` sample table.
pub fn parse_media_segment(bytes: &Bytes, config: &DecoderConfig) -> Result<Vec<CodedFrame>> {
    let frames = if is_whole_file(bytes) {
        parse_whole_file(bytes)?
    } else {
        parse_fragmented(bytes, config)?
    };

    if frames.is_empty() {
        return Err(Error::malformed_segment(format!(
            "no samples for track {}",
            config.track_id
        )));
    }

    tracing::trace!(
        frames = frames.len(),
        first_dts = frames[0].decode_timestamp,
        "parsed media segment"
    );
    Ok(frames)
}

fn parse_fragmented(bytes: &Bytes, config: &DecoderConfig) -> Result<Vec<CodedFrame>> {
    if config.timescale == 0 {
        return Err(Error::malformed_segment("decoder config has zero timescale"));
    }
    let samples = parse_fragments(bytes, config.track_id, &config.defaults)?;
    let scale = config.timescale as f64;

    samples
        .iter()
        .map(|s| {
            Ok(CodedFrame {
                data: slice_payload(bytes, s.offset, s.size)?,
                decode_timestamp: s.dts as f64 / scale,
                display_timestamp: s.pts() as f64 / scale,
                duration: s.duration as f64 / scale,
                is_sync: s.is_sync,
                byte_size: s.size,
            })
        })
        .collect()
}

fn parse_whole_file(bytes: &Bytes) -> Result<Vec<CodedFrame>> {
    let mp4 = Mp4File::from_bytes(bytes).map_err(|e| Error::malformed_segment(e.to_string()))?;
    let track = mp4
        .video_track
        .as_ref()
        .ok_or_else(|| Error::malformed_segment("whole-file segment has no video track"))?;
    if track.timescale == 0 {
        return Err(Error::malformed_segment("video track timescale is zero"));
    }
    let Some(table) = mp4.video_samples() else {
        return Ok(Vec::new());
    };
    let scale = track.timescale as f64;

    table
        .iter()
        .map(|s| {
            Ok(CodedFrame {
                data: slice_payload(bytes, s.offset, s.size)?,
                decode_timestamp: s.dts as f64 / scale,
                display_timestamp: (s.dts as i64 + s.cts_offset as i64) as f64 / scale,
                duration: s.duration as f64 / scale,
                is_sync: s.is_keyframe,
                byte_size: s.size,
            })
        })
        .collect()
}

fn slice_payload(bytes: &Bytes, offset: u64, size: u32) -> Result<Bytes> {
    let start = usize::try_from(offset)
        .map_err(|_| Error::malformed_segment("sample offset overflows"))?;
    let end = start
        .checked_add(size as usize)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| {
            Error::malformed_segment(format!(
                "sample at {}+{} exceeds segment of {} bytes",
                offset,
                size,
                bytes.len()
            ))
        })?;
    Ok(bytes.slice(start..end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmp4::{FragmentBuilder, FragmentSample, InitSegmentBuilder};
    use crate::init::parse_init;

    fn config() -> DecoderConfig {
        let init = InitSegmentBuilder::new()
            .timescale(1000)
            .video_codec(vec![1, 0x64, 0, 0x1f])
            .build();
        parse_init(&init.data).unwrap()
    }

    fn gop() -> Vec<FragmentSample> {
        // Decode order I P B B P, display order I B B P P.
        vec![
            FragmentSample::new(vec![0; 40], 100, 100, true),
            FragmentSample::new(vec![1; 10], 100, 300, false),
            FragmentSample::new(vec![2; 5], 100, 0, false),
            FragmentSample::new(vec![3; 5], 100, 0, false),
            FragmentSample::new(vec![4; 10], 100, 100, false),
        ]
    }

    #[test]
    fn test_fragmented_segment_frames() {
        let data = Bytes::from(
            FragmentBuilder::new(1, 1)
                .base_media_decode_time(2000)
                .build(&gop()),
        );
        let frames = parse_media_segment(&data, &config()).unwrap();

        assert_eq!(frames.len(), 5);
        assert!((frames[0].decode_timestamp - 2.0).abs() < 1e-9);
        assert!((frames[0].display_timestamp - 2.1).abs() < 1e-9);
        assert!((frames[1].display_timestamp - 2.4).abs() < 1e-9);
        assert!(frames[0].is_sync && !frames[1].is_sync);
        assert_eq!(frames[0].byte_size, 40);
        assert_eq!(&frames[2].data[..], &[2; 5]);
        assert!(!is_whole_file(&data));
    }

    #[test]
    fn test_whole_file_segment_frames() {
        let data = Bytes::from(
            InitSegmentBuilder::new()
                .timescale(1000)
                .video_codec(vec![1, 0x64, 0, 0x1f])
                .build_progressive(&gop()),
        );
        assert!(is_whole_file(&data));

        let frames = parse_media_segment(&data, &config()).unwrap();
        assert_eq!(frames.len(), 5);
        assert!((frames[3].decode_timestamp - 0.3).abs() < 1e-9);
        assert!((frames[3].display_timestamp - 0.3).abs() < 1e-9);
        assert_eq!(&frames[4].data[..], &[4; 10]);
        assert!(frames[0].is_sync && !frames[4].is_sync);

        let shifted = frames[0].clone().rebase(10.0);
        assert!((shifted.display_timestamp - 10.1).abs() < 1e-9);
    }

    #[test]
    fn test_missing_mdat_is_malformed() {
        let full = FragmentBuilder::new(1, 1).build(&gop());
        // Drop the mdat entirely; trun offsets now point past the end.
        let moof_end = full.windows(4).position(|w| w == b"mdat").unwrap() - 4;
        let data = Bytes::copy_from_slice(&full[..moof_end]);

        let err = parse_media_segment(&data, &config()).unwrap_err();
        assert!(matches!(err, Error::MalformedSegment(_)));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let data = Bytes::from_static(b"not an mp4 at all");
        assert!(matches!(
            parse_media_segment(&data, &config()),
            Err(Error::MalformedSegment(_))
        ));
    }
}
