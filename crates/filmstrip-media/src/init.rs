//! Initialization segment parsing.
//!
//! An init segment (`ftyp` + `moov`) carries everything a decoder needs
//! before the first media segment arrives: the codec, coded size, the codec
//! configuration record and, for fragmented streams, the `trex` defaults
//! that media segments lean on.

use crate::mp4::{Mp4File, TrackDefaults, VisualSampleEntry};
use crate::{Error, Result};

/// Decoder configuration for one rendition.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DecoderConfig {
    /// RFC 6381 codec string (`avc1.64001f`, `hvc1.1.6.L93.b0`, ...).
    pub codec: String,
    /// Coded width in pixels.
    pub width: u32,
    /// Coded height in pixels.
    pub height: u32,
    /// Codec configuration record (`avcC`/`hvcC`/... body).
    pub description: Vec<u8>,
    /// Track id of the video track inside the stream.
    pub track_id: u32,
    /// Video track timescale (ticks per second).
    pub timescale: u32,
    /// Whether samples are protected and need decryption first.
    pub encrypted: bool,
    /// Fragment defaults from `mvex/trex`.
    pub defaults: TrackDefaults,
}

impl DecoderConfig {
    /// Convert a track timestamp to seconds.
    pub fn ticks_to_secs(&self, ticks: i64) -> f64 {
        if self.timescale == 0 {
            0.0
        } else {
            ticks as f64 / self.timescale as f64
        }
    }
}

/// Parse an initialization segment into a [`DecoderConfig`].
///
/// Every failure, including I/O and truncation inside the box tree, is
/// reported as [`Error::MalformedInit`].
pub fn parse_init(bytes: &[u8]) -> Result<DecoderConfig> {
    let mp4 = Mp4File::from_bytes(bytes).map_err(|e| match e {
        Error::MalformedInit(_) => e,
        other => Error::malformed_init(other.to_string()),
    })?;

    if !mp4.has_moov {
        return Err(Error::malformed_init("no moov box"));
    }

    let track = mp4
        .video_track
        .as_ref()
        .ok_or_else(|| Error::malformed_init("no video track"))?;
    let entry = track
        .sample_entry
        .as_ref()
        .ok_or_else(|| Error::malformed_init("video track has no sample entry"))?;

    if track.timescale == 0 {
        return Err(Error::malformed_init("video track timescale is zero"));
    }

    let width = if entry.width > 0 {
        entry.width as u32
    } else {
        track.width.unwrap_or(0)
    };
    let height = if entry.height > 0 {
        entry.height as u32
    } else {
        track.height.unwrap_or(0)
    };

    let config = DecoderConfig {
        codec: codec_string(entry),
        width,
        height,
        description: entry.config.clone(),
        track_id: track.track_id,
        timescale: track.timescale,
        encrypted: entry.is_protected(),
        defaults: mp4.defaults_for(track.track_id),
    };

    tracing::debug!(
        codec = %config.codec,
        width = config.width,
        height = config.height,
        encrypted = config.encrypted,
        "parsed init segment"
    );

    Ok(config)
}

/// Derive an RFC 6381 codec string from a sample entry.
pub fn codec_string(entry: &VisualSampleEntry) -> String {
    let format = entry.effective_format();
    let fourcc = String::from_utf8_lossy(&format).into_owned();
    let cfg = entry.config.as_slice();

    match &format {
        b"avc1" | b"avc3" if cfg.len() >= 4 => {
            format!("{}.{:02x}{:02x}{:02x}", fourcc, cfg[1], cfg[2], cfg[3])
        }
        b"hvc1" | b"hev1" if cfg.len() >= 13 => hevc_codec_string(&fourcc, cfg),
        b"vp09" if cfg.len() >= 7 => {
            // vpcC is a full box: version/flags(4) profile level bitDepth|...
            format!("vp09.{:02}.{:02}.{:02}", cfg[4], cfg[5], cfg[6] >> 4)
        }
        b"av01" if cfg.len() >= 3 => {
            let profile = cfg[1] >> 5;
            let level = cfg[1] & 0x1f;
            let tier = if cfg[2] & 0x80 != 0 { 'H' } else { 'M' };
            let bit_depth = match (cfg[2] & 0x40 != 0, cfg[2] & 0x20 != 0) {
                (true, true) => 12,
                (true, false) => 10,
                _ => 8,
            };
            format!("av01.{}.{:02}{}.{:02}", profile, level, tier, bit_depth)
        }
        _ => fourcc,
    }
}

fn hevc_codec_string(fourcc: &str, cfg: &[u8]) -> String {
    let profile_space = ["", "A", "B", "C"][(cfg[1] >> 6) as usize];
    let tier = if cfg[1] & 0x20 != 0 { 'H' } else { 'L' };
    let profile_idc = cfg[1] & 0x1f;
    let compat = u32::from_be_bytes([cfg[2], cfg[3], cfg[4], cfg[5]]).reverse_bits();
    let level = cfg[12];

    let mut constraints: Vec<u8> = cfg[6..12].to_vec();
    while constraints.last() == Some(&0) {
        constraints.pop();
    }

    let mut codec = format!(
        "{}.{}{}.{:x}.{}{}",
        fourcc, profile_space, profile_idc, compat, tier, level
    );
    for byte in constraints {
        codec.push_str(&format!(".{:x}", byte));
    }
    codec
}
