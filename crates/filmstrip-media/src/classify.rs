//! I/P/B frame classification from container metadata alone.

use crate::segment::CodedFrame;

/// Picture type derived from sync flags and reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameType {
    I,
    P,
    B,
}

impl FrameType {
    pub fn as_char(&self) -> char {
        match self {
            Self::I => 'I',
            Self::P => 'P',
            Self::B => 'B',
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One classified frame, in decode order.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct GopEntry {
    pub frame_type: FrameType,
    /// Coded size in bytes.
    pub size: u32,
    /// Display timestamp in seconds.
    pub display_timestamp: f64,
}

/// Classified frames of one segment.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct GopStructure {
    pub segment_index: usize,
    pub entries: Vec<GopEntry>,
}

impl GopStructure {
    pub fn new(segment_index: usize, frames: &[CodedFrame]) -> Self {
        Self {
            segment_index,
            entries: classify(frames),
        }
    }

    /// Number of frames of the given type.
    pub fn count(&self, frame_type: FrameType) -> usize {
        self.entries
            .iter()
            .filter(|e| e.frame_type == frame_type)
            .count()
    }

    /// Frame types as a compact string such as `IPBBP`.
    pub fn pattern(&self) -> String {
        self.entries.iter().map(|e| e.frame_type.as_char()).collect()
    }

    /// Total coded bytes in the segment.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size as u64).sum()
    }
}

/// Classify frames given in decode order.
///
/// Sync frames are `I`. A non-sync frame is `B` when it is displayed before
/// some frame decoded earlier in the same segment, otherwise `P`. Streams
/// without reordering therefore classify every non-sync frame as `P`.
pub fn classify(frames: &[CodedFrame]) -> Vec<GopEntry> {
    let mut latest_display = f64::NEG_INFINITY;

    frames
        .iter()
        .map(|frame| {
            let frame_type = if frame.is_sync {
                FrameType::I
            } else if frame.display_timestamp < latest_display {
                FrameType::B
            } else {
                FrameType::P
            };
            latest_display = latest_display.max(frame.display_timestamp);

            GopEntry {
                frame_type,
                size: frame.byte_size,
                display_timestamp: frame.display_timestamp,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(dts: f64, pts: f64, is_sync: bool, size: u32) -> CodedFrame {
        CodedFrame {
            data: Bytes::new(),
            decode_timestamp: dts,
            display_timestamp: pts,
            duration: 0.04,
            is_sync,
            byte_size: size,
        }
    }

    #[test]
    fn test_reordered_gop() {
        // Decode order I P B B P, display order I B B P P.
        let frames = vec![
            frame(0.00, 0.04, true, 5000),
            frame(0.04, 0.16, false, 900),
            frame(0.08, 0.08, false, 300),
            frame(0.12, 0.12, false, 310),
            frame(0.16, 0.20, false, 880),
        ];
        let types: Vec<FrameType> = classify(&frames).iter().map(|e| e.frame_type).collect();
        assert_eq!(
            types,
            vec![FrameType::I, FrameType::P, FrameType::B, FrameType::B, FrameType::P]
        );

        let gop = GopStructure::new(3, &frames);
        assert_eq!(gop.pattern(), "IPBBP");
        assert_eq!(gop.count(FrameType::B), 2);
        assert_eq!(gop.total_bytes(), 7390);
        assert_eq!(gop.entries[1].size, 900);
    }

    #[test]
    fn test_no_reordering_is_all_p() {
        let frames: Vec<CodedFrame> = (0..4)
            .map(|i| frame(i as f64, i as f64, i == 0, 100))
            .collect();
        assert_eq!(GopStructure::new(0, &frames).pattern(), "IPPP");
    }

    #[test]
    fn test_degenerate_segments() {
        assert!(classify(&[]).is_empty());
        assert_eq!(classify(&[frame(0.0, 0.0, true, 1)])[0].frame_type, FrameType::I);
        assert_eq!(classify(&[frame(0.0, 0.0, false, 1)])[0].frame_type, FrameType::P);
    }

    #[test]
    fn test_open_gop_leading_b_frames() {
        // Leading B frames after a sync frame in an open GOP.
        let frames = vec![
            frame(0.0, 0.2, true, 1),
            frame(0.1, 0.0, false, 1),
            frame(0.2, 0.1, false, 1),
        ];
        assert_eq!(GopStructure::new(0, &frames).pattern(), "IBB");
    }
}
