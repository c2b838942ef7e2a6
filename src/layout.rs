//! Timeline layout helpers: how many thumbnails a segment gets at a zoom.

use filmstrip_media::SegmentCatalog;

use crate::coordinator::{IntraRequest, IntraSegment};

/// Frames to decode for a segment of `duration` seconds drawn at
/// `px_per_sec`: one while the segment fits in a thumbnail (packed),
/// otherwise enough to tile its on-screen width (dense).
pub fn frames_for_segment(duration: f64, px_per_sec: f64, thumbnail_width: u32) -> usize {
    let width = duration * px_per_sec;
    if !width.is_finite() || thumbnail_width == 0 || width <= thumbnail_width as f64 {
        return 1;
    }
    (width / thumbnail_width as f64).ceil() as usize
}

/// Whether segments at this zoom need dense decoding.
pub fn is_dense(duration: f64, px_per_sec: f64, thumbnail_width: u32) -> bool {
    frames_for_segment(duration, px_per_sec, thumbnail_width) > 1
}

/// Dense request for every segment overlapping `[start, end]` that is wider
/// than one thumbnail at `px_per_sec`.
pub fn intra_request(
    catalog: &SegmentCatalog,
    start: f64,
    end: f64,
    px_per_sec: f64,
    thumbnail_width: u32,
    anchor: f64,
) -> IntraRequest {
    let segments = catalog
        .overlapping(start, end)
        .filter_map(|index| {
            let segment = catalog.get(index)?;
            let frame_count = frames_for_segment(segment.duration(), px_per_sec, thumbnail_width);
            (frame_count > 1).then_some(IntraSegment {
                segment_index: index,
                frame_count,
            })
        })
        .collect();
    IntraRequest { segments, anchor }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filmstrip_media::{InitDescriptor, SegmentDescriptor};

    #[test]
    fn test_packed_at_low_zoom() {
        // 2s at 16px/s is 32px wide.
        assert_eq!(frames_for_segment(2.0, 16.0, 160), 1);
        assert!(!is_dense(2.0, 16.0, 160));
        assert_eq!(frames_for_segment(2.0, 80.0, 160), 1);
    }

    #[test]
    fn test_dense_at_high_zoom() {
        // 2s at 200px/s is 400px wide.
        assert_eq!(frames_for_segment(2.0, 200.0, 160), 3);
        assert_eq!(frames_for_segment(2.0, 81.0, 160), 2);
        assert_eq!(frames_for_segment(2.0, f64::INFINITY, 160), 1);
    }

    #[test]
    fn test_intra_request_skips_packed_segments() {
        let catalog = SegmentCatalog::new(
            InitDescriptor::new("init.mp4"),
            vec![
                SegmentDescriptor::new("0.m4s", 0.0, 2.0),
                SegmentDescriptor::new("1.m4s", 2.0, 2.5),
                SegmentDescriptor::new("2.m4s", 2.5, 4.5),
            ],
        )
        .unwrap();

        let request = intra_request(&catalog, 0.0, 10.0, 200.0, 160, 1.0);
        let picked: Vec<(usize, usize)> = request
            .segments
            .iter()
            .map(|s| (s.segment_index, s.frame_count))
            .collect();
        assert_eq!(picked, vec![(0, 3), (2, 3)]);
        assert_eq!(request.anchor, 1.0);
    }
}
