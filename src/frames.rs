//! Frame selection within one parsed segment.
//!
//! Frames arrive in decode order. Targets are picked in display order and
//! mapped back to the decode-order run that has to be submitted so every
//! reference is decoded first.

use std::ops::Range;

use filmstrip_media::CodedFrame;

/// Timestamps closer than this are treated as the same frame.
pub const TIMESTAMP_EPSILON: f64 = 1e-4;

/// Decode-order indices sorted by display timestamp.
pub fn display_order(frames: &[CodedFrame]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..frames.len()).collect();
    order.sort_by(|&a, &b| {
        frames[a]
            .display_timestamp
            .total_cmp(&frames[b].display_timestamp)
            .then(a.cmp(&b))
    });
    order
}

/// First sync frame in decode order.
pub fn first_sync(frames: &[CodedFrame]) -> Option<usize> {
    frames.iter().position(|f| f.is_sync)
}

/// Decode-order run covering every target: from the last sync frame at or
/// before the earliest target through the latest target.
pub fn run_for(frames: &[CodedFrame], targets: &[usize]) -> Range<usize> {
    let (Some(&first), Some(&last)) = (targets.iter().min(), targets.iter().max()) else {
        return 0..0;
    };
    let start = frames[..=first]
        .iter()
        .rposition(|f| f.is_sync)
        .unwrap_or(0);
    start..last + 1
}

/// Frame displayed at `time`: the last frame shown at or before it, or the
/// first displayed frame when `time` precedes them all.
pub fn frame_at_time(frames: &[CodedFrame], time: f64) -> Option<usize> {
    let order = display_order(frames);
    order
        .iter()
        .rev()
        .find(|&&i| frames[i].display_timestamp <= time + TIMESTAMP_EPSILON)
        .or_else(|| order.first())
        .copied()
}

/// Frame at a fractional position (clamped to `0..=1`) of the display-order
/// sequence.
pub fn frame_at_position(frames: &[CodedFrame], position: f64) -> Option<usize> {
    let order = display_order(frames);
    if order.is_empty() {
        return None;
    }
    let position = if position.is_nan() {
        0.0
    } else {
        position.clamp(0.0, 1.0)
    };
    let slot = ((position * order.len() as f64).floor() as usize).min(order.len() - 1);
    Some(order[slot])
}

/// `count` frames evenly spaced through the display-order sequence.
pub fn evenly_spaced(frames: &[CodedFrame], count: usize) -> Vec<usize> {
    let order = display_order(frames);
    let n = order.len();
    if n == 0 || count == 0 {
        return Vec::new();
    }
    let count = count.min(n);
    (0..count).map(|i| order[i * n / count]).collect()
}
