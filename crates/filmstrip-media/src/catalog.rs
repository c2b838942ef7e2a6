//! Segment catalog: the ordered timeline of one rendition.
//!
//! A catalog is supplied by the streaming layer and never mutated; a
//! rendition switch replaces it wholesale.

use std::ops::Range;

use crate::{Error, Result};

/// Tolerance when checking that segments do not overlap.
const OVERLAP_EPSILON: f64 = 1e-3;

/// Inclusive byte range within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ByteRange {
    /// First byte.
    pub start: u64,
    /// Last byte (inclusive).
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    /// Value for an HTTP `Range` header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

fn range_of(start: Option<u64>, end: Option<u64>) -> Option<ByteRange> {
    match (start, end) {
        (Some(start), Some(end)) if end >= start => Some(ByteRange { start, end }),
        _ => None,
    }
}

/// One media segment of the timeline.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SegmentDescriptor {
    pub url: String,
    /// Start time in seconds.
    pub start_time: f64,
    /// End time in seconds (exclusive).
    pub end_time: f64,
    #[cfg_attr(feature = "serialize", serde(default, skip_serializing_if = "Option::is_none"))]
    pub byte_range_start: Option<u64>,
    #[cfg_attr(feature = "serialize", serde(default, skip_serializing_if = "Option::is_none"))]
    pub byte_range_end: Option<u64>,
}

impl SegmentDescriptor {
    pub fn new(url: impl Into<String>, start_time: f64, end_time: f64) -> Self {
        Self {
            url: url.into(),
            start_time,
            end_time,
            byte_range_start: None,
            byte_range_end: None,
        }
    }

    /// Address this segment as a byte range of `url`.
    pub fn with_byte_range(mut self, range: ByteRange) -> Self {
        self.byte_range_start = Some(range.start);
        self.byte_range_end = Some(range.end);
        self
    }

    pub fn byte_range(&self) -> Option<ByteRange> {
        range_of(self.byte_range_start, self.byte_range_end)
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn midpoint(&self) -> f64 {
        (self.start_time + self.end_time) / 2.0
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start_time && time < self.end_time
    }
}

/// Location of the initialization segment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct InitDescriptor {
    pub url: String,
    #[cfg_attr(feature = "serialize", serde(default, skip_serializing_if = "Option::is_none"))]
    pub byte_range_start: Option<u64>,
    #[cfg_attr(feature = "serialize", serde(default, skip_serializing_if = "Option::is_none"))]
    pub byte_range_end: Option<u64>,
}

impl InitDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            byte_range_start: None,
            byte_range_end: None,
        }
    }

    pub fn byte_range(&self) -> Option<ByteRange> {
        range_of(self.byte_range_start, self.byte_range_end)
    }
}

/// Ordered, non-overlapping segments plus the init segment.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SegmentCatalog {
    pub init: InitDescriptor,
    pub segments: Vec<SegmentDescriptor>,
}

impl SegmentCatalog {
    /// Build a catalog, rejecting unordered or overlapping segments.
    pub fn new(init: InitDescriptor, segments: Vec<SegmentDescriptor>) -> Result<Self> {
        let catalog = Self { init, segments };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Check every segment has positive duration and starts no earlier than
    /// the previous one ends.
    pub fn validate(&self) -> Result<()> {
        for (i, segment) in self.segments.iter().enumerate() {
            let duration = segment.duration();
            if duration.is_nan() || duration <= 0.0 {
                return Err(Error::InvalidCatalog(format!(
                    "segment {} has non-positive duration ({} .. {})",
                    i, segment.start_time, segment.end_time
                )));
            }
            if let Some(prev) = i.checked_sub(1).map(|p| &self.segments[p]) {
                if segment.start_time + OVERLAP_EPSILON < prev.end_time {
                    return Err(Error::InvalidCatalog(format!(
                        "segment {} starts at {} before segment {} ends at {}",
                        i,
                        segment.start_time,
                        i - 1,
                        prev.end_time
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SegmentDescriptor> {
        self.segments.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SegmentDescriptor> {
        self.segments.iter()
    }

    /// Total timeline duration in seconds.
    pub fn duration(&self) -> f64 {
        match (self.segments.first(), self.segments.last()) {
            (Some(first), Some(last)) => last.end_time - first.start_time,
            _ => 0.0,
        }
    }

    /// Find the segment containing `time`. The end of the last segment maps
    /// to the last segment.
    pub fn find_segment_at_time(&self, time: f64) -> Option<usize> {
        let idx = self.segments.partition_point(|s| s.end_time <= time);
        match self.segments.get(idx) {
            Some(segment) if segment.start_time <= time => Some(idx),
            Some(_) => None,
            None => self
                .segments
                .last()
                .filter(|last| time <= last.end_time && time >= last.start_time)
                .map(|_| idx - 1),
        }
    }

    /// Indices of segments overlapping `[start, end]`.
    pub fn overlapping(&self, start: f64, end: f64) -> Range<usize> {
        let first = self.segments.partition_point(|s| s.end_time <= start);
        let last = self.segments.partition_point(|s| s.start_time < end);
        first..last.max(first)
    }
}
