//! Fragmented MP4 support.
//!
//! Parsing of `moof`/`traf`/`trun` media fragments, plus writers that
//! produce init segments, fragments and progressive files.

mod fragment;
mod writer;

pub use fragment::{parse_fragments, FragmentSampleInfo};
pub use writer::{FragmentBuilder, FragmentSample, InitSegment, InitSegmentBuilder};
