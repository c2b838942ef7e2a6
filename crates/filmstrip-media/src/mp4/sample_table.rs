//! Sample tables for whole-file (progressive) segments.
//!
//! A progressive MP4 describes its samples up front in `stbl`:
//! - stts: sample durations (decoding time)
//! - stss: sync sample table (keyframes)
//! - stsc: sample-to-chunk mapping
//! - stsz: sample sizes
//! - stco/co64: chunk offsets
//! - ctts: composition time offsets (for B-frames)

use std::collections::HashSet;

/// A resolved sample with everything needed to slice its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleEntry {
    /// Sample index in decode order (0-based).
    pub index: u32,
    /// Byte offset of the payload, relative to the start of the file.
    pub offset: u64,
    /// Payload size in bytes.
    pub size: u32,
    /// Decode timestamp in media timescale.
    pub dts: u64,
    /// Sample duration in media timescale.
    pub duration: u32,
    /// Composition time offset (pts - dts).
    pub cts_offset: i32,
    /// Whether this sample is a sync sample.
    pub is_keyframe: bool,
}

impl SampleEntry {
    /// Presentation timestamp, clamped at zero.
    pub fn pts(&self) -> u64 {
        (self.dts as i64 + self.cts_offset as i64).max(0) as u64
    }
}

/// All samples of one track, in decode order.
#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    /// Sample count.
    pub sample_count: u32,
    /// All resolved samples.
    pub samples: Vec<SampleEntry>,
}

impl SampleTable {
    /// Create a new sample table builder.
    pub fn builder() -> SampleTableBuilder {
        SampleTableBuilder::new()
    }

    /// Whether the table carries no samples (fragmented init segments).
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Iterate over all samples.
    pub fn iter(&self) -> impl Iterator<Item = &SampleEntry> {
        self.samples.iter()
    }
}

/// Collects raw `stbl` children and resolves them into a [`SampleTable`].
#[derive(Debug, Default)]
pub struct SampleTableBuilder {
    stts: Vec<(u32, u32)>,      // (count, delta)
    sync_samples: Vec<u32>,     // 1-based
    stsc: Vec<(u32, u32, u32)>, // (first_chunk, samples_per_chunk, description_index)
    uniform_size: u32,
    sizes: Vec<u32>,
    chunk_offsets: Vec<u64>,
    ctts: Vec<(u32, i32)>, // (count, offset)
}

impl SampleTableBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stts(&mut self, entries: Vec<(u32, u32)>) {
        self.stts = entries;
    }

    pub fn set_sync_samples(&mut self, samples: Vec<u32>) {
        self.sync_samples = samples;
    }

    pub fn set_stsc(&mut self, entries: Vec<(u32, u32, u32)>) {
        self.stsc = entries;
    }

    pub fn set_stsz(&mut self, uniform_size: u32, sizes: Vec<u32>) {
        self.uniform_size = uniform_size;
        self.sizes = sizes;
    }

    pub fn set_chunk_offsets(&mut self, offsets: Vec<u64>) {
        self.chunk_offsets = offsets;
    }

    pub fn set_ctts(&mut self, entries: Vec<(u32, i32)>) {
        self.ctts = entries;
    }

    /// Resolve every sample's offset, size, timing and sync flag.
    pub fn build(self) -> SampleTable {
        let stts_total: usize = self.stts.iter().map(|(count, _)| *count as usize).sum();
        let sample_count = if self.uniform_size > 0 {
            self.sizes.len().max(stts_total)
        } else {
            self.sizes.len()
        };

        if sample_count == 0 {
            return SampleTable::default();
        }

        let sizes: Vec<u32> = (0..sample_count).map(|i| self.size_of(i)).collect();
        let chunks = self.chunk_of_each_sample(sample_count);
        let offsets = self.offsets(&chunks, &sizes);
        let timing = expand_runs(&self.stts, sample_count);
        let cts = expand_runs(&self.ctts, sample_count);
        let sync: HashSet<u32> = self.sync_samples.iter().copied().collect();

        let mut dts = 0u64;
        let last_duration = timing.iter().rev().flatten().next().copied().unwrap_or(1);
        let samples = (0..sample_count)
            .map(|i| {
                let duration = timing[i].unwrap_or(last_duration);
                let entry = SampleEntry {
                    index: i as u32,
                    offset: offsets[i],
                    size: sizes[i],
                    dts,
                    duration,
                    cts_offset: cts[i].unwrap_or(0),
                    // No stss means every sample is a sync sample.
                    is_keyframe: sync.is_empty() || sync.contains(&(i as u32 + 1)),
                };
                dts += duration as u64;
                entry
            })
            .collect();

        SampleTable {
            sample_count: sample_count as u32,
            samples,
        }
    }

    fn size_of(&self, index: usize) -> u32 {
        if self.uniform_size > 0 {
            self.uniform_size
        } else {
            self.sizes.get(index).copied().unwrap_or(0)
        }
    }

    /// 0-based chunk index for every sample.
    fn chunk_of_each_sample(&self, sample_count: usize) -> Vec<usize> {
        if self.stsc.is_empty() {
            return vec![0; sample_count];
        }

        let num_chunks = self.chunk_offsets.len() as u32;
        let mut result = Vec::with_capacity(sample_count);

        'runs: for (i, &(first_chunk, per_chunk, _)) in self.stsc.iter().enumerate() {
            let next_first = self
                .stsc
                .get(i + 1)
                .map(|entry| entry.0)
                .unwrap_or(num_chunks + 1);

            for chunk in first_chunk..next_first.min(num_chunks + 1) {
                for _ in 0..per_chunk {
                    if result.len() >= sample_count {
                        break 'runs;
                    }
                    result.push(chunk.saturating_sub(1) as usize);
                }
            }
        }

        let last = result.last().copied().unwrap_or(0);
        result.resize(sample_count, last);
        result
    }

    fn offsets(&self, chunks: &[usize], sizes: &[u32]) -> Vec<u64> {
        let mut cursor_in_chunk = vec![0u64; self.chunk_offsets.len()];
        chunks
            .iter()
            .zip(sizes)
            .map(|(&chunk, &size)| {
                let base = self.chunk_offsets.get(chunk).copied().unwrap_or(0);
                match cursor_in_chunk.get_mut(chunk) {
                    Some(cursor) => {
                        let offset = base + *cursor;
                        *cursor += size as u64;
                        offset
                    }
                    None => base,
                }
            })
            .collect()
    }
}

/// Expand `(count, value)` runs into one slot per sample.
fn expand_runs<T: Copy>(runs: &[(u32, T)], sample_count: usize) -> Vec<Option<T>> {
    let mut out: Vec<Option<T>> = runs
        .iter()
        .flat_map(|&(count, value)| std::iter::repeat(Some(value)).take(count as usize))
        .take(sample_count)
        .collect();
    out.resize(sample_count, None);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_entry_pts() {
        let sample = SampleEntry {
            index: 0,
            offset: 100,
            size: 1000,
            dts: 1000,
            duration: 1000,
            cts_offset: 500,
            is_keyframe: true,
        };
        assert_eq!(sample.pts(), 1500);

        let negative = SampleEntry {
            dts: 100,
            cts_offset: -200,
            ..sample
        };
        assert_eq!(negative.pts(), 0);
    }

    #[test]
    fn test_builder_resolves_offsets_and_timing() {
        let mut builder = SampleTableBuilder::new();
        builder.set_stts(vec![(3, 1000)]);
        builder.set_sync_samples(vec![1]);
        builder.set_stsc(vec![(1, 3, 1)]);
        builder.set_stsz(0, vec![100, 200, 150]);
        builder.set_chunk_offsets(vec![1000]);
        builder.set_ctts(vec![(1, 0), (1, 2000), (1, 0)]);

        let table = builder.build();

        assert_eq!(table.sample_count, 3);
        assert_eq!(table.samples[0].offset, 1000);
        assert_eq!(table.samples[1].offset, 1100);
        assert_eq!(table.samples[2].offset, 1300);
        assert_eq!(table.samples[1].dts, 1000);
        assert_eq!(table.samples[1].pts(), 3000);
        assert!(table.samples[0].is_keyframe);
        assert!(!table.samples[1].is_keyframe);
    }

    #[test]
    fn test_builder_spreads_samples_over_chunks() {
        let mut builder = SampleTableBuilder::new();
        builder.set_stts(vec![(4, 512)]);
        builder.set_stsc(vec![(1, 2, 1)]);
        builder.set_stsz(10, vec![]);
        builder.set_chunk_offsets(vec![0, 500]);

        let table = builder.build();
        let offsets: Vec<u64> = table.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 10, 500, 510]);
        // No stss: every sample is sync.
        assert!(table.iter().all(|s| s.is_keyframe));
        assert_eq!(table.samples[3].dts, 1536);
    }

    #[test]
    fn test_empty_builder() {
        assert!(SampleTableBuilder::new().build().is_empty());
    }
}
