//! Region queries against a loaded index.
//!
//! A query answers "which byte spans of the compressed stream may contain
//! records overlapping `[start, end)` on this reference". The result is a
//! minimal ordered set of chunks: candidate bins are gathered, pruned with
//! the linear index, then sorted and coalesced. Callers still filter the
//! records they decode against the actual query coordinates; the chunks
//! only bound where to look.

use super::{BamIndex, Chunk};
use crate::binning::{candidate_bins, window_for};

impl BamIndex {
    /// Chunks that may contain records overlapping `[start, end)` on
    /// `reference_id`.
    ///
    /// An unknown reference id yields an empty result, not an error. The
    /// returned chunks are sorted by begin offset and non-overlapping.
    #[must_use]
    pub fn regions_overlapping(&self, reference_id: usize, start: u32, end: u32) -> Vec<Chunk> {
        let Some(reference) = self.reference(reference_id) else {
            return Vec::new();
        };

        let mut chunks: Vec<Chunk> = candidate_bins(start, end)
            .into_iter()
            .filter_map(|bin_id| reference.chunks_for_bin(bin_id))
            .flatten()
            .copied()
            .collect();

        // Chunks that end before the linear-index floor for the query's
        // first window cannot contain overlapping records.
        if let Some(min_offset) = reference.linear_index().min_offset(window_for(start)) {
            chunks.retain(|chunk| chunk.end() >= min_offset);
        }

        chunks.sort_by_key(|chunk| chunk.begin());
        coalesce(chunks)
    }
}

/// Query an index for the byte regions overlapping a reference interval.
///
/// Free-function form of [`BamIndex::regions_overlapping`].
#[must_use]
pub fn query(index: &BamIndex, reference_id: usize, start: u32, end: u32) -> Vec<Chunk> {
    index.regions_overlapping(reference_id, start, end)
}

/// Merge overlapping or abutting chunks, assuming input sorted by begin.
fn coalesce(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        match merged.last_mut() {
            Some(last) if chunk.begin() <= last.end() => {
                if chunk.end() > last.end() {
                    *last = Chunk::new(last.begin(), chunk.end());
                }
            }
            _ => merged.push(chunk),
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::accumulator::{IndexAccumulator, RecordContext};
    use crate::virtual_offset::VirtualOffset;

    fn off(raw: u64) -> VirtualOffset {
        VirtualOffset::from_raw(raw)
    }

    fn chunk(begin: u64, end: u64) -> Chunk {
        Chunk::new(off(begin), off(end))
    }

    fn build_index(records: &[(usize, u32, u32, u64, u64)]) -> BamIndex {
        let n_ref = records.iter().map(|r| r.0 + 1).max().unwrap_or(1);
        let mut accumulator = IndexAccumulator::new(n_ref);
        for &(reference_id, start, end, begin, chunk_end) in records {
            accumulator
                .record(
                    Some(RecordContext { reference_id, start, end, is_mapped: true }),
                    chunk(begin, chunk_end),
                )
                .unwrap();
        }
        accumulator.seal().unwrap();
        accumulator.build(true).unwrap()
    }

    #[test]
    fn test_query_finds_overlapping_chunk() {
        let index = build_index(&[(0, 100, 200, 1 << 16, 2 << 16)]);
        let chunks = index.regions_overlapping(0, 150, 160);
        assert_eq!(chunks, vec![chunk(1 << 16, 2 << 16)]);
    }

    #[test]
    fn test_query_unknown_reference_is_empty() {
        let index = build_index(&[(0, 100, 200, 1 << 16, 2 << 16)]);
        assert!(index.regions_overlapping(7, 0, 1000).is_empty());
    }

    #[test]
    fn test_query_empty_region_is_empty_not_error() {
        // Records far away from the query window.
        let index = build_index(&[(0, 100, 200, 1 << 16, 2 << 16)]);
        let chunks = index.regions_overlapping(0, 10_000_000, 10_001_000);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_query_coalesces_adjacent_chunks() {
        // Two records in different leaf bins whose chunks abut.
        let index = build_index(&[
            (0, 100, 200, 1 << 16, 2 << 16),
            (0, 20_000, 20_100, 2 << 16, 3 << 16),
        ]);
        let chunks = index.regions_overlapping(0, 0, 30_000);
        assert_eq!(chunks, vec![chunk(1 << 16, 3 << 16)]);
    }

    #[test]
    fn test_linear_index_prunes_early_chunks() {
        // The first record straddles a window boundary, so it lives in a
        // coarse bin that is also a candidate for the later query. Its
        // chunk ends before the query window's floor and is pruned.
        let index = build_index(&[
            (0, 16_000, 17_000, 1 << 16, 2 << 16),
            (0, 40_000, 40_100, 5 << 16, 6 << 16),
        ]);

        let chunks = index.regions_overlapping(0, 40_000, 40_050);
        assert_eq!(chunks, vec![chunk(5 << 16, 6 << 16)]);
    }

    #[test]
    fn test_root_bin_chunks_survive_pruning_when_relevant() {
        // A record spanning multiple windows lands in a coarse bin but must
        // still be returned for queries late in its span.
        let index = build_index(&[
            (0, 0, 100_000, 1 << 16, 2 << 16),
            (0, 90_000, 90_100, 2 << 16, 3 << 16),
        ]);

        let chunks = index.regions_overlapping(0, 90_000, 90_050);
        assert_eq!(chunks, vec![chunk(1 << 16, 3 << 16)]);
    }

    #[test]
    fn test_coalesce_keeps_disjoint_chunks() {
        let merged = coalesce(vec![chunk(10, 20), chunk(30, 40)]);
        assert_eq!(merged, vec![chunk(10, 20), chunk(30, 40)]);
    }

    #[test]
    fn test_coalesce_merges_overlap() {
        let merged = coalesce(vec![chunk(10, 25), chunk(20, 40), chunk(40, 50)]);
        assert_eq!(merged, vec![chunk(10, 50)]);
    }
}
