//! Incremental index construction from a sorted record stream.
//!
//! The accumulator is fed one record at a time, in the order the records
//! land in the compressed output, together with the byte span each record
//! occupies. It maintains per-reference bins, linear indices and summary
//! counters, and freezes into a [`BamIndex`] once sealed.
//!
//! # State machine
//!
//! `Accumulating -> Sealed`. Records may only be added while accumulating;
//! the index may only be built after sealing. Driving the accumulator out
//! of order is a programming error and fails with
//! [`FgsortError::IllegalState`](crate::errors::FgsortError::IllegalState).
//!
//! Because the input stream is globally coordinate sorted, each reference
//! id arrives as one contiguous run; a regressing reference id means the
//! caller broke the ordering contract.

use super::{BamIndex, Chunk, LinearIndex, Metadata, ReferenceIndex};
use crate::binning::{self, window_for};
use crate::errors::{FgsortError, Result};
use crate::virtual_offset::VirtualOffset;
use std::collections::BTreeMap;

/// Coordinates of a placed record, as seen by the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordContext {
    /// Reference sequence id.
    pub reference_id: usize,
    /// 0-based inclusive start.
    pub start: u32,
    /// 0-based exclusive end.
    pub end: u32,
    /// Whether the mapped flag is set. Placed-but-unmapped records are
    /// binned like mapped ones but counted separately in the metadata.
    pub is_mapped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Accumulating,
    Sealed,
}

#[derive(Default)]
struct ReferenceState {
    bins: BTreeMap<u32, Vec<Chunk>>,
    linear_index: LinearIndex,
    mapped: u64,
    unmapped: u64,
    first_offset: Option<VirtualOffset>,
    last_offset: Option<VirtualOffset>,
}

impl ReferenceState {
    fn add(&mut self, context: RecordContext, chunk: Chunk) {
        let bin = binning::bin_for(context.start, context.end);
        let chunks = self.bins.entry(bin).or_default();
        // The stream is written front to back, so a new chunk can only
        // extend or abut the last one in its bin.
        match chunks.last_mut() {
            Some(last) if chunk.begin() <= last.end() => {
                if chunk.end() > last.end() {
                    *last = Chunk::new(last.begin(), chunk.end());
                }
            }
            _ => chunks.push(chunk),
        }

        let end_window = window_for(context.end.saturating_sub(1).max(context.start));
        self.linear_index.update(window_for(context.start), end_window, chunk.begin());

        if context.is_mapped {
            self.mapped += 1;
        } else {
            self.unmapped += 1;
        }

        if self.first_offset.is_none() {
            self.first_offset = Some(chunk.begin());
        }
        self.last_offset = Some(chunk.end());
    }

    fn into_reference_index(self, emit_metadata: bool) -> ReferenceIndex {
        let metadata = if emit_metadata && (self.mapped > 0 || self.unmapped > 0) {
            Some(Metadata {
                mapped: self.mapped,
                unmapped: self.unmapped,
                first_offset: self.first_offset.unwrap_or(VirtualOffset::MIN),
                last_offset: self.last_offset.unwrap_or(VirtualOffset::MIN),
            })
        } else {
            None
        };

        ReferenceIndex::new(self.bins, self.linear_index, metadata)
    }
}

/// Builds a [`BamIndex`] incrementally from a sorted, written stream.
pub struct IndexAccumulator {
    references: Vec<ReferenceState>,
    current_reference: Option<usize>,
    unplaced: u64,
    state: State,
}

impl IndexAccumulator {
    /// Create an accumulator for a dictionary of `reference_count` sequences.
    #[must_use]
    pub fn new(reference_count: usize) -> Self {
        let mut references = Vec::with_capacity(reference_count);
        references.resize_with(reference_count, ReferenceState::default);
        Self { references, current_reference: None, unplaced: 0, state: State::Accumulating }
    }

    /// Record one written record and the byte span it occupies.
    ///
    /// `context` is `None` for unplaced records (no reference assignment),
    /// which only bump the global unplaced counter.
    ///
    /// # Errors
    /// [`FgsortError::IllegalState`] if the accumulator is sealed, the
    /// reference id is outside the dictionary, or reference ids regress.
    pub fn record(&mut self, context: Option<RecordContext>, chunk: Chunk) -> Result<()> {
        if self.state == State::Sealed {
            return Err(FgsortError::illegal_state("record() called on a sealed accumulator"));
        }

        let Some(context) = context else {
            self.unplaced += 1;
            return Ok(());
        };

        if context.reference_id >= self.references.len() {
            return Err(FgsortError::illegal_state(format!(
                "reference id {} outside the dictionary of {} sequences",
                context.reference_id,
                self.references.len()
            )));
        }

        if let Some(current) = self.current_reference
            && context.reference_id < current
        {
            return Err(FgsortError::illegal_state(format!(
                "reference id regressed from {current} to {}; input is not coordinate sorted",
                context.reference_id
            )));
        }
        self.current_reference = Some(context.reference_id);

        self.references[context.reference_id].add(context, chunk);
        Ok(())
    }

    /// Number of unplaced records seen so far.
    #[must_use]
    pub fn unplaced(&self) -> u64 {
        self.unplaced
    }

    /// Freeze the accumulator: back-fill linear indices and forbid further
    /// records.
    ///
    /// # Errors
    /// [`FgsortError::IllegalState`] if already sealed.
    pub fn seal(&mut self) -> Result<()> {
        if self.state == State::Sealed {
            return Err(FgsortError::illegal_state("seal() called on a sealed accumulator"));
        }

        for reference in &mut self.references {
            reference.linear_index.seal();
        }

        self.state = State::Sealed;
        Ok(())
    }

    /// Build the final index.
    ///
    /// # Errors
    /// [`FgsortError::IllegalState`] if the accumulator was not sealed.
    pub fn build(self, emit_metadata: bool) -> Result<BamIndex> {
        if self.state != State::Sealed {
            return Err(FgsortError::illegal_state("build() called before seal()"));
        }

        let references = self
            .references
            .into_iter()
            .map(|reference| reference.into_reference_index(emit_metadata))
            .collect();

        Ok(BamIndex::new(references, Some(self.unplaced)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn off(raw: u64) -> VirtualOffset {
        VirtualOffset::from_raw(raw)
    }

    fn chunk(begin: u64, end: u64) -> Chunk {
        Chunk::new(off(begin), off(end))
    }

    fn placed(reference_id: usize, start: u32, end: u32) -> Option<RecordContext> {
        Some(RecordContext { reference_id, start, end, is_mapped: true })
    }

    #[test]
    fn test_records_accumulate_into_bins() {
        let mut accumulator = IndexAccumulator::new(1);
        accumulator.record(placed(0, 100, 200), chunk(10, 20)).unwrap();
        accumulator.record(placed(0, 300, 400), chunk(20, 30)).unwrap();
        accumulator.seal().unwrap();

        let index = accumulator.build(true).unwrap();
        let reference = index.reference(0).unwrap();

        // Both intervals live in leaf bin 4681 and the chunks abut, so
        // they coalesce into one span.
        assert_eq!(reference.chunks_for_bin(4681), Some(&[chunk(10, 30)][..]));
        assert_eq!(reference.linear_index().min_offset(0), Some(off(10)));

        let metadata = reference.metadata().unwrap();
        assert_eq!(metadata.mapped, 2);
        assert_eq!(metadata.unmapped, 0);
        assert_eq!(metadata.first_offset, off(10));
        assert_eq!(metadata.last_offset, off(30));
    }

    #[test]
    fn test_non_adjacent_chunks_stay_separate() {
        let mut accumulator = IndexAccumulator::new(1);
        accumulator.record(placed(0, 100, 200), chunk(10, 20)).unwrap();
        accumulator.record(placed(0, 300, 400), chunk(50, 60)).unwrap();
        accumulator.seal().unwrap();

        let index = accumulator.build(true).unwrap();
        let chunks = index.reference(0).unwrap().chunks_for_bin(4681).unwrap();
        assert_eq!(chunks, &[chunk(10, 20), chunk(50, 60)]);
    }

    #[test]
    fn test_unplaced_record_counts_only() {
        let mut accumulator = IndexAccumulator::new(1);
        accumulator.record(None, chunk(10, 20)).unwrap();
        accumulator.record(None, chunk(20, 30)).unwrap();
        accumulator.seal().unwrap();

        assert_eq!(accumulator.unplaced(), 2);
        let index = accumulator.build(true).unwrap();

        assert_eq!(index.unplaced(), Some(2));
        let reference = index.reference(0).unwrap();
        assert!(reference.bins().is_empty());
        assert!(reference.linear_index().offsets().is_empty());
        assert!(reference.metadata().is_none());
    }

    #[test]
    fn test_placed_unmapped_record_is_binned_and_counted() {
        let mut accumulator = IndexAccumulator::new(1);
        accumulator
            .record(
                Some(RecordContext { reference_id: 0, start: 100, end: 101, is_mapped: false }),
                chunk(10, 20),
            )
            .unwrap();
        accumulator.seal().unwrap();

        let index = accumulator.build(true).unwrap();
        let reference = index.reference(0).unwrap();
        assert!(!reference.bins().is_empty());
        let metadata = reference.metadata().unwrap();
        assert_eq!(metadata.mapped, 0);
        assert_eq!(metadata.unmapped, 1);
    }

    #[test]
    fn test_record_after_seal_is_illegal() {
        let mut accumulator = IndexAccumulator::new(1);
        accumulator.seal().unwrap();
        let err = accumulator.record(placed(0, 0, 1), chunk(0, 1)).unwrap_err();
        assert!(matches!(err, FgsortError::IllegalState { .. }));
    }

    #[test]
    fn test_build_before_seal_is_illegal() {
        let accumulator = IndexAccumulator::new(1);
        let err = accumulator.build(true).unwrap_err();
        assert!(matches!(err, FgsortError::IllegalState { .. }));
    }

    #[test]
    fn test_double_seal_is_illegal() {
        let mut accumulator = IndexAccumulator::new(1);
        accumulator.seal().unwrap();
        assert!(accumulator.seal().is_err());
    }

    #[test]
    fn test_regressing_reference_id_is_illegal() {
        let mut accumulator = IndexAccumulator::new(2);
        accumulator.record(placed(1, 0, 1), chunk(0, 1)).unwrap();
        let err = accumulator.record(placed(0, 0, 1), chunk(1, 2)).unwrap_err();
        assert!(matches!(err, FgsortError::IllegalState { .. }));
    }

    #[test]
    fn test_reference_id_out_of_range() {
        let mut accumulator = IndexAccumulator::new(1);
        let err = accumulator.record(placed(5, 0, 1), chunk(0, 1)).unwrap_err();
        assert!(matches!(err, FgsortError::IllegalState { .. }));
    }

    #[test]
    fn test_metadata_suppressed() {
        let mut accumulator = IndexAccumulator::new(1);
        accumulator.record(placed(0, 100, 200), chunk(10, 20)).unwrap();
        accumulator.seal().unwrap();

        let index = accumulator.build(false).unwrap();
        assert!(index.reference(0).unwrap().metadata().is_none());
    }

    #[test]
    fn test_empty_references_serialize_in_order() {
        let mut accumulator = IndexAccumulator::new(3);
        accumulator.record(placed(1, 0, 10), chunk(5, 6)).unwrap();
        accumulator.seal().unwrap();

        let index = accumulator.build(true).unwrap();
        assert_eq!(index.references().len(), 3);
        assert!(index.reference(0).unwrap().bins().is_empty());
        assert!(!index.reference(1).unwrap().bins().is_empty());
        assert!(index.reference(2).unwrap().bins().is_empty());
    }
}
