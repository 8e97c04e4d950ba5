//! In-memory model of the binary alignment index.
//!
//! An index maps genomic intervals to byte regions of the compressed output
//! stream. Per reference sequence it holds a hierarchical binning index
//! (bin id to chunk list), a linear index of per-window minimum offsets,
//! and optional summary metadata. The whole structure is immutable once
//! built and safe to share across query threads.

pub mod accumulator;
pub mod query;
pub mod read;
pub mod write;

pub use accumulator::{IndexAccumulator, RecordContext};
pub use query::query;
pub use read::read_index;
pub use write::{write_index, write_index_file};

use crate::virtual_offset::VirtualOffset;
use std::collections::BTreeMap;

/// Magic bytes opening a serialized index.
pub const BAI_MAGIC: &[u8; 4] = b"BAI\x01";

/// A contiguous byte span of the compressed stream assigned to a bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    begin: VirtualOffset,
    end: VirtualOffset,
}

impl Chunk {
    /// Create a chunk spanning `[begin, end]`.
    #[must_use]
    pub fn new(begin: VirtualOffset, end: VirtualOffset) -> Self {
        debug_assert!(begin <= end);
        Self { begin, end }
    }

    /// Start of the span.
    #[must_use]
    pub fn begin(self) -> VirtualOffset {
        self.begin
    }

    /// End of the span.
    #[must_use]
    pub fn end(self) -> VirtualOffset {
        self.end
    }
}

/// Per-window minimum virtual offsets for one reference sequence.
///
/// Entry *i* holds the smallest begin offset among all records overlapping
/// the 16 Kbp window *i*. The zero offset means "unset": queries get no
/// constraint from that window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinearIndex {
    offsets: Vec<VirtualOffset>,
}

impl LinearIndex {
    /// Wrap raw per-window offsets (used when deserializing).
    #[must_use]
    pub fn from_offsets(offsets: Vec<VirtualOffset>) -> Self {
        Self { offsets }
    }

    /// The per-window offsets, unset windows as the zero offset.
    #[must_use]
    pub fn offsets(&self) -> &[VirtualOffset] {
        &self.offsets
    }

    /// Minimum offset constraint for a window, if one is set.
    #[must_use]
    pub fn min_offset(&self, window: usize) -> Option<VirtualOffset> {
        self.offsets.get(window).copied().filter(|offset| !offset.is_zero())
    }

    /// Lower each window in `[start_window, end_window]` to `begin`.
    pub(crate) fn update(&mut self, start_window: usize, end_window: usize, begin: VirtualOffset) {
        if self.offsets.len() <= end_window {
            self.offsets.resize(end_window + 1, VirtualOffset::MIN);
        }

        for offset in &mut self.offsets[start_window..=end_window] {
            if offset.is_zero() || begin < *offset {
                *offset = begin;
            }
        }
    }

    /// Fill gaps after all records have been observed.
    ///
    /// Leading unset windows inherit the first set offset; interior gaps
    /// inherit the previous window's offset. Both fills keep the entries
    /// valid lower bounds.
    pub(crate) fn seal(&mut self) {
        let Some(first_set) = self.offsets.iter().position(|offset| !offset.is_zero()) else {
            return;
        };

        let first = self.offsets[first_set];
        for offset in &mut self.offsets[..first_set] {
            *offset = first;
        }

        let mut last = first;
        for offset in &mut self.offsets[first_set + 1..] {
            if offset.is_zero() {
                *offset = last;
            } else {
                last = *offset;
            }
        }
    }
}

/// Summary statistics for one reference sequence, carried by the reserved
/// metadata pseudo-bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Number of placed records with the mapped flag set.
    pub mapped: u64,
    /// Number of placed records with the mapped flag clear.
    pub unmapped: u64,
    /// Begin offset of the first record on this reference.
    pub first_offset: VirtualOffset,
    /// End offset of the last record on this reference.
    pub last_offset: VirtualOffset,
}

/// Index data for one reference sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceIndex {
    bins: BTreeMap<u32, Vec<Chunk>>,
    linear_index: LinearIndex,
    metadata: Option<Metadata>,
}

impl ReferenceIndex {
    /// Assemble a reference index from its parts.
    #[must_use]
    pub fn new(
        bins: BTreeMap<u32, Vec<Chunk>>,
        linear_index: LinearIndex,
        metadata: Option<Metadata>,
    ) -> Self {
        Self { bins, linear_index, metadata }
    }

    /// Bins with at least one chunk, keyed by bin id in ascending order.
    #[must_use]
    pub fn bins(&self) -> &BTreeMap<u32, Vec<Chunk>> {
        &self.bins
    }

    /// Chunks recorded for a bin.
    #[must_use]
    pub fn chunks_for_bin(&self, bin_id: u32) -> Option<&[Chunk]> {
        self.bins.get(&bin_id).map(Vec::as_slice)
    }

    /// The linear index.
    #[must_use]
    pub fn linear_index(&self) -> &LinearIndex {
        &self.linear_index
    }

    /// Summary metadata, when emitted.
    #[must_use]
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }
}

/// A complete index over one output stream: one [`ReferenceIndex`] per
/// reference sequence in dictionary order, plus the count of records with
/// no reference assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BamIndex {
    references: Vec<ReferenceIndex>,
    unplaced: Option<u64>,
}

impl BamIndex {
    /// Assemble an index from its parts.
    #[must_use]
    pub fn new(references: Vec<ReferenceIndex>, unplaced: Option<u64>) -> Self {
        Self { references, unplaced }
    }

    /// Per-reference indices in dictionary order.
    #[must_use]
    pub fn references(&self) -> &[ReferenceIndex] {
        &self.references
    }

    /// The index for one reference sequence.
    #[must_use]
    pub fn reference(&self, reference_id: usize) -> Option<&ReferenceIndex> {
        self.references.get(reference_id)
    }

    /// Count of records with no reference assignment, when recorded.
    #[must_use]
    pub fn unplaced(&self) -> Option<u64> {
        self.unplaced
    }
}
