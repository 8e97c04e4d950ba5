//! Hierarchical binning of genomic intervals.
//!
//! Implements the classic UCSC binning scheme used by BAM indices: a
//! six-level hierarchy of 37,450 bins covering 512 Mbp of one reference
//! sequence:
//!
//! - Level 0: bin 0 (512 Mbp)
//! - Level 1: bins 1-8 (64 Mbp each)
//! - Level 2: bins 9-72 (8 Mbp each)
//! - Level 3: bins 73-584 (1 Mbp each)
//! - Level 4: bins 585-4680 (128 Kbp each)
//! - Level 5: bins 4681-37449 (16 Kbp each)
//!
//! [`bin_for`] assigns an interval to the deepest bin that fully contains
//! it; [`candidate_bins`] enumerates every bin a query interval could draw
//! alignments from. Both are pure functions of their arguments.

/// Shift for the linear-index window size (16,384 bp windows).
pub const LINEAR_WINDOW_SHIFT: u32 = 14;

/// Size of one linear-index window in base pairs.
pub const LINEAR_WINDOW_SIZE: u32 = 1 << LINEAR_WINDOW_SHIFT;

/// Exclusive upper bound on addressable positions (512 Mbp).
pub const MAX_POSITION: u32 = 1 << 29;

/// Number of real bins (ids 0 through 37,449).
pub const BIN_COUNT: u32 = ((1 << 18) - 1) / 7 + 1;

/// Reserved pseudo-bin id carrying per-reference metadata.
pub const METADATA_BIN: u32 = BIN_COUNT;

/// Bit shifts for levels 1 through 5, coarsest first.
const LEVEL_SHIFTS: [u32; 5] = [26, 23, 20, 17, 14];

/// Assign an interval to the deepest bin whose span fully contains it.
///
/// Coordinates are 0-based with an exclusive end. An empty interval
/// (`start == end`) is assigned the bin of the single-base span at `start`.
/// Positions beyond the addressable range are clamped.
#[must_use]
pub fn bin_for(start: u32, end: u32) -> u32 {
    let start = start.min(MAX_POSITION - 1);
    let end = if end <= start { start } else { (end - 1).min(MAX_POSITION - 1) };

    for shift in LEVEL_SHIFTS.iter().rev() {
        if start >> shift == end >> shift {
            return level_offset(*shift) + (start >> shift);
        }
    }

    0
}

/// Enumerate every bin whose span intersects the query interval `[start, end)`.
///
/// The result always contains the root bin 0 and is a superset of
/// `bin_for(s, e)` for every record interval `[s, e)` overlapping the query.
/// False positives are expected and filtered downstream against actual
/// record coordinates; a missing bin would be a correctness bug.
///
/// A degenerate query (`start >= end`, e.g. any query against a zero-length
/// reference) yields only the root bin.
#[must_use]
pub fn candidate_bins(start: u32, end: u32) -> Vec<u32> {
    let mut bins = vec![0];

    let start = start.min(MAX_POSITION);
    let end = end.min(MAX_POSITION);
    if start >= end {
        return bins;
    }

    let end = end - 1;

    for shift in LEVEL_SHIFTS {
        let offset = level_offset(shift);
        for bin in (offset + (start >> shift))..=(offset + (end >> shift)) {
            bins.push(bin);
        }
    }

    bins
}

/// Linear-index window containing a position.
#[must_use]
pub fn window_for(position: u32) -> usize {
    (position >> LINEAR_WINDOW_SHIFT) as usize
}

/// First bin id of the level addressed by `shift`.
const fn level_offset(shift: u32) -> u32 {
    ((1 << (29 - shift)) - 1) / 7
}
