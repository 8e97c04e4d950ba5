//! Sorted output writing with inline index construction.
//!
//! [`SortedIndexingWriter`] drains an already ordered record stream into a
//! BGZF-compressed sink, capturing the virtual offset before and after each
//! record and feeding both to an [`IndexAccumulator`]. The index therefore
//! reflects the final sorted byte layout without a second pass over the
//! output.
//!
//! [`build_sorted_and_indexed`] is the top-level entry point: it runs the
//! external sort (unless the caller vouches for the input order), writes
//! the sorted stream, and serializes the finished index.

use crate::errors::{FgsortError, Result};
use crate::index::accumulator::{IndexAccumulator, RecordContext};
use crate::index::write::write_index;
use crate::index::{BamIndex, Chunk};
use crate::logging::OperationTimer;
use crate::progress::ProgressTracker;
use crate::record::AlignmentRecord;
use crate::sort::external::ExternalSorter;
use crate::sort::keys::{CoordinateKey, QuerynameKey, SortKey, SortOrder};
use crate::virtual_offset::VirtualOffset;
use log::info;
use noodles_bgzf as bgzf;
use noodles_bgzf::io::writer::CompressionLevel;
use std::io::Write;
use std::path::PathBuf;

/// Default spill threshold for the sort stage (512 MB).
const DEFAULT_SPILL_THRESHOLD: usize = 512 * 1024 * 1024;

/// The reference-sequence dictionary of the output stream.
///
/// Owned configuration passed explicitly into the writer; the index carries
/// one entry per dictionary sequence, in this order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceDict {
    lengths: Vec<u64>,
}

impl ReferenceDict {
    /// Build a dictionary from reference sequence lengths, in order.
    #[must_use]
    pub fn from_lengths(lengths: Vec<u64>) -> Self {
        Self { lengths }
    }

    /// Number of reference sequences.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.lengths.len()
    }

    /// Reference sequence lengths, in dictionary order.
    #[must_use]
    pub fn lengths(&self) -> &[u64] {
        &self.lengths
    }
}

/// Options for a sort-and-write pass.
#[derive(Debug, Clone)]
pub struct SortOptions {
    sort_order: SortOrder,
    spill_threshold_bytes: usize,
    temp_dir: Option<PathBuf>,
    threads: usize,
    compression_level: u8,
    assume_sorted: bool,
    verify_order: bool,
    emit_metadata: bool,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            sort_order: SortOrder::Coordinate,
            spill_threshold_bytes: DEFAULT_SPILL_THRESHOLD,
            temp_dir: None,
            threads: 1,
            compression_level: 6,
            assume_sorted: false,
            verify_order: false,
            emit_metadata: true,
        }
    }
}

impl SortOptions {
    /// Create options with defaults (coordinate order, metadata emitted).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sort order.
    #[must_use]
    pub fn sort_order(mut self, order: SortOrder) -> Self {
        self.sort_order = order;
        self
    }

    /// Set the estimated-memory threshold that triggers a spill.
    #[must_use]
    pub fn spill_threshold_bytes(mut self, bytes: usize) -> Self {
        self.spill_threshold_bytes = bytes;
        self
    }

    /// Set the base directory for spill files.
    #[must_use]
    pub fn temp_dir(mut self, path: PathBuf) -> Self {
        self.temp_dir = Some(path);
        self
    }

    /// Set the number of threads for in-memory run sorting.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the BGZF compression level for the output stream.
    #[must_use]
    pub fn compression_level(mut self, level: u8) -> Self {
        self.compression_level = level;
        self
    }

    /// Trust the caller that the input is already in the requested order
    /// and skip the sort stage entirely.
    ///
    /// The ordering is not checked unless [`verify_order`](Self::verify_order)
    /// is also set: feeding unsorted input under `assume_sorted` silently
    /// produces a structurally valid but semantically wrong index.
    #[must_use]
    pub fn assume_sorted(mut self, assume_sorted: bool) -> Self {
        self.assume_sorted = assume_sorted;
        self
    }

    /// With [`assume_sorted`](Self::assume_sorted), add a cheap monotonicity
    /// check that fails on the first out-of-order record.
    #[must_use]
    pub fn verify_order(mut self, verify_order: bool) -> Self {
        self.verify_order = verify_order;
        self
    }

    /// Control whether per-reference summary metadata is emitted into the
    /// index.
    #[must_use]
    pub fn emit_metadata(mut self, emit_metadata: bool) -> Self {
        self.emit_metadata = emit_metadata;
        self
    }
}

/// Statistics from a sort-and-write pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortStats {
    /// Total records written.
    pub records: u64,
    /// Records with a reference and position.
    pub placed: u64,
    /// Records with no reference assignment.
    pub unplaced: u64,
    /// Number of sort runs spilled to disk.
    pub runs_spilled: usize,
}

/// Writes an ordered record stream to a BGZF sink while building its index.
///
/// Records must arrive in the order they should land in the output; the
/// writer captures each record's byte span and feeds it to the index
/// accumulator. [`finish`](Self::finish) closes the compressed stream and
/// returns the completed index.
pub struct SortedIndexingWriter<W: Write> {
    inner: bgzf::io::Writer<W>,
    accumulator: IndexAccumulator,
    emit_metadata: bool,
    records_written: u64,
}

impl<W: Write> SortedIndexingWriter<W> {
    /// Wrap an existing BGZF writer.
    #[must_use]
    pub fn new(inner: bgzf::io::Writer<W>, dict: &ReferenceDict, emit_metadata: bool) -> Self {
        Self {
            inner,
            accumulator: IndexAccumulator::new(dict.reference_count()),
            emit_metadata,
            records_written: 0,
        }
    }

    /// Build the BGZF layer over a raw byte sink.
    ///
    /// # Errors
    /// [`FgsortError::InvalidParameter`] if the compression level is not
    /// supported by the codec.
    pub fn from_writer(
        writer: W,
        dict: &ReferenceDict,
        compression_level: u8,
        emit_metadata: bool,
    ) -> Result<Self> {
        let level = CompressionLevel::new(compression_level).ok_or_else(|| {
            FgsortError::InvalidParameter {
                parameter: "compression_level".to_string(),
                reason: format!("{compression_level} is not a valid BGZF compression level"),
            }
        })?;

        let inner = bgzf::io::writer::Builder::default()
            .set_compression_level(level)
            .build_from_writer(writer);

        Ok(Self::new(inner, dict, emit_metadata))
    }

    /// Number of records written so far.
    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Write one record and record its byte span in the index.
    ///
    /// # Errors
    /// [`FgsortError::Storage`] if the codec write fails, or
    /// [`FgsortError::IllegalState`] if the record breaks the ordering
    /// contract (e.g. a regressing reference id).
    pub fn write_record(&mut self, record: &AlignmentRecord) -> Result<()> {
        let begin = VirtualOffset::from(self.inner.virtual_position());
        record
            .write_framed(&mut self.inner)
            .map_err(|e| FgsortError::storage("writing a record to the compressed output", e))?;
        let end = VirtualOffset::from(self.inner.virtual_position());

        self.records_written += 1;
        self.accumulator.record(record_context(record), Chunk::new(begin, end))
    }

    /// Flush and close the compressed stream, then seal and build the index.
    ///
    /// Returns the index together with the underlying sink.
    ///
    /// # Errors
    /// [`FgsortError::Storage`] if finishing the codec fails.
    pub fn finish(self) -> Result<(BamIndex, W)> {
        let Self { inner, mut accumulator, emit_metadata, .. } = self;

        let mut output = inner
            .finish()
            .map_err(|e| FgsortError::storage("finishing the compressed output", e))?;
        output
            .flush()
            .map_err(|e| FgsortError::storage("flushing the compressed output", e))?;

        accumulator.seal()?;
        let index = accumulator.build(emit_metadata)?;
        Ok((index, output))
    }
}

/// Index-facing view of a record: `None` for unplaced records.
fn record_context(record: &AlignmentRecord) -> Option<RecordContext> {
    let reference_id = record.reference_sequence_id()?;
    let start = record.alignment_start()?;
    let end = record.alignment_end().unwrap_or(start + 1);
    Some(RecordContext { reference_id, start, end, is_mapped: record.is_mapped() })
}

/// Sort a record stream, write it compressed, and serialize its index.
///
/// The records are sorted under `options.sort_order` (unless
/// `assume_sorted` is set), written to `output` through the BGZF codec, and
/// the finished index is serialized to `index_output` when one is given.
/// An index can only be requested for coordinate-sorted output.
///
/// # Errors
/// [`FgsortError::InvalidParameter`] for an index request on name-sorted
/// output, plus any error surfaced by the sort or write stages. Failures
/// never leave temp files or a partial index behind.
pub fn build_sorted_and_indexed<I, W, X>(
    records: I,
    dict: &ReferenceDict,
    options: &SortOptions,
    output: W,
    index_output: Option<X>,
) -> Result<SortStats>
where
    I: IntoIterator<Item = AlignmentRecord>,
    W: Write,
    X: Write,
{
    if index_output.is_some() && options.sort_order != SortOrder::Coordinate {
        return Err(FgsortError::InvalidParameter {
            parameter: "index_output".to_string(),
            reason: "an index can only be built for coordinate-sorted output".to_string(),
        });
    }

    match options.sort_order {
        SortOrder::Coordinate => {
            run_pass::<CoordinateKey, I, W, X>(records, dict, options, output, index_output)
        }
        SortOrder::Queryname => {
            run_pass::<QuerynameKey, I, W, X>(records, dict, options, output, index_output)
        }
    }
}

fn run_pass<K, I, W, X>(
    records: I,
    dict: &ReferenceDict,
    options: &SortOptions,
    output: W,
    index_output: Option<X>,
) -> Result<SortStats>
where
    K: SortKey,
    I: IntoIterator<Item = AlignmentRecord>,
    W: Write,
    X: Write,
{
    let timer = OperationTimer::new("Sorting and writing records");
    let progress = ProgressTracker::new("Wrote records");

    let mut writer = SortedIndexingWriter::from_writer(
        output,
        dict,
        options.compression_level,
        options.emit_metadata,
    )?;

    let mut stats = SortStats::default();

    if options.assume_sorted {
        info!("Input declared sorted; skipping the sort stage");
        let mut previous: Option<K> = None;

        for record in records {
            if options.verify_order {
                // A fixed ordinal makes the comparison purely semantic.
                let key = K::from_record(&record, 0);
                if let Some(prev) = &previous
                    && key < *prev
                {
                    return Err(FgsortError::illegal_state(format!(
                        "record {} out of order under assume_sorted",
                        writer.records_written()
                    )));
                }
                previous = Some(key);
            }

            writer.write_record(&record)?;
            progress.log_if_needed(1);
        }
    } else {
        let mut sorter = ExternalSorter::<K>::new()
            .spill_threshold_bytes(options.spill_threshold_bytes)
            .threads(options.threads);
        if let Some(dir) = &options.temp_dir {
            sorter = sorter.temp_dir(dir.clone());
        }

        for record in records {
            sorter.push(record)?;
        }

        let sorted = sorter.finish()?;
        stats.runs_spilled = sorted.runs_spilled();

        for record in sorted {
            writer.write_record(&record?)?;
            progress.log_if_needed(1);
        }
    }

    progress.log_final();
    stats.records = writer.records_written();

    let (index, _output) = writer.finish()?;
    stats.unplaced = index.unplaced().unwrap_or(0);
    stats.placed = stats.records - stats.unplaced;

    if let Some(mut sink) = index_output {
        write_index(&mut sink, &index)?;
    }

    timer.log_completion(stats.records);
    Ok(stats)
}
