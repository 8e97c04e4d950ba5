//! External merge-sort of alignment record streams.
//!
//! Handles inputs larger than available memory by spilling sorted runs to
//! temporary files and k-way merging them back into one ascending stream.
//!
//! # Algorithm
//!
//! 1. **Accumulate phase**: records buffer in memory until the spill
//!    threshold is reached
//! 2. **Sort phase**: the run is sorted in memory (parallel via rayon when
//!    configured with more than one thread)
//! 3. **Spill phase**: the sorted run is handed to a dedicated worker
//!    thread over a bounded channel, which writes it to a temp file with
//!    fast compression while the caller fills the next run
//! 4. **Merge phase**: all spilled runs plus the final in-memory run merge
//!    through a binary heap into a single ordered stream
//!
//! Keys carry the input sequence number as their last ordering component,
//! so records that compare equal under the semantic order come out in their
//! original input order and the merge is fully deterministic.
//!
//! Temp files live in their own [`TempDir`]: each run file is deleted as
//! soon as it has been fully consumed, and the directory itself is removed
//! on every exit path, including errors and early drops.

use crate::errors::{FgsortError, Result};
use crate::record::AlignmentRecord;
use crate::sort::keys::SortKey;
use crossbeam_channel::{Receiver, Sender, bounded};
use log::info;
use noodles_bgzf as bgzf;
use noodles_bgzf::io::writer::CompressionLevel;
use rayon::prelude::*;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tempfile::TempDir;

/// Default spill threshold (512 MB of estimated record memory).
const DEFAULT_SPILL_THRESHOLD: usize = 512 * 1024 * 1024;

/// Buffer size for temp-file I/O.
const RUN_BUFFER_SIZE: usize = 64 * 1024;

/// Estimated fixed overhead per buffered record (allocation headers, heap
/// bookkeeping) on top of its payload and key.
const PER_RECORD_OVERHEAD: usize = 48;

/// Compression level for temporary run files (fast compression).
const TEMP_COMPRESSION_LEVEL: u8 = 1;

/// Bounded-memory sorter for alignment record streams.
///
/// Push records in any order, then call [`finish`](Self::finish) to obtain
/// one globally ordered stream.
pub struct ExternalSorter<K: SortKey> {
    spill_threshold: usize,
    temp_dir: Option<PathBuf>,
    threads: usize,
    run: Vec<(K, AlignmentRecord)>,
    run_bytes: usize,
    next_sequence: u64,
    pipeline: Option<SpillPipeline<K>>,
}

impl<K: SortKey> Default for ExternalSorter<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: SortKey> ExternalSorter<K> {
    /// Create a sorter with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            temp_dir: None,
            threads: 1,
            run: Vec::new(),
            run_bytes: 0,
            next_sequence: 0,
            pipeline: None,
        }
    }

    /// Set the estimated-memory threshold that triggers a spill.
    #[must_use]
    pub fn spill_threshold_bytes(mut self, bytes: usize) -> Self {
        self.spill_threshold = bytes.max(1);
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
        self.threads = threads.max(1);
        self
    }

    /// Number of records pushed so far.
    #[must_use]
    pub fn records_pushed(&self) -> u64 {
        self.next_sequence
    }

    /// Buffer one record, spilling the current run if the threshold is hit.
    ///
    /// # Errors
    /// [`FgsortError::Storage`] if spilling fails. Already written temp
    /// files are removed before the error is returned.
    pub fn push(&mut self, record: AlignmentRecord) -> Result<()> {
        let key = K::from_record(&record, self.next_sequence);
        self.next_sequence += 1;
        self.run_bytes += estimate_entry_size(&key, &record);
        self.run.push((key, record));

        if self.run_bytes >= self.spill_threshold {
            self.spill_current_run()?;
        }

        Ok(())
    }

    /// Sort whatever is buffered and merge it with all spilled runs into a
    /// single ascending stream.
    ///
    /// # Errors
    /// [`FgsortError::Storage`] if the spill worker failed or a run file
    /// cannot be reopened; temp files are cleaned up before returning.
    pub fn finish(mut self) -> Result<SortedRecords<K>> {
        self.sort_run();
        let run = std::mem::take(&mut self.run);

        let Some(mut pipeline) = self.pipeline.take() else {
            return SortedRecords::new(vec![RunSource::Memory(run.into_iter())], None);
        };

        // Close the channel and wait for the worker to drain its queue.
        drop(pipeline.sender.take());
        if let Some(worker) = pipeline.worker.take() {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(FgsortError::illegal_state("spill worker panicked")),
            }
        }

        let temp_dir = pipeline.temp_dir.take();
        let runs = std::mem::take(&mut pipeline.runs);
        info!("Merging {} spilled runs and the final in-memory run", runs.len());

        let mut sources = Vec::with_capacity(runs.len() + 1);
        for handle in runs {
            sources.push(RunSource::File(RunReader::open(handle)?));
        }
        if !run.is_empty() {
            sources.push(RunSource::Memory(run.into_iter()));
        }

        SortedRecords::new(sources, temp_dir)
    }

    fn sort_run(&mut self) {
        if self.threads > 1 {
            self.run.par_sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
        } else {
            self.run.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
        }
    }

    fn spill_current_run(&mut self) -> Result<()> {
        if self.run.is_empty() {
            return Ok(());
        }

        self.sort_run();

        if self.pipeline.is_none() {
            self.pipeline = Some(SpillPipeline::start(self.temp_dir.as_deref())?);
        }
        let pipeline = self.pipeline.as_mut().expect("pipeline just ensured");

        let run = std::mem::take(&mut self.run);
        self.run_bytes = 0;

        let temp_path = pipeline
            .temp_dir
            .as_ref()
            .expect("temp dir lives until finish")
            .path()
            .join(format!("run_{:04}.sfr", pipeline.runs.len()));
        pipeline.runs.push(RunHandle { path: temp_path.clone(), records: run.len() });
        info!("Spilling run {} ({} records)", pipeline.runs.len(), run.len());

        if let Some(sender) = &pipeline.sender
            && sender.send(SpillJob { run, path: temp_path }).is_err()
        {
            // The worker is gone; surface its error and drop the pipeline,
            // which removes any temp files already written.
            let error = pipeline.worker_failure();
            self.pipeline = None;
            return Err(error);
        }

        Ok(())
    }
}

/// Estimated memory held by one buffered record and its key.
fn estimate_entry_size<K: SortKey>(key: &K, record: &AlignmentRecord) -> usize {
    record.as_bytes().len() + key.serialized_len() + PER_RECORD_OVERHEAD
}

/// A spilled run awaiting merge.
struct RunHandle {
    path: PathBuf,
    records: usize,
}

/// One sorted run handed to the spill worker.
struct SpillJob<K> {
    run: Vec<(K, AlignmentRecord)>,
    path: PathBuf,
}

/// Background spill state: the temp directory, the worker thread and the
/// channel feeding it.
struct SpillPipeline<K: SortKey> {
    temp_dir: Option<TempDir>,
    sender: Option<Sender<SpillJob<K>>>,
    worker: Option<JoinHandle<Result<()>>>,
    runs: Vec<RunHandle>,
}

impl<K: SortKey> SpillPipeline<K> {
    fn start(base: Option<&Path>) -> Result<Self> {
        let temp_dir = match base {
            Some(base) => {
                fs::create_dir_all(base).map_err(|e| {
                    FgsortError::storage(
                        format!("creating temp directory under {}", base.display()),
                        e,
                    )
                })?;
                TempDir::new_in(base)
            }
            None => TempDir::new(),
        }
        .map_err(|e| FgsortError::storage("creating temp directory", e))?;

        // Capacity 1: the caller may sort and queue one run while the
        // worker is still writing the previous one.
        let (sender, receiver) = bounded::<SpillJob<K>>(1);
        let worker = std::thread::Builder::new()
            .name("fgsort-spill".to_string())
            .spawn(move || spill_worker(&receiver))
            .map_err(|e| FgsortError::storage("spawning the spill worker", e))?;

        Ok(Self {
            temp_dir: Some(temp_dir),
            sender: Some(sender),
            worker: Some(worker),
            runs: Vec::new(),
        })
    }

    fn worker_failure(&mut self) -> FgsortError {
        drop(self.sender.take());
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(Err(e))) => e,
            Some(Err(_)) => FgsortError::illegal_state("spill worker panicked"),
            _ => FgsortError::illegal_state("spill worker exited unexpectedly"),
        }
    }
}

impl<K: SortKey> Drop for SpillPipeline<K> {
    fn drop(&mut self) {
        // Stop the worker before the temp dir is removed so no file is
        // being written while the directory disappears.
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn spill_worker<K: SortKey>(receiver: &Receiver<SpillJob<K>>) -> Result<()> {
    while let Ok(job) = receiver.recv() {
        write_run(&job)?;
    }
    Ok(())
}

fn write_run<K: SortKey>(job: &SpillJob<K>) -> Result<()> {
    let context = || format!("writing spill run {}", job.path.display());

    let file = File::create(&job.path).map_err(|e| FgsortError::storage(context(), e))?;
    let mut builder = bgzf::io::writer::Builder::default();
    if let Some(level) = CompressionLevel::new(TEMP_COMPRESSION_LEVEL) {
        builder = builder.set_compression_level(level);
    }
    let mut writer = builder.build_from_writer(BufWriter::with_capacity(RUN_BUFFER_SIZE, file));

    for (key, record) in &job.run {
        key.write_to(&mut writer).map_err(|e| FgsortError::storage(context(), e))?;
        record.write_framed(&mut writer).map_err(|e| FgsortError::storage(context(), e))?;
    }

    let mut file = writer.finish().map_err(|e| FgsortError::storage(context(), e))?;
    file.flush().map_err(|e| FgsortError::storage(context(), e))?;
    Ok(())
}

/// Reader over one spilled run of `[key][len][record]` frames.
struct RunReader<K: SortKey> {
    reader: bgzf::io::Reader<BufReader<File>>,
    path: PathBuf,
    remaining: usize,
    _marker: PhantomData<K>,
}

impl<K: SortKey> RunReader<K> {
    fn open(handle: RunHandle) -> Result<Self> {
        let file = File::open(&handle.path).map_err(|e| {
            FgsortError::storage(format!("opening spill run {}", handle.path.display()), e)
        })?;

        Ok(Self {
            reader: bgzf::io::Reader::new(BufReader::with_capacity(RUN_BUFFER_SIZE, file)),
            path: handle.path,
            remaining: handle.records,
            _marker: PhantomData,
        })
    }

    fn next_entry(&mut self) -> Result<Option<(K, AlignmentRecord)>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let context = |e| FgsortError::storage(format!("reading spill run {}", self.path.display()), e);

        let key = K::read_from(&mut self.reader).map_err(context)?;
        let record = AlignmentRecord::read_framed(&mut self.reader)
            .map_err(context)?
            .ok_or_else(|| {
                FgsortError::storage(
                    format!("reading spill run {}", self.path.display()),
                    io::Error::new(io::ErrorKind::UnexpectedEof, "run ended early"),
                )
            })?;

        self.remaining -= 1;
        if self.remaining == 0 {
            // Fully consumed; reclaim the disk space right away.
            let _ = fs::remove_file(&self.path);
        }

        Ok(Some((key, record)))
    }
}

enum RunSource<K: SortKey> {
    Memory(std::vec::IntoIter<(K, AlignmentRecord)>),
    File(RunReader<K>),
}

impl<K: SortKey> RunSource<K> {
    fn next_entry(&mut self) -> Result<Option<(K, AlignmentRecord)>> {
        match self {
            Self::Memory(iter) => Ok(iter.next()),
            Self::File(reader) => reader.next_entry(),
        }
    }
}

/// Entry in the merge heap.
struct HeapEntry<K> {
    key: K,
    record: AlignmentRecord,
    source: usize,
}

impl<K: Ord> PartialEq for HeapEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<K: Ord> Eq for HeapEntry<K> {}

impl<K: Ord> PartialOrd for HeapEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for HeapEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// The merged, globally ordered record stream produced by
/// [`ExternalSorter::finish`].
///
/// Dropping the stream at any point removes all remaining temp files.
pub struct SortedRecords<K: SortKey> {
    heap: BinaryHeap<Reverse<HeapEntry<K>>>,
    sources: Vec<RunSource<K>>,
    runs_spilled: usize,
    failed: bool,
    _temp_dir: Option<TempDir>,
}

impl<K: SortKey> SortedRecords<K> {
    fn new(mut sources: Vec<RunSource<K>>, temp_dir: Option<TempDir>) -> Result<Self> {
        let runs_spilled =
            sources.iter().filter(|source| matches!(source, RunSource::File(_))).count();

        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (index, source) in sources.iter_mut().enumerate() {
            if let Some((key, record)) = source.next_entry()? {
                heap.push(Reverse(HeapEntry { key, record, source: index }));
            }
        }

        Ok(Self { heap, sources, runs_spilled, failed: false, _temp_dir: temp_dir })
    }

    /// Number of runs that were spilled to disk.
    #[must_use]
    pub fn runs_spilled(&self) -> usize {
        self.runs_spilled
    }
}

impl<K: SortKey> Iterator for SortedRecords<K> {
    type Item = Result<AlignmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let Reverse(entry) = self.heap.pop()?;

        match self.sources[entry.source].next_entry() {
            Ok(Some((key, record))) => {
                self.heap.push(Reverse(HeapEntry { key, record, source: entry.source }));
            }
            Ok(None) => {}
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        }

        Some(Ok(entry.record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBuilder;
    use crate::sort::keys::{CoordinateKey, QuerynameKey};

    fn mapped(name: &str, tid: i32, pos: i32) -> AlignmentRecord {
        RecordBuilder::new()
            .name(name)
            .reference_sequence_id(tid)
            .alignment_start(pos)
            .build()
    }

    fn drain(sorted: SortedRecords<CoordinateKey>) -> Vec<AlignmentRecord> {
        sorted.map(|r| r.unwrap()).collect()
    }

    fn names(records: &[AlignmentRecord]) -> Vec<String> {
        records.iter().map(|r| r.name().to_string()).collect()
    }

    #[test]
    fn test_in_memory_sort() {
        let mut sorter = ExternalSorter::<CoordinateKey>::new();
        sorter.push(mapped("c", 1, 50)).unwrap();
        sorter.push(mapped("a", 0, 500)).unwrap();
        sorter.push(mapped("b", 0, 100)).unwrap();

        let sorted = sorter.finish().unwrap();
        assert_eq!(sorted.runs_spilled(), 0);
        assert_eq!(names(&drain(sorted)), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_unplaced_records_sort_last() {
        let mut sorter = ExternalSorter::<CoordinateKey>::new();
        sorter.push(RecordBuilder::new().name("u").unmapped().build()).unwrap();
        sorter.push(mapped("m", 0, 10)).unwrap();

        let records = drain(sorter.finish().unwrap());
        assert_eq!(names(&records), vec!["m", "u"]);
    }

    #[test]
    fn test_spilled_sort_matches_in_memory_sort() {
        let build_input = || {
            (0..500).map(|i| mapped(&format!("r{i}"), (i % 3) as i32, ((i * 7919) % 100_000) as i32))
        };

        let mut in_memory = ExternalSorter::<CoordinateKey>::new();
        for record in build_input() {
            in_memory.push(record).unwrap();
        }
        let expected = names(&drain(in_memory.finish().unwrap()));

        // Tiny thresholds force many spills; the output must be identical.
        for threshold in [1, 512, 4096] {
            let mut sorter =
                ExternalSorter::<CoordinateKey>::new().spill_threshold_bytes(threshold);
            for record in build_input() {
                sorter.push(record).unwrap();
            }
            let sorted = sorter.finish().unwrap();
            assert!(sorted.runs_spilled() > 0);
            assert_eq!(names(&drain(sorted)), expected, "threshold {threshold}");
        }
    }

    #[test]
    fn test_output_is_permutation_of_input() {
        let mut sorter = ExternalSorter::<CoordinateKey>::new().spill_threshold_bytes(256);
        for i in 0..200 {
            sorter.push(mapped(&format!("r{i}"), 0, (i * 31) % 5000)).unwrap();
        }

        let records = drain(sorter.finish().unwrap());
        assert_eq!(records.len(), 200);

        let mut seen = names(&records);
        seen.sort();
        let mut expected: Vec<String> = (0..200).map(|i| format!("r{i}")).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_equal_keys_keep_input_order() {
        let mut sorter = ExternalSorter::<CoordinateKey>::new().spill_threshold_bytes(1);
        for name in ["first", "second", "third", "fourth"] {
            sorter.push(mapped(name, 0, 100)).unwrap();
        }

        let records = drain(sorter.finish().unwrap());
        assert_eq!(names(&records), vec!["first", "second", "third", "fourth"]);
    }

    #[test]
    fn test_queryname_sort() {
        let mut sorter = ExternalSorter::<QuerynameKey>::new().spill_threshold_bytes(128);
        for name in ["read10", "read2", "read1", "read11"] {
            sorter.push(mapped(name, 0, 1)).unwrap();
        }

        let sorted: Vec<String> = sorter
            .finish()
            .unwrap()
            .map(|r| r.unwrap().name().to_string())
            .collect();
        assert_eq!(sorted, vec!["read1", "read2", "read10", "read11"]);
    }

    #[test]
    fn test_temp_files_removed_after_merge() {
        let base = tempfile::tempdir().unwrap();

        let mut sorter = ExternalSorter::<CoordinateKey>::new()
            .spill_threshold_bytes(1)
            .temp_dir(base.path().to_path_buf());
        for i in 0..50 {
            sorter.push(mapped(&format!("r{i}"), 0, i)).unwrap();
        }

        let sorted = sorter.finish().unwrap();
        assert!(sorted.runs_spilled() > 0);
        let records = drain(sorted);
        assert_eq!(records.len(), 50);

        // The per-sort temp directory under the base is gone.
        assert_eq!(fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_temp_files_removed_on_early_drop() {
        let base = tempfile::tempdir().unwrap();

        let mut sorter = ExternalSorter::<CoordinateKey>::new()
            .spill_threshold_bytes(1)
            .temp_dir(base.path().to_path_buf());
        for i in 0..50 {
            sorter.push(mapped(&format!("r{i}"), 0, i)).unwrap();
        }

        // Abandon the sorter without finishing.
        drop(sorter);
        assert_eq!(fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_spill_failure_is_storage_error_and_leaves_nothing() {
        let base = tempfile::tempdir().unwrap();
        let blocking_file = base.path().join("not_a_dir");
        fs::write(&blocking_file, b"x").unwrap();

        // Using a plain file as the temp base makes directory creation fail.
        let mut sorter = ExternalSorter::<CoordinateKey>::new()
            .spill_threshold_bytes(1)
            .temp_dir(blocking_file.clone());

        let err = sorter.push(mapped("r", 0, 1)).unwrap_err();
        assert!(matches!(err, FgsortError::Storage { .. }));

        // Nothing was created besides the blocking file itself.
        let entries: Vec<_> = fs::read_dir(base.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_empty_input() {
        let sorter = ExternalSorter::<CoordinateKey>::new();
        let records = drain(sorter.finish().unwrap());
        assert!(records.is_empty());
    }
}
