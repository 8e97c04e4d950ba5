//! Loading a serialized index back into the in-memory model.
//!
//! Validation is strict: wrong magic bytes, negative counts, a malformed
//! metadata pseudo-bin or a stream that ends mid-structure all fail with
//! [`FgsortError::CorruptIndex`]. Readers never attempt to repair a bad
//! index.

use super::{BAI_MAGIC, BamIndex, Chunk, LinearIndex, Metadata, ReferenceIndex};
use crate::binning::METADATA_BIN;
use crate::errors::{FgsortError, Result};
use crate::virtual_offset::VirtualOffset;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

impl BamIndex {
    /// Load an index from a file.
    ///
    /// # Errors
    /// [`FgsortError::Storage`] if the file cannot be opened;
    /// [`FgsortError::CorruptIndex`] if its contents fail validation.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            FgsortError::storage(format!("opening index file {}", path.display()), e)
        })?;
        read_index(&mut BufReader::new(file))
    }
}

/// Parse an index from a byte stream.
///
/// # Errors
/// [`FgsortError::CorruptIndex`] on bad magic, inconsistent counts or a
/// truncated stream.
pub fn read_index<R: Read>(reader: &mut R) -> Result<BamIndex> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| map_read_error(e, "reading magic bytes"))?;
    if &magic != BAI_MAGIC {
        return Err(FgsortError::corrupt(format!(
            "bad magic bytes: expected {BAI_MAGIC:?}, got {magic:?}"
        )));
    }

    let n_ref = read_i32(reader, "reference count")?;
    if n_ref < 0 {
        return Err(FgsortError::corrupt(format!("negative reference count: {n_ref}")));
    }

    let mut references = Vec::with_capacity(n_ref as usize);
    for reference_id in 0..n_ref {
        references.push(read_reference(reader, reference_id)?);
    }

    // The trailing unplaced count is optional.
    let mut tail = [0u8; 8];
    let unplaced = match crate::record::read_exact_or_eof(reader, &mut tail) {
        Ok(true) => Some(u64::from_le_bytes(tail)),
        Ok(false) => None,
        Err(e) => return Err(map_read_error(e, "reading unplaced record count")),
    };

    Ok(BamIndex::new(references, unplaced))
}

fn read_reference<R: Read>(reader: &mut R, reference_id: i32) -> Result<ReferenceIndex> {
    let n_bin = read_i32(reader, "bin count")?;
    if n_bin < 0 {
        return Err(FgsortError::corrupt(format!(
            "negative bin count {n_bin} for reference {reference_id}"
        )));
    }

    let mut bins: BTreeMap<u32, Vec<Chunk>> = BTreeMap::new();
    let mut metadata = None;

    for _ in 0..n_bin {
        let bin_id = read_u32(reader, "bin id")?;
        let n_chunk = read_i32(reader, "chunk count")?;
        if n_chunk < 0 {
            return Err(FgsortError::corrupt(format!(
                "negative chunk count {n_chunk} in bin {bin_id}"
            )));
        }

        if bin_id == METADATA_BIN {
            metadata = Some(read_metadata(reader, reference_id, n_chunk)?);
            continue;
        }

        let mut chunks = Vec::with_capacity(n_chunk as usize);
        for _ in 0..n_chunk {
            let begin = VirtualOffset::from_raw(read_u64(reader, "chunk begin")?);
            let end = VirtualOffset::from_raw(read_u64(reader, "chunk end")?);
            if end < begin {
                return Err(FgsortError::corrupt(format!(
                    "chunk in bin {bin_id} ends before it begins ({end} < {begin})",
                    end = end.as_raw(),
                    begin = begin.as_raw()
                )));
            }
            chunks.push(Chunk::new(begin, end));
        }
        bins.insert(bin_id, chunks);
    }

    let n_intv = read_i32(reader, "linear index size")?;
    if n_intv < 0 {
        return Err(FgsortError::corrupt(format!(
            "negative linear index size {n_intv} for reference {reference_id}"
        )));
    }

    let mut offsets = Vec::with_capacity(n_intv as usize);
    for _ in 0..n_intv {
        offsets.push(VirtualOffset::from_raw(read_u64(reader, "linear index offset")?));
    }

    Ok(ReferenceIndex::new(bins, LinearIndex::from_offsets(offsets), metadata))
}

fn read_metadata<R: Read>(reader: &mut R, reference_id: i32, n_chunk: i32) -> Result<Metadata> {
    if n_chunk != 2 {
        return Err(FgsortError::corrupt(format!(
            "metadata pseudo-bin of reference {reference_id} has {n_chunk} chunks, expected 2"
        )));
    }

    let first_offset = VirtualOffset::from_raw(read_u64(reader, "metadata first offset")?);
    let last_offset = VirtualOffset::from_raw(read_u64(reader, "metadata last offset")?);
    let mapped = read_u64(reader, "metadata mapped count")?;
    let unmapped = read_u64(reader, "metadata unmapped count")?;

    Ok(Metadata { mapped, unmapped, first_offset, last_offset })
}

fn map_read_error(error: io::Error, context: &str) -> FgsortError {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        FgsortError::corrupt(format!("truncated stream while {context}"))
    } else {
        FgsortError::storage(context.to_string(), error)
    }
}

fn read_i32<R: Read>(reader: &mut R, context: &str) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(|e| map_read_error(e, context))?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R, context: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(|e| map_read_error(e, context))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R, context: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).map_err(|e| map_read_error(e, context))?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::accumulator::{IndexAccumulator, RecordContext};
    use crate::index::write::write_index;

    fn sample_index() -> BamIndex {
        let mut accumulator = IndexAccumulator::new(2);
        accumulator
            .record(
                Some(RecordContext { reference_id: 0, start: 100, end: 150, is_mapped: true }),
                Chunk::new(VirtualOffset::from_raw(100), VirtualOffset::from_raw(200)),
            )
            .unwrap();
        accumulator
            .record(
                Some(RecordContext { reference_id: 1, start: 70_000, end: 70_100, is_mapped: true }),
                Chunk::new(VirtualOffset::from_raw(200), VirtualOffset::from_raw(300)),
            )
            .unwrap();
        accumulator.record(None, Chunk::new(VirtualOffset::from_raw(300), VirtualOffset::from_raw(400))).unwrap();
        accumulator.seal().unwrap();
        accumulator.build(true).unwrap()
    }

    #[test]
    fn test_round_trip_reproduces_index() {
        let index = sample_index();
        let mut buf = Vec::new();
        write_index(&mut buf, &index).unwrap();

        let read = read_index(&mut buf.as_slice()).unwrap();
        assert_eq!(read, index);
    }

    #[test]
    fn test_bad_magic() {
        let err = read_index(&mut &b"XYZ\x01\x00\x00\x00\x00"[..]).unwrap_err();
        assert!(matches!(err, FgsortError::CorruptIndex { .. }));
        assert!(format!("{err}").contains("magic"));
    }

    #[test]
    fn test_truncated_stream() {
        let index = sample_index();
        let mut buf = Vec::new();
        write_index(&mut buf, &index).unwrap();
        buf.truncate(buf.len() / 2);

        let err = read_index(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, FgsortError::CorruptIndex { .. }));
    }

    #[test]
    fn test_negative_reference_count() {
        let mut buf = Vec::new();
        buf.extend_from_slice(BAI_MAGIC);
        buf.extend_from_slice(&(-1i32).to_le_bytes());

        let err = read_index(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, FgsortError::CorruptIndex { .. }));
    }

    #[test]
    fn test_missing_trailing_count_is_accepted() {
        let index = sample_index();
        let mut buf = Vec::new();
        write_index(&mut buf, &index).unwrap();
        buf.truncate(buf.len() - 8);

        let read = read_index(&mut buf.as_slice()).unwrap();
        assert_eq!(read.unplaced(), None);
        assert_eq!(read.references(), index.references());
    }

    #[test]
    fn test_inverted_chunk_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(BAI_MAGIC);
        buf.extend_from_slice(&1i32.to_le_bytes()); // n_ref
        buf.extend_from_slice(&1i32.to_le_bytes()); // n_bin
        buf.extend_from_slice(&4681u32.to_le_bytes()); // bin id
        buf.extend_from_slice(&1i32.to_le_bytes()); // n_chunk
        buf.extend_from_slice(&500u64.to_le_bytes()); // begin
        buf.extend_from_slice(&100u64.to_le_bytes()); // end < begin
        buf.extend_from_slice(&0i32.to_le_bytes()); // n_intv

        let err = read_index(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, FgsortError::CorruptIndex { .. }));
    }
}
