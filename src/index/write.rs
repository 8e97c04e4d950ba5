//! Serialization of a [`BamIndex`] to the binary index format.
//!
//! The layout is the classic little-endian BAI convention: magic, a signed
//! reference count, then per reference the binning index (bin id, chunk
//! count, chunk offset pairs), the linear index, and finally an optional
//! trailing count of unplaced records. Per-reference metadata is carried by
//! the reserved pseudo-bin as two chunk-shaped pairs: first/last offsets,
//! then mapped/unmapped counts.
//!
//! Serialization is deterministic: bins are written in ascending id order
//! (the in-memory map is ordered) with the metadata pseudo-bin last, so the
//! same index always produces the same bytes.

use super::{BAI_MAGIC, BamIndex, ReferenceIndex};
use crate::binning::METADATA_BIN;
use crate::errors::{FgsortError, Result};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Serialize an index to a byte sink.
///
/// # Errors
/// Returns [`FgsortError::Storage`] if writing fails.
pub fn write_index<W: Write>(writer: &mut W, index: &BamIndex) -> Result<()> {
    write_index_inner(writer, index)
        .map_err(|e| FgsortError::storage("serializing the index", e))
}

fn write_index_inner<W: Write>(writer: &mut W, index: &BamIndex) -> io::Result<()> {
    writer.write_all(BAI_MAGIC)?;
    write_i32(writer, index.references().len() as i32)?;

    for reference in index.references() {
        write_reference(writer, reference)?;
    }

    if let Some(unplaced) = index.unplaced() {
        writer.write_all(&unplaced.to_le_bytes())?;
    }

    writer.flush()
}

fn write_reference<W: Write>(writer: &mut W, reference: &ReferenceIndex) -> io::Result<()> {
    let n_bin = reference.bins().len() + usize::from(reference.metadata().is_some());
    write_i32(writer, n_bin as i32)?;

    for (bin_id, chunks) in reference.bins() {
        write_u32(writer, *bin_id)?;
        write_i32(writer, chunks.len() as i32)?;
        for chunk in chunks {
            writer.write_all(&chunk.begin().as_raw().to_le_bytes())?;
            writer.write_all(&chunk.end().as_raw().to_le_bytes())?;
        }
    }

    if let Some(metadata) = reference.metadata() {
        write_u32(writer, METADATA_BIN)?;
        write_i32(writer, 2)?;
        writer.write_all(&metadata.first_offset.as_raw().to_le_bytes())?;
        writer.write_all(&metadata.last_offset.as_raw().to_le_bytes())?;
        writer.write_all(&metadata.mapped.to_le_bytes())?;
        writer.write_all(&metadata.unmapped.to_le_bytes())?;
    }

    let offsets = reference.linear_index().offsets();
    write_i32(writer, offsets.len() as i32)?;
    for offset in offsets {
        writer.write_all(&offset.as_raw().to_le_bytes())?;
    }

    Ok(())
}

/// Write an index to a file.
///
/// A partially written file is removed before the error is surfaced, so a
/// failure never leaves a corrupt index behind as if it were complete.
///
/// # Errors
/// Returns [`FgsortError::Storage`] if the file cannot be created or
/// written.
pub fn write_index_file<P: AsRef<Path>>(path: P, index: &BamIndex) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)
        .map_err(|e| FgsortError::storage(format!("creating index file {}", path.display()), e))?;

    let mut writer = BufWriter::new(file);
    if let Err(e) = write_index(&mut writer, index) {
        drop(writer);
        let _ = std::fs::remove_file(path);
        return Err(e);
    }

    Ok(())
}

fn write_i32<W: Write>(writer: &mut W, value: i32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}
