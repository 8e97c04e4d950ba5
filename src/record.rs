//! The decoded alignment record model consumed by the sorter and writer.
//!
//! Records are held as raw BAM-layout bytes and parsed lazily: only the
//! fields a consumer asks for are decoded, which keeps the sort hot path
//! from paying for full record decoding. The layout (all little-endian):
//!
//! ```text
//! 0..4    reference id (i32, -1 = none)
//! 4..8    0-based alignment start (i32, -1 = none)
//! 8       read name length including NUL (u8)
//! 9       mapping quality (u8)
//! 10..12  bin (u16)
//! 12..14  CIGAR operation count (u16)
//! 14..16  flags (u16)
//! 16..20  sequence length (u32)
//! 20..32  mate reference id, mate start, template length
//! 32..    read name, CIGAR ops, packed sequence, qualities, tags
//! ```
//!
//! On the wire (output stream and spill runs) each record is framed with a
//! 4-byte little-endian length prefix.

use crate::binning;
use crate::errors::{FgsortError, Result};
use bstr::BStr;
use std::io::{self, Read, Write};

/// Flag bit: segment is unmapped.
pub const FLAG_UNMAPPED: u16 = 0x4;

/// Flag bit: segment is reverse complemented.
pub const FLAG_REVERSE: u16 = 0x10;

/// Length of the fixed-size field block preceding the read name.
const FIXED_FIELDS_LEN: usize = 32;

/// A single alignment record backed by raw BAM-layout bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct AlignmentRecord {
    bytes: Vec<u8>,
}

impl AlignmentRecord {
    /// Wrap raw record bytes.
    ///
    /// # Errors
    /// Returns [`FgsortError::InvalidParameter`] if the buffer is too short
    /// to hold the fixed fields and the read name it declares.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < FIXED_FIELDS_LEN {
            return Err(FgsortError::InvalidParameter {
                parameter: "record".to_string(),
                reason: format!("{} bytes is shorter than the fixed fields", bytes.len()),
            });
        }

        let name_end = FIXED_FIELDS_LEN + bytes[8] as usize;
        if name_end > bytes.len() {
            return Err(FgsortError::InvalidParameter {
                parameter: "record".to_string(),
                reason: "declared read name overruns the record".to_string(),
            });
        }

        Ok(Self { bytes })
    }

    /// The raw record bytes (without the length prefix).
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn tid(&self) -> i32 {
        i32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    fn pos(&self) -> i32 {
        i32::from_le_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]])
    }

    /// Reference sequence id, or `None` for records with no reference.
    #[must_use]
    pub fn reference_sequence_id(&self) -> Option<usize> {
        let tid = self.tid();
        (tid >= 0).then_some(tid as usize)
    }

    /// 0-based alignment start, or `None` for records with no position.
    #[must_use]
    pub fn alignment_start(&self) -> Option<u32> {
        let pos = self.pos();
        (pos >= 0).then_some(pos as u32)
    }

    /// Exclusive 0-based alignment end.
    ///
    /// Computed from the reference-consuming CIGAR span; a record that
    /// consumes no reference bases still covers the single base at its
    /// start.
    #[must_use]
    pub fn alignment_end(&self) -> Option<u32> {
        self.alignment_start().map(|start| start + self.reference_length().max(1))
    }

    /// Flags field.
    #[must_use]
    pub fn flags(&self) -> u16 {
        u16::from_le_bytes([self.bytes[14], self.bytes[15]])
    }

    /// Whether the record is mapped (the unmapped flag is clear).
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.flags() & FLAG_UNMAPPED == 0
    }

    /// Whether the record is reverse complemented.
    #[must_use]
    pub fn is_reverse(&self) -> bool {
        self.flags() & FLAG_REVERSE != 0
    }

    /// Whether the record has a reference and a position.
    ///
    /// Unplaced records contribute only to the index's global unplaced
    /// counter; placed records are binned by coordinate.
    #[must_use]
    pub fn is_placed(&self) -> bool {
        self.tid() >= 0 && self.pos() >= 0
    }

    /// Read name without its NUL terminator.
    #[must_use]
    pub fn name(&self) -> &BStr {
        let len = (self.bytes[8] as usize).saturating_sub(1);
        BStr::new(&self.bytes[FIXED_FIELDS_LEN..FIXED_FIELDS_LEN + len])
    }

    /// Number of reference bases consumed by the CIGAR.
    ///
    /// Operations M, D, N, = and X consume the reference. CIGAR ops are read
    /// byte-by-byte so no alignment of the underlying buffer is assumed.
    #[must_use]
    pub fn reference_length(&self) -> u32 {
        let n_cigar_op = u16::from_le_bytes([self.bytes[12], self.bytes[13]]) as usize;
        if n_cigar_op == 0 {
            return 0;
        }

        let cigar_start = FIXED_FIELDS_LEN + self.bytes[8] as usize;
        let cigar_end = cigar_start + n_cigar_op * 4;
        if cigar_end > self.bytes.len() {
            return 0;
        }

        let mut length = 0u32;
        for i in 0..n_cigar_op {
            let offset = cigar_start + i * 4;
            let op = u32::from_le_bytes([
                self.bytes[offset],
                self.bytes[offset + 1],
                self.bytes[offset + 2],
                self.bytes[offset + 3],
            ]);

            let op_len = op >> 4;
            // M (0), D (2), N (3), = (7), X (8) consume reference bases
            if matches!(op & 0xf, 0 | 2 | 3 | 7 | 8) {
                length += op_len;
            }
        }

        length
    }

    /// Serialized size on the wire, including the 4-byte length prefix.
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        4 + self.bytes.len()
    }

    /// Write the record as a length-prefixed frame.
    pub fn write_framed<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let len = self.bytes.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&self.bytes)
    }

    /// Read one length-prefixed record frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream (no bytes available) and
    /// an `UnexpectedEof` error if the stream ends inside a frame.
    pub fn read_framed<R: Read>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut len_buf = [0u8; 4];
        if !read_exact_or_eof(reader, &mut len_buf)? {
            return Ok(None);
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;

        AlignmentRecord::from_bytes(bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

impl std::fmt::Debug for AlignmentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignmentRecord")
            .field("name", &self.name())
            .field("reference_sequence_id", &self.reference_sequence_id())
            .field("alignment_start", &self.alignment_start())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Fill `buf` from `reader`, distinguishing a clean EOF before the first
/// byte (`Ok(false)`) from a truncation mid-buffer (`UnexpectedEof`).
pub(crate) fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a record frame",
            ));
        }
        filled += n;
    }
    Ok(true)
}

/// Builder for structurally valid alignment records.
///
/// Produces minimal records with a single match CIGAR operation covering the
/// read length. Intended for tests, examples and synthetic inputs.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    name: String,
    reference_sequence_id: i32,
    alignment_start: i32,
    mapping_quality: u8,
    flags: u16,
    read_length: usize,
}

impl Default for RecordBuilder {
    fn default() -> Self {
        Self {
            name: "read1".to_string(),
            reference_sequence_id: -1,
            alignment_start: -1,
            mapping_quality: 60,
            flags: 0,
            read_length: 10,
        }
    }
}

impl RecordBuilder {
    /// Create a builder with defaults (an unplaced, mapped-flagged record).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read name.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the reference sequence id.
    #[must_use]
    pub fn reference_sequence_id(mut self, id: i32) -> Self {
        self.reference_sequence_id = id;
        self
    }

    /// Set the 0-based alignment start.
    #[must_use]
    pub fn alignment_start(mut self, start: i32) -> Self {
        self.alignment_start = start;
        self
    }

    /// Set the mapping quality.
    #[must_use]
    pub fn mapping_quality(mut self, mapq: u8) -> Self {
        self.mapping_quality = mapq;
        self
    }

    /// Mark the record unmapped.
    #[must_use]
    pub fn unmapped(mut self) -> Self {
        self.flags |= FLAG_UNMAPPED;
        self
    }

    /// Mark the record reverse complemented.
    #[must_use]
    pub fn reverse(mut self) -> Self {
        self.flags |= FLAG_REVERSE;
        self
    }

    /// Set the flags field outright.
    #[must_use]
    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    /// Set the read length (drives the CIGAR span and sequence).
    #[must_use]
    pub fn read_length(mut self, length: usize) -> Self {
        self.read_length = length;
        self
    }

    /// Build the record bytes.
    #[must_use]
    pub fn build(self) -> AlignmentRecord {
        let has_coordinates = self.reference_sequence_id >= 0 && self.alignment_start >= 0;
        let has_cigar =
            has_coordinates && self.flags & FLAG_UNMAPPED == 0 && self.read_length > 0;
        let n_cigar_op: u16 = u16::from(has_cigar);

        // Pad the name so the CIGAR lands on a 4-byte boundary.
        let name_with_nul = self.name.len() + 1;
        let padding = (4 - name_with_nul % 4) % 4;
        let l_read_name = (name_with_nul + padding) as u8;

        let bin = if has_coordinates {
            let start = self.alignment_start as u32;
            let span = if has_cigar { self.read_length as u32 } else { 1 };
            binning::bin_for(start, start + span) as u16
        } else {
            0
        };

        let l_seq = self.read_length as u32;

        let mut bytes = Vec::with_capacity(
            FIXED_FIELDS_LEN
                + l_read_name as usize
                + n_cigar_op as usize * 4
                + l_seq.div_ceil(2) as usize
                + l_seq as usize,
        );

        bytes.extend_from_slice(&self.reference_sequence_id.to_le_bytes());
        bytes.extend_from_slice(&self.alignment_start.to_le_bytes());
        bytes.push(l_read_name);
        bytes.push(self.mapping_quality);
        bytes.extend_from_slice(&bin.to_le_bytes());
        bytes.extend_from_slice(&n_cigar_op.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&l_seq.to_le_bytes());
        bytes.extend_from_slice(&(-1i32).to_le_bytes()); // mate reference id
        bytes.extend_from_slice(&(-1i32).to_le_bytes()); // mate start
        bytes.extend_from_slice(&0i32.to_le_bytes()); // template length

        bytes.extend_from_slice(self.name.as_bytes());
        bytes.push(0);
        bytes.extend(std::iter::repeat_n(0u8, padding));

        if has_cigar {
            let op = (self.read_length as u32) << 4; // <length>M
            bytes.extend_from_slice(&op.to_le_bytes());
        }

        // Packed sequence (all A) and qualities.
        bytes.extend(std::iter::repeat_n(0x11u8, l_seq.div_ceil(2) as usize));
        bytes.extend(std::iter::repeat_n(30u8, l_seq as usize));

        AlignmentRecord { bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_mapped_record() {
        let record = RecordBuilder::new()
            .name("q1")
            .reference_sequence_id(2)
            .alignment_start(1234)
            .read_length(50)
            .build();

        assert_eq!(record.name(), "q1");
        assert_eq!(record.reference_sequence_id(), Some(2));
        assert_eq!(record.alignment_start(), Some(1234));
        assert_eq!(record.reference_length(), 50);
        assert_eq!(record.alignment_end(), Some(1284));
        assert!(record.is_mapped());
        assert!(record.is_placed());
    }

    #[test]
    fn test_builder_unplaced_record() {
        let record = RecordBuilder::new().name("q2").unmapped().build();

        assert_eq!(record.reference_sequence_id(), None);
        assert_eq!(record.alignment_start(), None);
        assert!(!record.is_mapped());
        assert!(!record.is_placed());
        assert_eq!(record.reference_length(), 0);
    }

    #[test]
    fn test_placed_unmapped_record() {
        let record = RecordBuilder::new()
            .reference_sequence_id(0)
            .alignment_start(100)
            .unmapped()
            .build();

        assert!(record.is_placed());
        assert!(!record.is_mapped());
        // No CIGAR, so the record still covers a single base.
        assert_eq!(record.alignment_end(), Some(101));
    }

    #[test]
    fn test_reverse_flag() {
        let record = RecordBuilder::new()
            .reference_sequence_id(0)
            .alignment_start(5)
            .reverse()
            .build();
        assert!(record.is_reverse());
    }

    #[test]
    fn test_framed_round_trip() {
        let record =
            RecordBuilder::new().name("frame").reference_sequence_id(1).alignment_start(7).build();

        let mut buf = Vec::new();
        record.write_framed(&mut buf).unwrap();
        assert_eq!(buf.len(), record.serialized_len());

        let mut cursor = std::io::Cursor::new(buf);
        let read = AlignmentRecord::read_framed(&mut cursor).unwrap().unwrap();
        assert_eq!(read, record);

        // Stream is exhausted afterwards.
        assert!(AlignmentRecord::read_framed(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_read_framed_truncated() {
        let record = RecordBuilder::new().build();
        let mut buf = Vec::new();
        record.write_framed(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);

        let mut cursor = std::io::Cursor::new(buf);
        let err = AlignmentRecord::read_framed(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_from_bytes_too_short() {
        assert!(AlignmentRecord::from_bytes(vec![0u8; 16]).is_err());
    }

    #[test]
    fn test_from_bytes_name_overrun() {
        let mut bytes = vec![0u8; FIXED_FIELDS_LEN];
        bytes[8] = 200; // declares a name longer than the buffer
        assert!(AlignmentRecord::from_bytes(bytes).is_err());
    }
}
