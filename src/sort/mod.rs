//! Bounded-memory sorting of alignment record streams.
//!
//! Sorting follows the classic external merge-sort pipeline:
//!
//! 1. **Accumulate**: buffer records and their extracted sort keys
//! 2. **Sort**: order the buffered run in memory
//! 3. **Spill**: hand full runs to a background worker that writes them to
//!    compressed temp files
//! 4. **Merge**: k-way merge of all runs through a min-heap
//!
//! Keys are extracted once per record (see [`keys`]) so the merge never
//! re-parses record bytes, and every key ends with the record's input
//! ordinal so equal keys preserve input order.

pub mod external;
pub mod keys;

pub use external::{ExternalSorter, SortedRecords};
pub use keys::{CoordinateKey, QuerynameKey, SortKey, SortOrder};
