//! On-disk circular archive.
//!
//! The archive is a single preallocated file: a 4096-byte header page,
//! a memory-mapped data index and double-decimated (DD) region, and the
//! round-robin major-block area written with direct I/O.  [`Archive`] owns
//! the file, its mappings and the state lock; [`writer::DiskWriter`] runs
//! the single-slot write thread; [`lookup`] maps timestamps to archive
//! offsets.

pub mod aligned;
pub mod archive;
pub mod header;
pub mod lookup;
pub mod writer;

pub use aligned::AlignedBuf;
pub use archive::{Archive, ArchiveGuard};
pub use header::{DiskHeader, HeaderParams, IndexRecord, HEADER_SIZE};
pub use lookup::{locate_in_index, locate_timestamp, MajorLocation};
pub use writer::DiskWriter;
