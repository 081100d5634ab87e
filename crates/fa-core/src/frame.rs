//! FA frame and sample layouts.
//!
//! An FA frame is a fixed 2048-byte record carrying one (x, y) position pair
//! for each of 256 beam position monitors.  The layouts here are `#[repr(C)]`
//! because the same structures are written to and read back from the archive
//! file in native byte order.

/// Number of BPM entries in one FA frame.
pub const FA_ENTRY_COUNT: usize = 256;

/// Size in bytes of a single (x, y) entry.
pub const FA_ENTRY_SIZE: usize = std::mem::size_of::<FaEntry>();

/// Size in bytes of a complete FA frame.
pub const FA_FRAME_SIZE: usize = FA_ENTRY_COUNT * FA_ENTRY_SIZE;

/// A single (x, y) position reading for one BPM, in nanometres.
///
/// The x field of BPM id 0 carries a monotonic counter rather than a
/// position; it is used as a secondary sequence marker (`id_zero`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct FaEntry {
    pub x: i32,
    pub y: i32,
}

const _: () = assert!(std::mem::size_of::<FaEntry>() == 8);

/// Summary of a run of consecutive samples: mean, min, max and standard
/// deviation per axis.  Stored in the archive for both decimation stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DecimatedSample {
    pub mean: FaEntry,
    pub min: FaEntry,
    pub max: FaEntry,
    pub std: FaEntry,
}

/// Size in bytes of a decimated sample on disk.
pub const DECIMATED_SIZE: usize = std::mem::size_of::<DecimatedSample>();

const _: () = assert!(std::mem::size_of::<DecimatedSample>() == 32);

/// Views a raw capture buffer as a slice of FA entries.
///
/// The buffer length must be a multiple of [`FA_ENTRY_SIZE`]; slot buffers
/// and read buffers are always allocated in whole frames so this holds by
/// construction.
#[allow(unsafe_code)]
pub fn entries_of(bytes: &[u8]) -> &[FaEntry] {
    debug_assert_eq!(bytes.len() % FA_ENTRY_SIZE, 0);
    debug_assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<FaEntry>(), 0);
    // SAFETY: FaEntry is repr(C) with no padding and alignment 4; capture
    // buffers are page aligned, so the pointer is adequately aligned and the
    // length is a whole number of entries.
    unsafe {
        std::slice::from_raw_parts(bytes.as_ptr().cast::<FaEntry>(), bytes.len() / FA_ENTRY_SIZE)
    }
}

/// Views a buffer of decimated samples as raw bytes, for wire transfer.
#[allow(unsafe_code)]
pub fn decimated_bytes(samples: &[DecimatedSample]) -> &[u8] {
    // SAFETY: DecimatedSample is repr(C) with no padding; any byte view of
    // it is valid.
    unsafe {
        std::slice::from_raw_parts(
            samples.as_ptr().cast::<u8>(),
            samples.len() * DECIMATED_SIZE,
        )
    }
}

/// Views a raw buffer as decimated samples.
#[allow(unsafe_code)]
pub fn decimated_of(bytes: &[u8]) -> &[DecimatedSample] {
    debug_assert_eq!(bytes.len() % DECIMATED_SIZE, 0);
    debug_assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<DecimatedSample>(), 0);
    // SAFETY: length checked to be a whole number of samples and the pointer
    // alignment asserted above; all bit patterns are valid for the type.
    unsafe {
        std::slice::from_raw_parts(
            bytes.as_ptr().cast::<DecimatedSample>(),
            bytes.len() / DECIMATED_SIZE,
        )
    }
}

/// Views a slice of FA entries as raw bytes.
#[allow(unsafe_code)]
pub fn entry_bytes(entries: &[FaEntry]) -> &[u8] {
    // SAFETY: FaEntry is repr(C) with no padding.
    unsafe {
        std::slice::from_raw_parts(entries.as_ptr().cast::<u8>(), entries.len() * FA_ENTRY_SIZE)
    }
}
