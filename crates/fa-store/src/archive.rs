//! Archive file access.
//!
//! [`Archive`] owns the archive file, the exclusive header lock that keeps a
//! second archiver off the same file, an O_DIRECT handle for major-block
//! transfers and a writable mapping of the header, index and DD regions.
//! All mutable archive state is reached through [`Archive::lock`], which
//! serialises the transform thread against concurrent readers.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use fa_core::frame::DecimatedSample;
use fa_core::{FaError, Result};

use crate::header::{DiskHeader, HeaderParams, IndexRecord, HEADER_SIZE, INDEX_RECORD_SIZE};

/// An open archive file.
pub struct Archive {
    path: PathBuf,
    /// Holds the fcntl lock and backs the mapping.
    _file: File,
    /// Handle used for major-block reads and writes, opened with O_DIRECT
    /// where the filesystem supports it.
    data_file: File,
    map: MmapMut,
    /// Base of the mapping; the live header sits at offset zero.
    base: *mut u8,
    /// Geometry snapshot taken at open.  The layout fields never change
    /// while the archive is open; the bookkeeping fields
    /// (`current_major_block` and friends) are stale here and must be read
    /// through [`Archive::lock`].
    geometry: DiskHeader,
    state: Mutex<()>,
}

// SAFETY: the raw base pointer aliases the mapping, which lives exactly as
// long as the Archive; every access to the mutable regions behind it goes
// through the state mutex via ArchiveGuard.
#[allow(unsafe_code)]
unsafe impl Send for Archive {}
#[allow(unsafe_code)]
unsafe impl Sync for Archive {}

impl Archive {
    /// Creates and preallocates a fresh archive file.  Returns the header
    /// written, so callers can report the fitted geometry.
    pub fn create(path: &Path, params: &HeaderParams) -> Result<DiskHeader> {
        let header = DiskHeader::initialise(params)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(params.file_size)?;
        let mut page = vec![0u8; HEADER_SIZE];
        page[..header_bytes(&header).len()].copy_from_slice(header_bytes(&header));
        file.write_all_at(&page, 0)?;
        file.sync_all()?;
        info!(path = %path.display(), blocks = header.major_block_count, "archive created");
        Ok(header)
    }

    /// Opens an existing archive for capture and serving.
    pub fn open(path: &Path) -> Result<Archive> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        lock_header(&file, path)?;

        let file_size = file.metadata()?.len();
        let geometry = read_header(&file)?;
        geometry.validate(file_size)?;

        let data_file = open_direct(path)?;

        // SAFETY: the mapping covers the header, index and DD regions of a
        // file we hold open and locked.
        #[allow(unsafe_code)]
        let mut map = unsafe {
            MmapOptions::new()
                .len(geometry.major_data_start as usize)
                .map_mut(&file)?
        };
        let base = map.as_mut_ptr();

        info!(path = %path.display(), "archive opened\n{geometry}");
        Ok(Archive {
            path: path.to_path_buf(),
            _file: file,
            data_file,
            map,
            base,
            geometry,
            state: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archive geometry as of open.  Layout fields are authoritative; for
    /// the live bookkeeping fields take [`Archive::lock`].
    pub fn geometry(&self) -> &DiskHeader {
        &self.geometry
    }

    /// Acquires the archive state lock.
    pub fn lock(&self) -> ArchiveGuard<'_> {
        ArchiveGuard {
            archive: self,
            _guard: self.state.lock(),
        }
    }

    /// Reads `buf.len()` bytes of major-block data at the given file offset.
    /// With direct I/O in effect the buffer, offset and length must all be
    /// page aligned.
    pub fn read_block(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.data_file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Writes major-block data at the given file offset, same alignment
    /// rules as [`Archive::read_block`].
    pub fn write_block(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.data_file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Flushes the mapped header, index and DD regions to disk.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

/// Exclusive access to the mutable archive state: the live header, the data
/// index and the DD sample array.
pub struct ArchiveGuard<'a> {
    archive: &'a Archive,
    _guard: MutexGuard<'a, ()>,
}

#[allow(unsafe_code)]
impl ArchiveGuard<'_> {
    pub fn header(&self) -> &DiskHeader {
        // SAFETY: base points at the mapped header; the state lock is held.
        unsafe { &*self.archive.base.cast::<DiskHeader>() }
    }

    pub fn header_mut(&mut self) -> &mut DiskHeader {
        // SAFETY: as header(), with exclusive access through &mut self.
        unsafe { &mut *self.archive.base.cast::<DiskHeader>() }
    }

    pub fn index(&self) -> &[IndexRecord] {
        let geometry = &self.archive.geometry;
        // SAFETY: the index region lies inside the mapping and holds
        // major_block_count records; the state lock is held.
        unsafe {
            std::slice::from_raw_parts(
                self.archive
                    .base
                    .add(geometry.index_data_start as usize)
                    .cast::<IndexRecord>(),
                geometry.major_block_count as usize,
            )
        }
    }

    pub fn index_mut(&mut self) -> &mut [IndexRecord] {
        let geometry = &self.archive.geometry;
        // SAFETY: as index(), with exclusive access through &mut self.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.archive
                    .base
                    .add(geometry.index_data_start as usize)
                    .cast::<IndexRecord>(),
                geometry.major_block_count as usize,
            )
        }
    }

    pub fn dd(&self) -> &[DecimatedSample] {
        let geometry = &self.archive.geometry;
        // SAFETY: the DD region lies inside the mapping and holds
        // dd_array_len() samples; the state lock is held.
        unsafe {
            std::slice::from_raw_parts(
                self.archive
                    .base
                    .add(geometry.dd_data_start as usize)
                    .cast::<DecimatedSample>(),
                geometry.dd_array_len(),
            )
        }
    }

    pub fn dd_mut(&mut self) -> &mut [DecimatedSample] {
        let geometry = &self.archive.geometry;
        // SAFETY: as dd(), with exclusive access through &mut self.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.archive
                    .base
                    .add(geometry.dd_data_start as usize)
                    .cast::<DecimatedSample>(),
                geometry.dd_array_len(),
            )
        }
    }
}

/// Takes an exclusive write lock on the header region.  A second archiver
/// process opening the same file fails here instead of corrupting it.
#[allow(unsafe_code)]
fn lock_header(file: &File, path: &Path) -> Result<()> {
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_WRLCK as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = 0;
    lock.l_len = HEADER_SIZE as libc::off_t;
    // SAFETY: fd is valid for the lifetime of the call; flock is fully
    // initialised above.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) };
    if rc == -1 {
        Err(FaError::ArchiveLocked {
            path: path.display().to_string(),
        })
    } else {
        Ok(())
    }
}

/// Opens the data handle with O_DIRECT, falling back to buffered I/O on
/// filesystems that refuse it (tmpfs in particular).
fn open_direct(path: &Path) -> Result<File> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
    {
        Ok(file) => Ok(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "O_DIRECT unavailable, using buffered I/O");
            Ok(OpenOptions::new().read(true).write(true).open(path)?)
        }
    }
}

fn read_header(file: &File) -> Result<DiskHeader> {
    let mut bytes = [0u8; std::mem::size_of::<DiskHeader>()];
    file.read_exact_at(&mut bytes, 0)?;
    // SAFETY: DiskHeader is repr(C) without implicit padding and every bit
    // pattern is a valid value of its fields; validate() vets the contents.
    #[allow(unsafe_code)]
    let header = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<DiskHeader>()) };
    Ok(header)
}

#[allow(unsafe_code)]
fn header_bytes(header: &DiskHeader) -> &[u8] {
    // SAFETY: DiskHeader is repr(C) with its tail padding made explicit, so
    // every byte is initialised.
    unsafe {
        std::slice::from_raw_parts(
            (header as *const DiskHeader).cast::<u8>(),
            std::mem::size_of::<DiskHeader>(),
        )
    }
}

// Keep the record size assertion close to the code that maps the region.
const _: () = assert!(INDEX_RECORD_SIZE == std::mem::size_of::<IndexRecord>());
