//! Disk writer thread.
//!
//! Major blocks are written by a dedicated thread with a single request
//! slot.  [`DiskWriter::schedule_write`] blocks while the writer is busy, so
//! the transform thread can never queue more than one block behind an
//! in-progress write, and hands back the buffer of the completed transfer
//! for reuse; [`DiskWriter::await_read_interlock`] lets historical readers
//! wait for the disk to go quiet before issuing their own transfers.  A
//! failed write means the archive file is no longer usable and aborts the
//! process.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::aligned::AlignedBuf;
use crate::archive::Archive;

struct WriteRequest {
    offset: u64,
    length: usize,
    buffer: AlignedBuf,
}

struct State {
    pending: Option<WriteRequest>,
    /// Set while the writer thread is transferring a taken request.
    writing: bool,
    /// Buffer of the last completed transfer, awaiting reclaim.
    finished: Option<AlignedBuf>,
    running: bool,
}

impl State {
    fn busy(&self) -> bool {
        self.pending.is_some() || self.writing
    }
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// Handle to the disk writer thread.
pub struct DiskWriter {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DiskWriter {
    /// Starts the writer thread against an open archive.
    pub fn start(archive: Arc<Archive>) -> fa_core::Result<DiskWriter> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                pending: None,
                writing: false,
                finished: None,
                running: true,
            }),
            cond: Condvar::new(),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("disk-writer".to_string())
                .spawn(move || writer_loop(&shared, &archive))?
        };
        Ok(DiskWriter {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Hands a filled block to the writer.  Blocks while a previous write is
    /// still in progress, which is the only backpressure the transform
    /// thread ever experiences from the disk.  Returns the buffer of the
    /// previously completed write, if one is waiting to be reclaimed.
    pub fn schedule_write(
        &self,
        offset: u64,
        length: usize,
        buffer: AlignedBuf,
    ) -> Option<AlignedBuf> {
        let mut state = self.shared.state.lock();
        while state.busy() {
            self.shared.cond.wait(&mut state);
        }
        state.pending = Some(WriteRequest {
            offset,
            length,
            buffer,
        });
        let reclaimed = state.finished.take();
        self.shared.cond.notify_all();
        reclaimed
    }

    /// Waits until no write is in flight.  Readers call this before reading
    /// major-block data so a read never overlaps the block being rewritten.
    pub fn await_read_interlock(&self) {
        let mut state = self.shared.state.lock();
        while state.busy() {
            self.shared.cond.wait(&mut state);
        }
    }

    /// True while a write is pending or in progress.
    pub fn is_busy(&self) -> bool {
        self.shared.state.lock().busy()
    }

    /// Drains any pending write and stops the thread.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn writer_loop(shared: &Shared, archive: &Archive) {
    loop {
        let request = {
            let mut state = shared.state.lock();
            loop {
                if let Some(request) = state.pending.take() {
                    state.writing = true;
                    break request;
                }
                if !state.running {
                    return;
                }
                shared.cond.wait(&mut state);
            }
        };

        // The busy flag stays set during the transfer so that the read
        // interlock covers the whole write.
        if let Err(e) = archive.write_block(request.offset, &request.buffer[..request.length]) {
            error!(offset = request.offset, error = %e, "archive write failed");
            std::process::abort();
        }
        debug!(offset = request.offset, length = request.length, "block written");

        {
            let mut guard = archive.lock();
            guard.header_mut().write_buffer = 0;
        }
        let mut state = shared.state.lock();
        state.writing = false;
        state.finished = Some(request.buffer);
        shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use crate::header::tests::small_params;

    fn open_test_archive(dir: &tempfile::TempDir) -> Arc<Archive> {
        let path = dir.path().join("archive.fa");
        Archive::create(&path, &small_params()).unwrap();
        Arc::new(Archive::open(&path).unwrap())
    }

    #[test]
    fn scheduled_write_reaches_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_test_archive(&dir);
        let block_size = archive.geometry().major_block_size as usize;

        let mut buffer = AlignedBuf::zeroed(block_size);
        buffer[..4].copy_from_slice(&0xdeadbeef_u32.to_ne_bytes());
        let offset = archive.geometry().major_data_offset(2);

        let writer = DiskWriter::start(Arc::clone(&archive)).unwrap();
        assert!(writer.schedule_write(offset, block_size, buffer).is_none());
        writer.await_read_interlock();
        assert!(!writer.is_busy());
        writer.shutdown();

        let mut back = AlignedBuf::zeroed(block_size);
        archive.read_block(offset, &mut back).unwrap();
        assert_eq!(&back[..4], &0xdeadbeef_u32.to_ne_bytes());
    }

    #[test]
    fn second_write_reclaims_first_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_test_archive(&dir);
        let block_size = archive.geometry().major_block_size as usize;
        let writer = DiskWriter::start(Arc::clone(&archive)).unwrap();

        let first = AlignedBuf::zeroed(block_size);
        let marker = first.as_ptr();
        assert!(writer
            .schedule_write(archive.geometry().major_data_offset(0), block_size, first)
            .is_none());
        let reclaimed = writer.schedule_write(
            archive.geometry().major_data_offset(1),
            block_size,
            AlignedBuf::zeroed(block_size),
        );
        assert_eq!(reclaimed.map(|b| b.as_ptr()), Some(marker));
        writer.shutdown();
    }

    #[test]
    fn shutdown_drains_pending_write() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_test_archive(&dir);
        let block_size = archive.geometry().major_block_size as usize;
        let offset = archive.geometry().major_data_offset(0);

        let writer = DiskWriter::start(Arc::clone(&archive)).unwrap();
        let mut buffer = AlignedBuf::zeroed(block_size);
        buffer[7] = 9;
        writer.schedule_write(offset, block_size, buffer);
        writer.shutdown();

        let mut back = AlignedBuf::zeroed(block_size);
        archive.read_block(offset, &mut back).unwrap();
        assert_eq!(back[7], 9);
    }
}
