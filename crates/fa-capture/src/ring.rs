//! In-RAM multi-reader ring buffer.
//!
//! The capture thread writes fixed-size input blocks into a circular set of
//! page-aligned slots; any number of readers follow behind.  Readers come in
//! two kinds.  A *reserved* reader (the transform) borrows slot data in
//! place and the writer backs off rather than overwrite a block the reader
//! has not consumed, so the transform never loses data.  Ordinary readers
//! (subscribers) copy blocks out under the ring lock and are simply lapped
//! when they fall a full ring behind: their cursor is reset to the head and
//! they observe a synthetic gap.
//!
//! Capture interruptions are recorded as gap blocks.  Consecutive gaps are
//! coalesced: committing a gap directly after another gap neither stamps nor
//! advances, so a dead source costs one slot, not the whole ring.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use fa_core::Timestamp;
use fa_store::AlignedBuf;

#[derive(Debug, Clone, Copy, Default)]
struct Stamp {
    timestamp: Timestamp,
    gap: bool,
}

struct ReaderSlot {
    /// Absolute position of the next block to read.
    read_pos: u64,
    reserved: bool,
    underflowed: bool,
    /// Largest queue depth in bytes seen at a commit since the last read.
    backlog_peak: usize,
}

struct State {
    /// Absolute count of committed blocks; the next commit fills slot
    /// `write_pos % count`.
    write_pos: u64,
    stamps: Vec<Stamp>,
    last_gap: bool,
    running: bool,
    readers: Vec<Option<ReaderSlot>>,
}

struct Inner {
    block_size: usize,
    count: u64,
    base: *mut u8,
    /// Keeps the slot allocation alive; all access goes through `base`.
    _buffer: AlignedBuf,
    state: Mutex<State>,
    cond: Condvar,
}

// SAFETY: slot data behind `base` is written only by the single RingWriter,
// and only to the slot at write_pos, which the back-off in block() and the
// window checks in the readers keep disjoint from every outstanding read.
// Copying readers touch slot data only under the state mutex.
#[allow(unsafe_code)]
unsafe impl Send for Inner {}
#[allow(unsafe_code)]
unsafe impl Sync for Inner {}

fn slot_mut(state: &mut State, slot: usize) -> &mut ReaderSlot {
    match state.readers[slot].as_mut() {
        Some(reader) => reader,
        None => unreachable!("reader {slot} deregistered while in use"),
    }
}

/// Shared handle to the ring, used to register readers.
#[derive(Clone)]
pub struct Ring {
    inner: Arc<Inner>,
}

/// The single producer side of the ring.
pub struct RingWriter {
    inner: Arc<Inner>,
}

/// A registered ring reader.  Dropping it deregisters the reader.
pub struct Reader {
    inner: Arc<Inner>,
    slot: usize,
}

/// Outcome of a copying read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A block was copied into the caller's buffer.  `backlog` is the peak
    /// queue depth in bytes since the previous read.
    Data { timestamp: Timestamp, backlog: usize },
    /// A capture gap, or the reader was lapped and reset to the head.
    Gap,
    /// The writer has shut down and no blocks remain.
    Stopped,
}

/// Outcome of a reserved in-place read.
pub enum ReservedOutcome<'a> {
    Data(ReadBlock<'a>),
    Gap,
    Stopped,
}

/// An in-place borrow of one committed block.  The slot is protected from
/// the writer until this is dropped.
pub struct ReadBlock<'a> {
    reader: &'a mut Reader,
    data: *const u8,
    len: usize,
    pub timestamp: Timestamp,
    /// Peak queue depth in bytes since the previous read.
    pub backlog: usize,
}

impl Ring {
    /// Allocates a ring of `block_count` page-aligned slots of `block_size`
    /// bytes.  At least two slots are required: one being filled and one
    /// being consumed.
    pub fn create(block_size: usize, block_count: usize) -> (Ring, RingWriter) {
        assert!(block_count >= 2, "ring needs at least two slots");
        assert!(block_size > 0);
        let mut buffer = AlignedBuf::zeroed(block_size * block_count);
        let base = buffer.as_mut_ptr();
        let inner = Arc::new(Inner {
            block_size,
            count: block_count as u64,
            base,
            _buffer: buffer,
            state: Mutex::new(State {
                write_pos: 0,
                stamps: vec![Stamp::default(); block_count],
                last_gap: false,
                running: true,
                readers: Vec::new(),
            }),
            cond: Condvar::new(),
        });
        (
            Ring {
                inner: Arc::clone(&inner),
            },
            RingWriter { inner },
        )
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    pub fn block_count(&self) -> usize {
        self.inner.count as usize
    }

    /// Registers a reader positioned at the head of the stream: it sees
    /// only blocks committed after this call.
    pub fn add_reader(&self, reserved: bool) -> Reader {
        let mut state = self.inner.state.lock();
        let reader = ReaderSlot {
            read_pos: state.write_pos,
            reserved,
            underflowed: false,
            backlog_peak: 0,
        };
        let slot = match state.readers.iter().position(Option::is_none) {
            Some(free) => {
                state.readers[free] = Some(reader);
                free
            }
            None => {
                state.readers.push(Some(reader));
                state.readers.len() - 1
            }
        };
        Reader {
            inner: Arc::clone(&self.inner),
            slot,
        }
    }
}

impl RingWriter {
    /// The slot for the next block, for the capture thread to fill.  Waits
    /// while a reserved reader still needs the slot's previous contents.
    #[allow(unsafe_code)]
    pub fn block(&mut self) -> &mut [u8] {
        let slot = {
            let mut state = self.inner.state.lock();
            loop {
                let write_pos = state.write_pos;
                let count = self.inner.count;
                let blocked = state
                    .readers
                    .iter()
                    .flatten()
                    .any(|r| r.reserved && write_pos - r.read_pos >= count);
                if !blocked {
                    break;
                }
                self.inner.cond.wait(&mut state);
            }
            (state.write_pos % self.inner.count) as usize
        };
        // SAFETY: this is the only writer; reserved readers are strictly
        // inside the valid window (checked above) and copying readers only
        // touch committed slots, never the one at write_pos.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.inner.base.add(slot * self.inner.block_size),
                self.inner.block_size,
            )
        }
    }

    /// Commits the block obtained from [`RingWriter::block`] with its
    /// capture timestamp.
    pub fn commit(&mut self, timestamp: Timestamp) {
        self.finish(Some(timestamp));
    }

    /// Commits a gap in place of data.  A gap directly following another
    /// gap is coalesced into it and consumes nothing.
    pub fn commit_gap(&mut self) {
        self.finish(None);
    }

    fn finish(&mut self, timestamp: Option<Timestamp>) {
        let mut state = self.inner.state.lock();
        let gap = timestamp.is_none();
        if gap && state.last_gap {
            return;
        }
        let slot = (state.write_pos % self.inner.count) as usize;
        state.stamps[slot] = Stamp {
            timestamp: timestamp.unwrap_or_default(),
            gap,
        };
        state.last_gap = gap;
        state.write_pos += 1;
        let write_pos = state.write_pos;
        let count = self.inner.count;
        let block_size = self.inner.block_size;
        for reader in state.readers.iter_mut().flatten() {
            let depth = write_pos - reader.read_pos;
            // A reader a full ring behind is about to have its next block
            // overwritten: reset it rather than hand out reused data.
            if !reader.reserved && depth >= count {
                reader.underflowed = true;
            }
            let backlog = depth as usize * block_size;
            if backlog > reader.backlog_peak {
                reader.backlog_peak = backlog;
            }
        }
        self.inner.cond.notify_all();
    }

    /// Marks the end of capture.  Readers drain what remains, then observe
    /// [`ReadOutcome::Stopped`].
    pub fn shutdown(self) {
        let mut state = self.inner.state.lock();
        state.running = false;
        self.inner.cond.notify_all();
    }
}

impl Reader {
    /// Copying read for ordinary readers: blocks until a block, gap or
    /// shutdown is available, copying block data into `out`.
    #[allow(unsafe_code)]
    pub fn read_into(&mut self, out: &mut [u8]) -> ReadOutcome {
        assert_eq!(out.len(), self.inner.block_size);
        let mut state = self.inner.state.lock();
        loop {
            let write_pos = state.write_pos;
            let running = state.running;
            let reader = slot_mut(&mut state, self.slot);
            if reader.underflowed {
                reader.underflowed = false;
                reader.read_pos = write_pos;
                reader.backlog_peak = 0;
                return ReadOutcome::Gap;
            }
            let read_pos = reader.read_pos;
            if read_pos == write_pos {
                if !running {
                    return ReadOutcome::Stopped;
                }
                self.inner.cond.wait(&mut state);
                continue;
            }
            let slot = (read_pos % self.inner.count) as usize;
            let stamp = state.stamps[slot];
            let reader = slot_mut(&mut state, self.slot);
            reader.read_pos += 1;
            if stamp.gap {
                return ReadOutcome::Gap;
            }
            let backlog = std::mem::take(&mut reader.backlog_peak);
            // SAFETY: the slot holds committed data inside the valid window
            // and the writer cannot touch it while we hold the state lock.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.inner.base.add(slot * self.inner.block_size),
                    out.as_mut_ptr(),
                    self.inner.block_size,
                );
            }
            return ReadOutcome::Data {
                timestamp: stamp.timestamp,
                backlog,
            };
        }
    }

    /// In-place read for the reserved reader.  The returned [`ReadBlock`]
    /// keeps the writer out of the slot until dropped.
    pub fn read(&mut self) -> ReservedOutcome<'_> {
        let (data, stamp, backlog) = {
            let mut state = self.inner.state.lock();
            loop {
                let write_pos = state.write_pos;
                let running = state.running;
                let reader = slot_mut(&mut state, self.slot);
                debug_assert!(reader.reserved);
                let read_pos = reader.read_pos;
                if read_pos == write_pos {
                    if !running {
                        return ReservedOutcome::Stopped;
                    }
                    self.inner.cond.wait(&mut state);
                    continue;
                }
                let slot = (read_pos % self.inner.count) as usize;
                let stamp = state.stamps[slot];
                if stamp.gap {
                    slot_mut(&mut state, self.slot).read_pos += 1;
                    self.inner.cond.notify_all();
                    return ReservedOutcome::Gap;
                }
                // read_pos is left in place: the writer backs off from this
                // slot until the ReadBlock is dropped.
                let backlog = std::mem::take(&mut slot_mut(&mut state, self.slot).backlog_peak);
                break (
                    self.inner.base.wrapping_add(slot * self.inner.block_size) as *const u8,
                    stamp,
                    backlog,
                );
            }
        };
        let len = self.inner.block_size;
        ReservedOutcome::Data(ReadBlock {
            reader: self,
            data,
            len,
            timestamp: stamp.timestamp,
            backlog,
        })
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.readers[self.slot] = None;
        // The writer may have been backing off against this reader.
        self.inner.cond.notify_all();
    }
}

impl Deref for ReadBlock<'_> {
    type Target = [u8];

    #[allow(unsafe_code)]
    fn deref(&self) -> &[u8] {
        // SAFETY: the writer backs off from this slot while read_pos sits
        // on it, which lasts until our Drop.
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }
}

impl Drop for ReadBlock<'_> {
    fn drop(&mut self) {
        let mut state = self.reader.inner.state.lock();
        slot_mut(&mut state, self.reader.slot).read_pos += 1;
        self.reader.inner.cond.notify_all();
    }
}
