//! Historical reads from the archive.
//!
//! A read request resolves its start timestamp against the data index, then
//! streams whole column reads block by block, re-interleaving them into
//! sample-major lines for the client.  Column buffers come from a fixed
//! pool so a burst of concurrent readers degrades into "too busy" errors
//! instead of unbounded allocation.  Every disk read waits for the write
//! interlock first, so it never overlaps the block being rewritten.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use tracing::debug;

use fa_core::frame::{
    decimated_of, entries_of, FaEntry, DECIMATED_SIZE, FA_ENTRY_COUNT, FA_ENTRY_SIZE,
};
use fa_core::{BpmMask, FaError, Result};
use fa_store::{locate_timestamp, AlignedBuf, Archive, DiskHeader, DiskWriter};

use crate::protocol::{ReadRequest, ReadSource};

/// Socket writes are batched into chunks of roughly this size.
const WRITE_CHUNK: usize = 64 * 1024;

/// Fixed pool of column read buffers shared by all connections.
struct BufferPool {
    queue: SegQueue<AlignedBuf>,
}

impl BufferPool {
    fn new(count: usize, size: usize) -> BufferPool {
        let queue = SegQueue::new();
        for _ in 0..count {
            queue.push(AlignedBuf::zeroed(size));
        }
        BufferPool { queue }
    }

    /// Takes `count` buffers or fails with [`FaError::ReadBusy`].
    fn take(&self, count: usize) -> Result<PoolGuard<'_>> {
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            match self.queue.pop() {
                Some(buffer) => buffers.push(buffer),
                None => {
                    for buffer in buffers {
                        self.queue.push(buffer);
                    }
                    return Err(FaError::ReadBusy);
                }
            }
        }
        Ok(PoolGuard {
            pool: self,
            buffers,
        })
    }
}

struct PoolGuard<'a> {
    pool: &'a BufferPool,
    buffers: Vec<AlignedBuf>,
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        for buffer in self.buffers.drain(..) {
            self.pool.queue.push(buffer);
        }
    }
}

/// Shared engine executing historical read requests.
pub struct ReadEngine {
    archive: Arc<Archive>,
    writer: Arc<DiskWriter>,
    pool: BufferPool,
}

impl ReadEngine {
    pub fn new(archive: Arc<Archive>, writer: Arc<DiskWriter>, pool_buffers: usize) -> ReadEngine {
        let geometry = archive.geometry();
        let fa_column = geometry.major_sample_count as usize * FA_ENTRY_SIZE;
        let d_column = geometry.d_sample_count as usize * DECIMATED_SIZE;
        let dd_column = geometry.dd_sample_count as usize * DECIMATED_SIZE;
        let size = fa_column.max(d_column).max(dd_column);
        ReadEngine {
            pool: BufferPool::new(pool_buffers, size),
            archive,
            writer,
        }
    }

    /// Executes a read request.  Nothing is written to `out` until the
    /// request has fully validated; the success marker, the timestamp of
    /// the first returned sample and the sample data follow.
    pub fn read(&self, request: &ReadRequest, out: &mut impl Write) -> Result<()> {
        let geometry = self.archive.geometry();
        let columns = archive_columns(geometry, &request.mask)?;
        let factor = decimation_factor(geometry, request.source) as u64;

        let location = locate_timestamp(&self.archive, request.start_us)?;
        let mut offset = (location.offset as u64 / factor) as usize;
        let available = location.available / factor;
        if request.samples > available {
            return Err(FaError::NotEnoughSamples {
                available,
                requested: request.samples,
            });
        }

        let mut buffers = self.pool.take(columns.len())?;
        // Each connection reads through its own buffered handle; O_DIRECT
        // is reserved for the writer's whole-block transfers.
        let file = File::open(self.archive.path())?;

        out.write_all(&[0])?;
        out.write_all(&location.timestamp.to_le_bytes())?;

        let per_block = (geometry.major_sample_count as u64 / factor) as usize;
        let mut block = location.block;
        let mut remaining = request.samples;
        let mut chunk = Vec::with_capacity(WRITE_CHUNK);
        debug!(
            block,
            offset,
            samples = request.samples,
            source = ?request.source,
            "historical read"
        );
        while remaining > 0 {
            self.fetch_columns(&file, request.source, block, &columns, &mut buffers.buffers)?;
            let take = remaining.min((per_block - offset) as u64) as usize;
            for sample in offset..offset + take {
                for buffer in &buffers.buffers {
                    emit_line(request.source, buffer, sample, &mut chunk);
                }
                if chunk.len() + line_size(request.source, columns.len()) > WRITE_CHUNK {
                    out.write_all(&chunk)?;
                    chunk.clear();
                }
            }
            remaining -= take as u64;
            offset = 0;
            block = (block + 1) % geometry.major_block_count;
        }
        out.write_all(&chunk)?;
        Ok(())
    }

    /// Reads one column per requested BPM for the given major block.
    fn fetch_columns(
        &self,
        file: &File,
        source: ReadSource,
        block: u32,
        columns: &[usize],
        buffers: &mut [AlignedBuf],
    ) -> Result<()> {
        let geometry = self.archive.geometry();
        match source {
            ReadSource::Fa => {
                let len = geometry.major_sample_count as usize * FA_ENTRY_SIZE;
                for (buffer, &w) in buffers.iter_mut().zip(columns) {
                    self.writer.await_read_interlock();
                    let at = geometry.major_data_offset(block) + geometry.fa_offset(w) as u64;
                    file.read_exact_at(&mut buffer[..len], at)?;
                }
            }
            ReadSource::D { .. } => {
                let len = geometry.d_sample_count as usize * DECIMATED_SIZE;
                for (buffer, &w) in buffers.iter_mut().zip(columns) {
                    self.writer.await_read_interlock();
                    let at = geometry.major_data_offset(block) + geometry.d_offset(w) as u64;
                    file.read_exact_at(&mut buffer[..len], at)?;
                }
            }
            ReadSource::Dd { .. } => {
                // DD data lives in the mapping, not the data area; copy it
                // out under the archive lock.
                let len = geometry.dd_sample_count as usize * DECIMATED_SIZE;
                let guard = self.archive.lock();
                for (buffer, &w) in buffers.iter_mut().zip(columns) {
                    let base = geometry.dd_index(w, block, 0);
                    let samples = &guard.dd()[base..base + geometry.dd_sample_count as usize];
                    buffer[..len].copy_from_slice(fa_core::frame::decimated_bytes(samples));
                }
            }
        }
        Ok(())
    }
}

/// Maps requested BPM ids to column indices within the archive's mask,
/// rejecting ids the archive does not capture.
fn archive_columns(geometry: &DiskHeader, mask: &BpmMask) -> Result<Vec<usize>> {
    let archive_mask = geometry.mask();
    let mut columns = Vec::new();
    let mut w = 0;
    for id in 0..FA_ENTRY_COUNT {
        let in_archive = archive_mask.test(id);
        if mask.test(id) {
            if !in_archive {
                return Err(FaError::NotInArchive { id });
            }
            columns.push(w);
        }
        if in_archive {
            w += 1;
        }
    }
    Ok(columns)
}

fn decimation_factor(geometry: &DiskHeader, source: ReadSource) -> u32 {
    match source {
        ReadSource::Fa => 1,
        ReadSource::D { .. } => geometry.first_decimation,
        ReadSource::Dd { .. } => geometry.first_decimation * geometry.second_decimation,
    }
}

fn line_size(source: ReadSource, columns: usize) -> usize {
    let per_id = match source {
        ReadSource::Fa => FA_ENTRY_SIZE,
        ReadSource::D { data_mask } | ReadSource::Dd { data_mask } => {
            data_mask.count_ones() as usize * FA_ENTRY_SIZE
        }
    };
    columns * per_id
}

fn push_entry(out: &mut Vec<u8>, entry: FaEntry) {
    out.extend_from_slice(&entry.x.to_ne_bytes());
    out.extend_from_slice(&entry.y.to_ne_bytes());
}

/// Appends one BPM's contribution to an output line.
fn emit_line(source: ReadSource, buffer: &AlignedBuf, sample: usize, out: &mut Vec<u8>) {
    match source {
        ReadSource::Fa => push_entry(out, entries_of(buffer)[sample]),
        ReadSource::D { data_mask } | ReadSource::Dd { data_mask } => {
            let value = decimated_of(buffer)[sample];
            for (bit, field) in [value.mean, value.min, value.max, value.std]
                .into_iter()
                .enumerate()
            {
                if data_mask & (1 << bit) != 0 {
                    push_entry(out, field);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_too_busy() {
        let pool = BufferPool::new(2, 4096);
        let first = pool.take(2).unwrap();
        assert!(matches!(pool.take(1), Err(FaError::ReadBusy)));
        drop(first);
        assert!(pool.take(1).is_ok());
    }

    #[test]
    fn line_sizes_follow_data_mask() {
        assert_eq!(line_size(ReadSource::Fa, 3), 24);
        assert_eq!(line_size(ReadSource::D { data_mask: 0xf }, 2), 64);
        assert_eq!(line_size(ReadSource::Dd { data_mask: 0x1 }, 2), 16);
    }
}
