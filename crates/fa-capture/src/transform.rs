//! Input block to major block transform.
//!
//! Each input block is transposed from frame order into per-BPM columns of
//! the staging buffer and reduced once by the first decimation.  When the
//! staging buffer holds a complete major block, the block's start time and
//! duration are fitted from the input block timestamps, the index record
//! and the block's DD samples are published under the archive lock, and the
//! block is handed to the disk writer.
//!
//! On x86-64 the transpose uses SSE2 non-temporal stores: column data is
//! write-once and read back only from disk, so there is no point pulling it
//! through the cache.  The scalar path produces byte-identical output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use fa_core::frame::{
    decimated_bytes, decimated_of, entries_of, DecimatedSample, FaEntry, DECIMATED_SIZE,
    FA_ENTRY_COUNT, FA_ENTRY_SIZE,
};
use fa_core::Timestamp;
use fa_store::{AlignedBuf, Archive, DiskHeader, DiskWriter, IndexRecord};

use crate::ring::{Reader, ReservedOutcome};

/// The transform stage, owner of the staging buffer for the major block
/// currently being assembled.
pub struct Transform {
    archive: Arc<Archive>,
    writer: Arc<DiskWriter>,
    geometry: DiskHeader,
    /// Cleared by the halt control command; while clear, captured blocks
    /// are discarded instead of archived.
    enabled: Arc<AtomicBool>,
    /// BPM ids captured, in mask order.
    ids: Vec<usize>,
    staging: AlignedBuf,
    spare: Vec<AlignedBuf>,
    /// Samples per BPM already transposed into the staging buffer.
    fa_offset: u32,
    /// Commit timestamps of the contributing input blocks, microseconds.
    stamps: Vec<u64>,
    id_zero: i32,
}

impl Transform {
    /// Prepares the transform against an open archive.  The index record of
    /// the block about to be filled is invalidated so a stale record from a
    /// previous run cannot be served.
    pub fn new(
        archive: Arc<Archive>,
        writer: Arc<DiskWriter>,
        enabled: Arc<AtomicBool>,
    ) -> Transform {
        let geometry = *archive.geometry();
        {
            let mut guard = archive.lock();
            let current = guard.header().current_major_block as usize;
            guard.index_mut()[current] = IndexRecord::default();
            let header = guard.header_mut();
            header.write_backlog = 0;
            header.write_buffer = 0;
        }
        Transform {
            ids: geometry.mask().ids().collect(),
            staging: AlignedBuf::zeroed(geometry.major_block_size as usize),
            spare: Vec::new(),
            fa_offset: 0,
            stamps: Vec::with_capacity(geometry.input_block_count() as usize),
            id_zero: 0,
            enabled,
            archive,
            writer,
            geometry,
        }
    }

    /// Consumes the reserved ring reader until capture stops.
    pub fn run(&mut self, reader: &mut Reader) {
        loop {
            match reader.read() {
                ReservedOutcome::Data(block) => {
                    let timestamp = block.timestamp;
                    let backlog = block.backlog;
                    self.process_block(&block, timestamp, backlog);
                }
                ReservedOutcome::Gap => self.process_gap(),
                ReservedOutcome::Stopped => break,
            }
        }
        if let Err(e) = self.archive.flush() {
            warn!(error = %e, "archive flush failed at shutdown");
        }
    }

    /// Folds one input block into the staging buffer.
    pub fn process_block(&mut self, data: &[u8], timestamp: Timestamp, backlog: usize) {
        debug_assert_eq!(data.len(), self.geometry.input_block_size());
        debug_assert_eq!(data.as_ptr() as usize % 8, 0);
        if !self.enabled.load(Ordering::Relaxed) {
            // Halted: blocks captured in the meantime are dropped, and a
            // partial major block is abandoned like after a gap.
            self.process_gap();
            return;
        }
        let frames = entries_of(data);
        if self.fa_offset == 0 {
            self.id_zero = frames[0].x;
            let mut guard = self.archive.lock();
            guard.header_mut().id_zero_anchor = self.id_zero;
        }
        self.transpose(frames);
        self.decimate(frames);
        self.stamps.push(timestamp.as_micros());
        self.fa_offset += self.geometry.input_frame_count;
        {
            let mut guard = self.archive.lock();
            guard.header_mut().write_backlog = backlog as u32;
        }
        if self.fa_offset == self.geometry.major_sample_count {
            self.complete_major_block();
        }
    }

    /// Handles a capture gap: a partially assembled major block is
    /// abandoned and restarted, and its index record stays invalid.
    pub fn process_gap(&mut self) {
        if self.fa_offset > 0 {
            warn!(
                samples = self.fa_offset,
                "capture gap, discarding partial major block"
            );
            let mut guard = self.archive.lock();
            let current = guard.header().current_major_block as usize;
            guard.index_mut()[current] = IndexRecord::default();
            self.fa_offset = 0;
            self.stamps.clear();
        } else {
            debug!("capture gap");
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn transpose(&mut self, frames: &[FaEntry]) {
        // SAFETY: SSE2 is part of the x86-64 baseline; source and column
        // pointers are 8-byte aligned (page-aligned buffers, 8-byte
        // entries).
        #[allow(unsafe_code)]
        unsafe {
            transpose_stream(
                &mut self.staging,
                &self.geometry,
                &self.ids,
                self.fa_offset,
                frames,
            );
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn transpose(&mut self, frames: &[FaEntry]) {
        transpose_scalar(
            &mut self.staging,
            &self.geometry,
            &self.ids,
            self.fa_offset,
            frames,
        );
    }

    /// First decimation of the input block just transposed.
    fn decimate(&mut self, frames: &[FaEntry]) {
        let n = self.geometry.first_decimation as usize;
        let frame_count = self.geometry.input_frame_count as usize;
        let first_index = (self.fa_offset / self.geometry.first_decimation) as usize;
        for (w, &id) in self.ids.iter().enumerate() {
            for group in 0..frame_count / n {
                let samples = (0..n).map(|f| frames[(group * n + f) * FA_ENTRY_COUNT + id]);
                let sample = decimate_group(samples.clone(), samples, n);
                let at = self.geometry.d_offset(w) + (first_index + group) * DECIMATED_SIZE;
                self.staging[at..at + DECIMATED_SIZE]
                    .copy_from_slice(decimated_bytes(std::slice::from_ref(&sample)));
            }
        }
    }

    fn complete_major_block(&mut self) {
        let (start_us, duration_us) = self.fit_timestamps();
        let dd = self.compute_dd();
        let per_bpm = self.geometry.dd_sample_count as usize;

        let current = {
            let mut guard = self.archive.lock();
            let current = guard.header().current_major_block;
            guard.index_mut()[current as usize] = IndexRecord {
                timestamp_us: start_us,
                duration_us,
                id_zero: self.id_zero,
            };
            for (w, chunk) in dd.chunks(per_bpm).enumerate() {
                let base = self.geometry.dd_index(w, current, 0);
                guard.dd_mut()[base..base + per_bpm].copy_from_slice(chunk);
            }
            guard.header_mut().write_buffer = self.geometry.major_block_size;
            current
        };

        // Hand the block off outside the lock: this blocks while the
        // previous write is still in progress, and readers must be able to
        // use the index meanwhile.
        let size = self.geometry.major_block_size as usize;
        let next = self
            .spare
            .pop()
            .unwrap_or_else(|| AlignedBuf::zeroed(size));
        let filled = std::mem::replace(&mut self.staging, next);
        if let Some(reclaimed) =
            self.writer
                .schedule_write(self.geometry.major_data_offset(current), size, filled)
        {
            self.spare.push(reclaimed);
        }

        {
            let mut guard = self.archive.lock();
            let next_block = (current + 1) % self.geometry.major_block_count;
            guard.index_mut()[next_block as usize] = IndexRecord::default();
            let header = guard.header_mut();
            header.current_major_block = next_block;
            let smoothed = header.last_duration as f64;
            header.last_duration = (smoothed + 0.1 * (duration_us as f64 - smoothed)).round() as u32;
        }
        self.fa_offset = 0;
        self.stamps.clear();
        debug!(block = current, start_us, duration_us, "major block committed");
    }

    /// Least-squares fit of the block start time and duration from the
    /// input block commit timestamps.  Timestamp `i` is taken after input
    /// block `i` completes, so it corresponds to sample `(i + 1) * F`.
    fn fit_timestamps(&self) -> (u64, u32) {
        let n = self.stamps.len();
        let fallback = || {
            let duration = {
                let guard = self.archive.lock();
                guard.header().last_duration
            };
            let end = self.stamps.last().copied().unwrap_or_default();
            (end.saturating_sub(duration as u64), duration)
        };
        if n < 2 {
            return fallback();
        }
        let base = self.stamps[0];
        let mut sum = 0.0;
        let mut sum_ut = 0.0;
        for (i, &ts) in self.stamps.iter().enumerate() {
            // Signed: the wall clock can step backwards between blocks.
            let delta = (ts as i64 - base as i64) as f64;
            let u = (2 * i) as f64 - (n - 1) as f64;
            sum += delta;
            sum_ut += u * delta;
        }
        // Sum of u^2 over the symmetric points -(n-1), -(n-3), .., n-1.
        let sum_uu = (n * (n * n - 1)) as f64 / 3.0;
        let slope = sum_ut / sum_uu;
        let mean = sum / n as f64;
        let start = mean - slope * (n + 1) as f64;
        let duration = 2.0 * slope * n as f64;
        if !(duration > 0.0 && start + base as f64 > 0.0) {
            warn!("degenerate timestamp fit, using nominal duration");
            return fallback();
        }
        (
            (base as f64 + start).round() as u64,
            duration.round() as u32,
        )
    }

    /// Second decimation over the completed block's first-decimated
    /// columns.  The mean is a truncating mean of means; the variance is
    /// the running sum of the component variances.
    fn compute_dd(&self) -> Vec<DecimatedSample> {
        let second = self.geometry.second_decimation as usize;
        let per_bpm = self.geometry.dd_sample_count as usize;
        let d_count = self.geometry.d_sample_count as usize;
        let mut out = Vec::with_capacity(self.ids.len() * per_bpm);
        for w in 0..self.ids.len() {
            let at = self.geometry.d_offset(w);
            let column = decimated_of(&self.staging[at..at + d_count * DECIMATED_SIZE]);
            for slot in 0..per_bpm {
                out.push(decimate_second(&column[slot * second..(slot + 1) * second]));
            }
        }
        out
    }
}

/// Mean, min, max and standard deviation of one group of FA entries.  Two
/// passes: the variance is computed against the unrounded mean.
fn decimate_group(
    first_pass: impl Iterator<Item = FaEntry>,
    second_pass: impl Iterator<Item = FaEntry>,
    n: usize,
) -> DecimatedSample {
    let mut sum_x = 0i64;
    let mut sum_y = 0i64;
    let mut min = FaEntry {
        x: i32::MAX,
        y: i32::MAX,
    };
    let mut max = FaEntry {
        x: i32::MIN,
        y: i32::MIN,
    };
    for entry in first_pass {
        sum_x += entry.x as i64;
        sum_y += entry.y as i64;
        min.x = min.x.min(entry.x);
        min.y = min.y.min(entry.y);
        max.x = max.x.max(entry.x);
        max.y = max.y.max(entry.y);
    }
    let mean_x = sum_x as f64 / n as f64;
    let mean_y = sum_y as f64 / n as f64;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for entry in second_pass {
        var_x += (entry.x as f64 - mean_x).powi(2);
        var_y += (entry.y as f64 - mean_y).powi(2);
    }
    DecimatedSample {
        mean: FaEntry {
            x: mean_x.round() as i32,
            y: mean_y.round() as i32,
        },
        min,
        max,
        std: FaEntry {
            x: (var_x / n as f64).sqrt().round() as i32,
            y: (var_y / n as f64).sqrt().round() as i32,
        },
    }
}

/// Second-stage reduction of a group of first-decimated samples.
fn decimate_second(group: &[DecimatedSample]) -> DecimatedSample {
    let n = group.len() as i64;
    let mut sum_x = 0i64;
    let mut sum_y = 0i64;
    let mut min = FaEntry {
        x: i32::MAX,
        y: i32::MAX,
    };
    let mut max = FaEntry {
        x: i32::MIN,
        y: i32::MIN,
    };
    let mut sumvar_x = 0.0;
    let mut sumvar_y = 0.0;
    for sample in group {
        sum_x += sample.mean.x as i64;
        sum_y += sample.mean.y as i64;
        min.x = min.x.min(sample.min.x);
        min.y = min.y.min(sample.min.y);
        max.x = max.x.max(sample.max.x);
        max.y = max.y.max(sample.max.y);
        sumvar_x += (sample.std.x as f64).powi(2);
        sumvar_y += (sample.std.y as f64).powi(2);
    }
    DecimatedSample {
        mean: FaEntry {
            x: (sum_x / n) as i32,
            y: (sum_y / n) as i32,
        },
        min,
        max,
        std: FaEntry {
            x: (sumvar_x / n as f64).sqrt().round() as i32,
            y: (sumvar_y / n as f64).sqrt().round() as i32,
        },
    }
}

#[cfg_attr(all(target_arch = "x86_64", not(test)), allow(dead_code))]
fn transpose_scalar(
    staging: &mut [u8],
    geometry: &DiskHeader,
    ids: &[usize],
    fa_offset: u32,
    frames: &[FaEntry],
) {
    let frame_count = geometry.input_frame_count as usize;
    for (w, &id) in ids.iter().enumerate() {
        let base = geometry.fa_offset(w) + fa_offset as usize * FA_ENTRY_SIZE;
        let column = &mut staging[base..base + frame_count * FA_ENTRY_SIZE];
        for f in 0..frame_count {
            let entry = frames[f * FA_ENTRY_COUNT + id];
            let at = f * FA_ENTRY_SIZE;
            column[at..at + 4].copy_from_slice(&entry.x.to_ne_bytes());
            column[at + 4..at + 8].copy_from_slice(&entry.y.to_ne_bytes());
        }
    }
}

/// Column transpose using non-temporal 8-byte stores.
///
/// # Safety
/// `staging` and `frames` must be 8-byte aligned, which holds for
/// page-aligned capture and staging buffers.
#[cfg(target_arch = "x86_64")]
#[allow(unsafe_code)]
unsafe fn transpose_stream(
    staging: &mut [u8],
    geometry: &DiskHeader,
    ids: &[usize],
    fa_offset: u32,
    frames: &[FaEntry],
) {
    use std::arch::x86_64::{_mm_sfence, _mm_stream_si64};

    let frame_count = geometry.input_frame_count as usize;
    let src = frames.as_ptr().cast::<i64>();
    for (w, &id) in ids.iter().enumerate() {
        let base = geometry.fa_offset(w) + fa_offset as usize * FA_ENTRY_SIZE;
        let dst = staging.as_mut_ptr().add(base).cast::<i64>();
        for f in 0..frame_count {
            _mm_stream_si64(dst.add(f), *src.add(f * FA_ENTRY_COUNT + id));
        }
    }
    _mm_sfence();
}

#[cfg(test)]
mod tests {
    use super::*;
    use fa_core::BpmMask;
    use fa_store::HeaderParams;

    fn test_params() -> HeaderParams {
        HeaderParams {
            file_size: 4 << 20,
            archive_mask: BpmMask::parse_ids("0-7").unwrap(),
            major_sample_count: 1024,
            input_frame_count: 256,
            first_decimation: 64,
            second_decimation: 4,
            sample_frequency: 10_000.0,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        archive: Arc<Archive>,
        writer: Arc<DiskWriter>,
        enabled: Arc<AtomicBool>,
        transform: Transform,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.fa");
        Archive::create(&path, &test_params()).unwrap();
        let archive = Arc::new(Archive::open(&path).unwrap());
        let writer = Arc::new(DiskWriter::start(Arc::clone(&archive)).unwrap());
        let enabled = Arc::new(AtomicBool::new(true));
        let transform = Transform::new(
            Arc::clone(&archive),
            Arc::clone(&writer),
            Arc::clone(&enabled),
        );
        Fixture {
            _dir: dir,
            archive,
            writer,
            enabled,
            transform,
        }
    }

    /// An input block whose entry for every BPM at frame `f` is
    /// `entry(f)`, except BPM 0 whose x counts frames from `counter`.
    fn input_block(counter: i32, entry: impl Fn(usize) -> FaEntry) -> AlignedBuf {
        let params = test_params();
        let mut block = AlignedBuf::zeroed(params.input_frame_count as usize * 2048);
        for f in 0..params.input_frame_count as usize {
            for id in 0..FA_ENTRY_COUNT {
                let value = if id == 0 {
                    FaEntry {
                        x: counter + f as i32,
                        y: 0,
                    }
                } else {
                    entry(f)
                };
                let at = (f * FA_ENTRY_COUNT + id) * FA_ENTRY_SIZE;
                block[at..at + 4].copy_from_slice(&value.x.to_ne_bytes());
                block[at + 4..at + 8].copy_from_slice(&value.y.to_ne_bytes());
            }
        }
        block
    }

    fn feed_major_block(fx: &mut Fixture, base_us: u64, entry: impl Fn(usize) -> FaEntry) {
        for i in 0..4 {
            let block = input_block(i as i32 * 256, &entry);
            fx.transform.process_block(
                &block,
                Timestamp::from_micros(base_us + 1000 * (i + 1)),
                0,
            );
        }
    }

    #[test]
    fn constant_stream_produces_exact_block() {
        let mut fx = fixture();
        feed_major_block(&mut fx, 1_000_000_000, |_| FaEntry { x: 7, y: -3 });
        fx.writer.await_read_interlock();

        let geometry = *fx.archive.geometry();
        let guard = fx.archive.lock();
        // The perfectly linear stamps fit to start = base, duration = 4000.
        let record = guard.index()[0];
        assert_eq!(record.timestamp_us, 1_000_000_000);
        assert_eq!(record.duration_us, 4000);
        assert_eq!(record.id_zero, 0);
        assert_eq!(guard.header().current_major_block, 1);
        assert_eq!(guard.index()[1], IndexRecord::default());
        // Smoothed duration moves a tenth of the way from nominal to 4000.
        assert_eq!(guard.header().last_duration, 92_560);

        // DD of a constant stream: mean = value, std = 0.
        let base = geometry.dd_index(1, 0, 0);
        let dd = guard.dd()[base];
        assert_eq!(dd.mean, FaEntry { x: 7, y: -3 });
        assert_eq!(dd.min, FaEntry { x: 7, y: -3 });
        assert_eq!(dd.max, FaEntry { x: 7, y: -3 });
        assert_eq!(dd.std, FaEntry { x: 0, y: 0 });
        drop(guard);

        let mut block = AlignedBuf::zeroed(geometry.major_block_size as usize);
        fx.archive
            .read_block(geometry.major_data_offset(0), &mut block)
            .unwrap();
        // BPM 1's FA column is the constant value throughout.
        let at = geometry.fa_offset(1);
        let column = entries_of(&block[at..at + 1024 * FA_ENTRY_SIZE]);
        assert!(column.iter().all(|&e| e == FaEntry { x: 7, y: -3 }));
        // BPM 0's column carries the frame counter.
        let at = geometry.fa_offset(0);
        let column = entries_of(&block[at..at + 1024 * FA_ENTRY_SIZE]);
        assert_eq!(column[0].x, 0);
        assert_eq!(column[1023].x, 1023 % 256 + 3 * 256);
        // First decimation of a constant stream.
        let at = geometry.d_offset(1);
        let d_column = decimated_of(&block[at..at + 16 * DECIMATED_SIZE]);
        for sample in d_column {
            assert_eq!(sample.mean, FaEntry { x: 7, y: -3 });
            assert_eq!(sample.std, FaEntry { x: 0, y: 0 });
        }
        fx.writer.shutdown();
    }

    #[test]
    fn gap_discards_partial_block() {
        let mut fx = fixture();
        // Two blocks in, then a gap.
        for i in 0..2 {
            let block = input_block(0, |_| FaEntry { x: 1, y: 1 });
            fx.transform
                .process_block(&block, Timestamp::from_micros(1_000_000 + i), 0);
        }
        fx.transform.process_gap();
        {
            let guard = fx.archive.lock();
            assert_eq!(guard.index()[0], IndexRecord::default());
            assert_eq!(guard.header().current_major_block, 0);
        }
        // A full block after the gap commits cleanly with post-gap data.
        feed_major_block(&mut fx, 2_000_000_000, |_| FaEntry { x: 5, y: 5 });
        fx.writer.await_read_interlock();
        {
            let guard = fx.archive.lock();
            assert_eq!(guard.index()[0].timestamp_us, 2_000_000_000);
            assert_eq!(guard.header().current_major_block, 1);
        }
        let geometry = *fx.archive.geometry();
        let mut block = AlignedBuf::zeroed(geometry.major_block_size as usize);
        fx.archive
            .read_block(geometry.major_data_offset(0), &mut block)
            .unwrap();
        let at = geometry.fa_offset(1);
        let column = entries_of(&block[at..at + 1024 * FA_ENTRY_SIZE]);
        assert!(column.iter().all(|&e| e == FaEntry { x: 5, y: 5 }));
        fx.writer.shutdown();
    }

    #[test]
    fn timestamp_fit_averages_jitter() {
        let mut fx = fixture();
        let base = 1_000_000_000u64;
        let jittered = [900, 2100, 2900, 4100];
        for (i, &offset) in jittered.iter().enumerate() {
            let block = input_block(i as i32 * 256, |_| FaEntry { x: 0, y: 0 });
            fx.transform
                .process_block(&block, Timestamp::from_micros(base + offset), 0);
        }
        fx.writer.await_read_interlock();
        let guard = fx.archive.lock();
        let record = guard.index()[0];
        assert_eq!(record.timestamp_us, base - 100);
        assert_eq!(record.duration_us, 4160);
        drop(guard);
        fx.writer.shutdown();
    }

    #[test]
    fn backwards_clock_step_does_not_derail_the_fit() {
        let mut fx = fixture();
        let base = 1_000_000_000u64;
        // The second stamp lands before the first: a backwards wall-clock
        // step mid block.
        let offsets = [2000, 1000, 3000, 4000];
        for (i, &offset) in offsets.iter().enumerate() {
            let block = input_block(i as i32 * 256, |_| FaEntry { x: 0, y: 0 });
            fx.transform
                .process_block(&block, Timestamp::from_micros(base + offset), 0);
        }
        fx.writer.await_read_interlock();
        let guard = fx.archive.lock();
        let record = guard.index()[0];
        assert_eq!(record.timestamp_us, base + 500);
        assert_eq!(record.duration_us, 3200);
        drop(guard);
        fx.writer.shutdown();
    }

    #[test]
    fn dd_mean_truncates_and_std_sums_variances() {
        let mut fx = fixture();
        // Each first-decimation group (64 frames) is constant, so component
        // stds are zero; group means differ.
        let group_x = [0, 1, 1, 1];
        let group_y = [0, 1, 1, 2];
        feed_major_block(&mut fx, 1_000_000_000, |f| FaEntry {
            x: group_x[(f / 64) % 4],
            y: group_y[(f / 64) % 4],
        });
        fx.writer.await_read_interlock();
        let geometry = *fx.archive.geometry();
        let guard = fx.archive.lock();
        let dd = guard.dd()[geometry.dd_index(1, 0, 0)];
        // (0 + 1 + 1 + 1) / 4 truncates to 0; (0 + 1 + 1 + 2) / 4 is 1.
        assert_eq!(dd.mean, FaEntry { x: 0, y: 1 });
        assert_eq!(dd.min, FaEntry { x: 0, y: 0 });
        assert_eq!(dd.max, FaEntry { x: 1, y: 2 });
        // Component variances are all zero, so the DD std is too.
        assert_eq!(dd.std, FaEntry { x: 0, y: 0 });
        drop(guard);
        fx.writer.shutdown();
    }

    #[test]
    fn halt_discards_blocks_until_resumed() {
        let mut fx = fixture();
        fx.enabled.store(false, Ordering::Relaxed);
        feed_major_block(&mut fx, 1_000_000_000, |_| FaEntry { x: 9, y: 9 });
        fx.writer.await_read_interlock();
        {
            let guard = fx.archive.lock();
            assert_eq!(guard.index()[0], IndexRecord::default());
            assert_eq!(guard.header().current_major_block, 0);
        }
        fx.enabled.store(true, Ordering::Relaxed);
        feed_major_block(&mut fx, 2_000_000_000, |_| FaEntry { x: 9, y: 9 });
        fx.writer.await_read_interlock();
        let guard = fx.archive.lock();
        assert_eq!(guard.index()[0].timestamp_us, 2_000_000_000);
        assert_eq!(guard.header().current_major_block, 1);
        drop(guard);
        fx.writer.shutdown();
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn stream_transpose_matches_scalar() {
        let params = test_params();
        let header = fa_store::DiskHeader::initialise(&params).unwrap();
        let ids: Vec<usize> = header.mask().ids().collect();
        let block = input_block(0, |f| FaEntry {
            x: (f as i32).wrapping_mul(2_654_435_761u32 as i32),
            y: (f as i32) - 128,
        });
        let frames = entries_of(&block);

        let mut scalar = AlignedBuf::zeroed(header.major_block_size as usize);
        let mut streamed = AlignedBuf::zeroed(header.major_block_size as usize);
        transpose_scalar(&mut scalar, &header, &ids, 256, frames);
        // SAFETY: both buffers are page aligned.
        unsafe { transpose_stream(&mut streamed, &header, &ids, 256, frames) };
        assert_eq!(&scalar[..], &streamed[..]);
    }
}
