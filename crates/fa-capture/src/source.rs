//! Frame block sources.
//!
//! A [`BlockSource`] delivers one input block at a time into a ring slot.
//! [`DeviceSource`] reads the sniffer character device and turns any read
//! failure into a gap, retrying the device once a second until it comes
//! back.  [`SyntheticSource`] fabricates a sinusoidal orbit for development
//! and testing, pacing itself to the nominal frame rate.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use fa_core::frame::{FaEntry, FA_ENTRY_COUNT, FA_ENTRY_SIZE, FA_FRAME_SIZE};
use fa_core::Timestamp;

use crate::ring::RingWriter;

/// What a source produced for the current slot.
pub enum SourceStatus {
    /// The slot was filled; the timestamp is the capture completion time.
    Block(Timestamp),
    /// No data available; the slot contents are unspecified.
    Gap,
    /// The source is finished and capture should stop.
    Stopped,
}

/// A producer of input blocks.
pub trait BlockSource: Send {
    fn read_block(&mut self, block: &mut [u8]) -> SourceStatus;
}

/// Drives a source into the ring until it stops.  This is the body of the
/// capture thread.
pub fn run_capture(mut source: Box<dyn BlockSource>, mut writer: RingWriter) {
    loop {
        let block = writer.block();
        match source.read_block(block) {
            SourceStatus::Block(timestamp) => writer.commit(timestamp),
            SourceStatus::Gap => writer.commit_gap(),
            SourceStatus::Stopped => break,
        }
    }
    info!("capture finished");
    writer.shutdown();
}

/// The sniffer character device.
pub struct DeviceSource {
    path: PathBuf,
    device: Option<File>,
    retry_interval: Duration,
    last_attempt: Option<Instant>,
}

impl DeviceSource {
    pub fn new(path: &Path) -> DeviceSource {
        DeviceSource {
            path: path.to_path_buf(),
            device: None,
            retry_interval: Duration::from_secs(1),
            last_attempt: None,
        }
    }

    fn reopen(&mut self) -> bool {
        if let Some(last) = self.last_attempt {
            let since = last.elapsed();
            if since < self.retry_interval {
                std::thread::sleep(self.retry_interval - since);
            }
        }
        self.last_attempt = Some(Instant::now());
        match File::open(&self.path) {
            Ok(device) => {
                info!(path = %self.path.display(), "sniffer device opened");
                self.device = Some(device);
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot open sniffer device");
                false
            }
        }
    }
}

impl BlockSource for DeviceSource {
    fn read_block(&mut self, block: &mut [u8]) -> SourceStatus {
        if self.device.is_none() && !self.reopen() {
            return SourceStatus::Gap;
        }
        let Some(device) = self.device.as_mut() else {
            return SourceStatus::Gap;
        };
        match device.read_exact(block) {
            Ok(()) => SourceStatus::Block(Timestamp::now()),
            Err(e) => {
                warn!(error = %e, "sniffer read failed, reopening");
                self.device = None;
                SourceStatus::Gap
            }
        }
    }
}

/// Fabricated FA data: each BPM carries a sinusoid at its own phase, BPM 0's
/// x field counts frames as the real hardware does.
pub struct SyntheticSource {
    frame_index: u64,
    frame_interval: Duration,
    next_deadline: Option<Instant>,
    /// Total frames to produce before stopping; `None` runs forever.
    limit: Option<u64>,
    amplitude: f64,
}

impl SyntheticSource {
    pub fn new(sample_frequency: f64) -> SyntheticSource {
        SyntheticSource {
            frame_index: 0,
            frame_interval: Duration::from_secs_f64(1.0 / sample_frequency),
            next_deadline: None,
            limit: None,
            amplitude: 100_000.0,
        }
    }

    /// Unpaced source producing a fixed number of frames, for tests.
    pub fn with_limit(mut self, frames: u64) -> SyntheticSource {
        self.limit = Some(frames);
        self.next_deadline = None;
        self.frame_interval = Duration::ZERO;
        self
    }

    fn frame(&self, frame_index: u64, out: &mut [u8]) {
        debug_assert_eq!(out.len(), FA_FRAME_SIZE);
        let t = frame_index as f64 * self.frame_interval.as_secs_f64().max(1e-4);
        for id in 0..FA_ENTRY_COUNT {
            let phase = 2.0 * std::f64::consts::PI * (t + id as f64 / FA_ENTRY_COUNT as f64);
            let entry = if id == 0 {
                FaEntry {
                    x: frame_index as i32,
                    y: 0,
                }
            } else {
                FaEntry {
                    x: (self.amplitude * phase.sin()) as i32,
                    y: (self.amplitude * phase.cos()) as i32,
                }
            };
            let base = id * FA_ENTRY_SIZE;
            out[base..base + 4].copy_from_slice(&entry.x.to_ne_bytes());
            out[base + 4..base + 8].copy_from_slice(&entry.y.to_ne_bytes());
        }
    }
}

impl BlockSource for SyntheticSource {
    fn read_block(&mut self, block: &mut [u8]) -> SourceStatus {
        debug_assert_eq!(block.len() % FA_FRAME_SIZE, 0);
        let frames = (block.len() / FA_FRAME_SIZE) as u64;
        if let Some(limit) = self.limit {
            if self.frame_index + frames > limit {
                return SourceStatus::Stopped;
            }
        }
        for f in 0..frames {
            let start = (f as usize) * FA_FRAME_SIZE;
            self.frame(self.frame_index + f, &mut block[start..start + FA_FRAME_SIZE]);
        }
        self.frame_index += frames;
        if !self.frame_interval.is_zero() {
            let deadline = self
                .next_deadline
                .unwrap_or_else(Instant::now)
                + self.frame_interval * frames as u32;
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            self.next_deadline = Some(deadline);
        }
        SourceStatus::Block(Timestamp::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fa_core::frame::entries_of;

    #[test]
    fn synthetic_counts_frames_in_id_zero() {
        let mut source = SyntheticSource::new(10_000.0).with_limit(512);
        let mut block = vec![0u8; 256 * FA_FRAME_SIZE];
        assert!(matches!(
            source.read_block(&mut block),
            SourceStatus::Block(_)
        ));
        let entries = entries_of(&block);
        assert_eq!(entries[0].x, 0);
        assert_eq!(entries[FA_ENTRY_COUNT].x, 1);
        assert_eq!(entries[255 * FA_ENTRY_COUNT].x, 255);

        assert!(matches!(
            source.read_block(&mut block),
            SourceStatus::Block(_)
        ));
        assert_eq!(entries_of(&block)[0].x, 256);

        // The 512-frame limit is exhausted.
        assert!(matches!(
            source.read_block(&mut block),
            SourceStatus::Stopped
        ));
    }

    #[test]
    fn missing_device_produces_gaps() {
        let mut source = DeviceSource::new(Path::new("/nonexistent/fa_sniffer"));
        source.retry_interval = Duration::ZERO;
        let mut block = vec![0u8; FA_FRAME_SIZE];
        assert!(matches!(source.read_block(&mut block), SourceStatus::Gap));
        assert!(matches!(source.read_block(&mut block), SourceStatus::Gap));
    }
}
