//! Live subscription streaming.
//!
//! A subscriber attaches an ordinary ring reader at the head of the stream
//! and forwards every captured frame, filtered down to the requested ids.
//! The connection ends on the first gap after data has flowed: the client
//! restarts its subscription and the gap is visible as a break in the
//! frame counter.

use std::io::Write;

use tracing::debug;

use fa_core::frame::FA_FRAME_SIZE;
use fa_core::{BpmMask, Result};
use fa_capture::{ReadOutcome, Ring};
use fa_store::AlignedBuf;

/// Streams filtered frames from the ring until a gap, shutdown or client
/// disconnect.  The success marker and, when requested, the microsecond
/// timestamp of the first delivered block are written before any data.
pub fn run_subscription(
    ring: &Ring,
    mask: &BpmMask,
    want_timestamp: bool,
    out: &mut impl Write,
) -> Result<()> {
    let mut reader = ring.add_reader(false);
    let capacity = ring.block_size() * ring.block_count();
    // Frames are decoded in place, so the copy target must be entry aligned.
    let mut block = AlignedBuf::zeroed(ring.block_size());
    let mut line = vec![0u8; mask.count() * 8];

    out.write_all(&[0])?;

    let mut started = false;
    loop {
        match reader.read_into(&mut block) {
            ReadOutcome::Data { timestamp, backlog } => {
                if !started {
                    started = true;
                    if want_timestamp {
                        out.write_all(&timestamp.as_micros().to_le_bytes())?;
                    }
                } else if backlog > capacity * 3 / 4 {
                    debug!(backlog, "subscriber falling behind");
                }
                for frame in block.chunks_exact(FA_FRAME_SIZE) {
                    let written = mask.copy_frame(&mut line, frame);
                    out.write_all(&line[..written])?;
                }
            }
            // A gap before any data just means the device is not up yet.
            ReadOutcome::Gap if !started => continue,
            ReadOutcome::Gap | ReadOutcome::Stopped => break,
        }
    }
    out.flush()?;
    Ok(())
}
