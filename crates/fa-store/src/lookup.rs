//! Timestamp to archive offset resolution.
//!
//! The data index is ordered in circular block order starting just after the
//! current block, which is where the oldest committed data lives.  Leading
//! entries with zero duration are blocks never yet written; the remainder
//! have strictly ascending timestamps, so a binary search over the rotated
//! order finds the latest block starting at or before the target.

use fa_core::{FaError, Result};

use crate::archive::Archive;
use crate::header::{DiskHeader, IndexRecord};

/// Resolved position of a timestamp within the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MajorLocation {
    /// Physical major block holding the sample.
    pub block: u32,
    /// Sample offset within that block.
    pub offset: u32,
    /// Samples available from this position up to, but not including, the
    /// current block.
    pub available: u64,
    /// Actual timestamp of the located sample, computed by interpolating
    /// the block's index record.
    pub timestamp: u64,
}

/// Resolves `target_us` against the live index.
pub fn locate_timestamp(archive: &Archive, target_us: u64) -> Result<MajorLocation> {
    let guard = archive.lock();
    let header = *guard.header();
    locate_in_index(&header, guard.index(), target_us)
}

/// Pure lookup over an index snapshot.  `index` holds one record per major
/// block in physical order; the current block is excluded from the search.
pub fn locate_in_index(
    header: &DiskHeader,
    index: &[IndexRecord],
    target_us: u64,
) -> Result<MajorLocation> {
    let count = header.major_block_count as usize;
    debug_assert_eq!(index.len(), count);
    let current = header.current_major_block as usize;
    let samples = header.major_sample_count as u64;
    // Logical position 0 is the block just after current, the oldest data.
    let physical = |p: usize| (current + 1 + p) % count;
    let committed = count - 1;

    // Skip the prefix of never-written blocks.
    let first_valid = partition_point(committed, |p| index[physical(p)].duration_us == 0);
    if first_valid == committed {
        return Err(FaError::TooEarly);
    }
    if target_us < index[physical(first_valid)].timestamp_us {
        return Err(FaError::TooEarly);
    }

    // Last committed block starting at or before the target.
    let after = partition_point(committed - first_valid, |p| {
        index[physical(first_valid + p)].timestamp_us <= target_us
    });
    let mut logical = first_valid + after - 1;
    let mut record = index[physical(logical)];
    // A parseable far-future target can overflow the interpolation; any
    // such target is past the end of the archive.
    let mut offset = (target_us - record.timestamp_us)
        .checked_mul(samples)
        .ok_or(FaError::TooLate)?
        / record.duration_us as u64;
    if offset >= samples {
        // The target falls past the end of the block, in a capture gap
        // before its successor; snap to the successor's first sample.
        logical += 1;
        if logical >= committed {
            return Err(FaError::TooLate);
        }
        record = index[physical(logical)];
        if record.duration_us == 0 {
            return Err(FaError::TooLate);
        }
        offset = 0;
    }

    Ok(MajorLocation {
        block: physical(logical) as u32,
        offset: offset as u32,
        available: (committed - logical) as u64 * samples - offset,
        timestamp: record.timestamp_us + offset * record.duration_us as u64 / samples,
    })
}

/// First `p` in `0..len` for which `pred(p)` is false; `pred` must be
/// monotonically true-then-false over the range.
fn partition_point(len: usize, pred: impl Fn(usize) -> bool) -> usize {
    let mut lo = 0;
    let mut hi = len;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderParams;
    use fa_core::BpmMask;

    fn test_header(count: u32, current: u32) -> DiskHeader {
        let mut header = DiskHeader::initialise(&HeaderParams {
            file_size: 256 << 20,
            archive_mask: BpmMask::parse_ids("0-15").unwrap(),
            major_sample_count: 16384,
            input_frame_count: 256,
            first_decimation: 64,
            second_decimation: 4,
            sample_frequency: 10_072.0,
        })
        .unwrap();
        assert!(header.major_block_count >= count);
        header.major_block_count = count;
        header.current_major_block = current;
        header
    }

    fn record(timestamp_us: u64, duration_us: u32) -> IndexRecord {
        IndexRecord {
            timestamp_us,
            duration_us,
            id_zero: 0,
        }
    }

    #[test]
    fn interpolates_within_a_block() {
        // Blocks 0..3 committed, block 3 current and unwritten.
        let header = test_header(4, 3);
        let index = vec![
            record(1000, 500),
            record(1500, 500),
            record(2000, 500),
            record(0, 0),
        ];
        let hit = locate_in_index(&header, &index, 1250).unwrap();
        assert_eq!(hit.block, 0);
        assert_eq!(hit.offset, header.major_sample_count / 2);
        assert_eq!(hit.timestamp, 1250);
        assert_eq!(
            hit.available,
            3 * header.major_sample_count as u64 - hit.offset as u64
        );
    }

    #[test]
    fn exact_block_start_gives_offset_zero() {
        let header = test_header(4, 3);
        let index = vec![
            record(1000, 500),
            record(1500, 500),
            record(2000, 500),
            record(0, 0),
        ];
        let hit = locate_in_index(&header, &index, 1500).unwrap();
        assert_eq!(hit.block, 1);
        assert_eq!(hit.offset, 0);
        assert_eq!(hit.timestamp, 1500);
    }

    #[test]
    fn too_early_and_too_late() {
        let header = test_header(4, 3);
        let index = vec![
            record(1000, 500),
            record(1500, 500),
            record(2000, 500),
            record(0, 0),
        ];
        assert!(matches!(
            locate_in_index(&header, &index, 999),
            Err(FaError::TooEarly)
        ));
        // 2600 is past the end of the last committed block.
        assert!(matches!(
            locate_in_index(&header, &index, 2600),
            Err(FaError::TooLate)
        ));
        // A far-future target must fail the same way, not wrap the
        // interpolation arithmetic.
        assert!(matches!(
            locate_in_index(&header, &index, 2000 + (1 << 50)),
            Err(FaError::TooLate)
        ));
    }

    #[test]
    fn empty_archive_is_too_early() {
        let header = test_header(4, 0);
        let index = vec![record(0, 0); 4];
        assert!(matches!(
            locate_in_index(&header, &index, 12345),
            Err(FaError::TooEarly)
        ));
    }

    #[test]
    fn search_handles_wrapped_order() {
        // current = 1, so logical order is physically 2, 3, 0.
        let header = test_header(4, 1);
        let index = vec![
            record(3000, 500),
            record(0, 0),
            record(2000, 500),
            record(2500, 500),
        ];
        let hit = locate_in_index(&header, &index, 3250).unwrap();
        assert_eq!(hit.block, 0);
        assert_eq!(hit.offset, header.major_sample_count / 2);
        assert_eq!(hit.timestamp, 3250);

        let early = locate_in_index(&header, &index, 2000).unwrap();
        assert_eq!(early.block, 2);
        assert_eq!(early.offset, 0);
    }

    #[test]
    fn gap_between_blocks_snaps_to_successor() {
        let header = test_header(4, 3);
        // A capture gap: block 1 starts well after block 0 ends.
        let index = vec![
            record(1000, 500),
            record(5000, 500),
            record(5500, 500),
            record(0, 0),
        ];
        let hit = locate_in_index(&header, &index, 2000).unwrap();
        assert_eq!(hit.block, 1);
        assert_eq!(hit.offset, 0);
        assert_eq!(hit.timestamp, 5000);
    }
}
