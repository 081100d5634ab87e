//! Archive file header and data index layout.
//!
//! The first 4096 bytes of the archive hold a `#[repr(C)]` [`DiskHeader`]
//! describing the complete geometry of the file.  All multi-byte fields are
//! native endian; the archive is not portable across byte orders, which the
//! signature check catches in practice.  The header is followed by the data
//! index (one [`IndexRecord`] per major block), the DD region and finally the
//! round-robin major-block area.

use std::fmt;

use fa_core::frame::{DECIMATED_SIZE, FA_ENTRY_SIZE, FA_FRAME_SIZE};
use fa_core::{BpmMask, FaError, Result};

/// Size of the header page at the start of the archive.
pub const HEADER_SIZE: usize = 4096;

/// Archive signature, first bytes of the file.
pub const SIGNATURE: [u8; 7] = *b"FASNIFF";

/// Current archive layout version.
pub const VERSION: u8 = 1;

/// Index and DD region sizes are rounded up to this boundary so the major
/// data area starts on a large aligned offset.
pub const REGION_ALIGN: u64 = 1 << 20;

/// One entry of the data index: the capture metadata of one major block.
///
/// A zero duration marks a block that has never been written, or whose
/// capture was interrupted by a communication gap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct IndexRecord {
    /// Wall-clock timestamp of the first sample, microseconds since epoch.
    pub timestamp_us: u64,
    /// Time spanned by the block in microseconds.
    pub duration_us: u32,
    /// Value of the BPM id 0 x field at the start of the block.
    pub id_zero: i32,
}

/// Size of one index record on disk.
pub const INDEX_RECORD_SIZE: usize = std::mem::size_of::<IndexRecord>();

const _: () = assert!(INDEX_RECORD_SIZE == 16);

/// Parameters fixed when an archive is created.
#[derive(Debug, Clone)]
pub struct HeaderParams {
    /// Total size of the archive file in bytes.
    pub file_size: u64,
    /// BPM ids captured by this archive.
    pub archive_mask: BpmMask,
    /// FA samples stored per BPM per major block.
    pub major_sample_count: u32,
    /// Frames delivered per ring slot.
    pub input_frame_count: u32,
    /// First decimation factor (FA samples per decimated sample).
    pub first_decimation: u32,
    /// Second decimation factor (decimated samples per DD sample).
    pub second_decimation: u32,
    /// Nominal sample frequency, seeds the smoothed block duration.
    pub sample_frequency: f64,
}

/// The on-disk archive header.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DiskHeader {
    pub signature: [u8; 7],
    pub version: u8,
    /// Byte offset of the data index region.
    pub index_data_start: u64,
    /// Allocated size of the data index region.
    pub index_data_size: u64,
    /// Byte offset of the DD region.
    pub dd_data_start: u64,
    /// Allocated size of the DD region.
    pub dd_data_size: u64,
    /// Byte offset of the major-block area.
    pub major_data_start: u64,
    /// End of the used portion of the file.
    pub total_data_size: u64,
    /// Captured BPM ids, bit 0 of word 0 being id 0.
    pub archive_mask: [u32; 8],
    /// Number of ids selected by the mask.
    pub archive_mask_count: u32,
    /// Frames delivered per ring slot.
    pub input_frame_count: u32,
    /// First decimation factor.
    pub first_decimation: u32,
    /// Second decimation factor.
    pub second_decimation: u32,
    /// FA samples per BPM per major block.
    pub major_sample_count: u32,
    /// First-decimated samples per BPM per major block.
    pub d_sample_count: u32,
    /// DD samples per BPM per major block.
    pub dd_sample_count: u32,
    /// DD samples per BPM across the whole archive.
    pub dd_total_count: u32,
    /// Bytes occupied by one major block on disk.
    pub major_block_size: u32,
    /// Number of major blocks in the round-robin area.
    pub major_block_count: u32,
    /// Block currently being filled.  Blocks logically after this one, in
    /// circular order, are the oldest data.
    pub current_major_block: u32,
    /// Smoothed duration of the last completed block in microseconds.
    pub last_duration: u32,
    /// id 0 x reading at the start of the current block.
    pub id_zero_anchor: i32,
    /// Peak capture backlog in bytes since the previous block was consumed,
    /// for status reporting.
    pub write_backlog: u32,
    /// Size of the disk write currently in progress, zero when idle.
    pub write_buffer: u32,
    _pad: u32,
}

const _: () = assert!(std::mem::size_of::<DiskHeader>() == 152);
const _: () = assert!(std::mem::size_of::<DiskHeader>() <= HEADER_SIZE);

fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

fn check(ok: bool, message: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(FaError::InvalidHeader(message.to_string()))
    }
}

impl DiskHeader {
    /// Computes the archive geometry for a fresh archive.
    ///
    /// The major-block count is fitted to the file: starting from the count
    /// ignoring region rounding, it is reduced until header, index, DD and
    /// major areas all fit inside `file_size`.
    pub fn initialise(params: &HeaderParams) -> Result<DiskHeader> {
        let mask_count = params.archive_mask.count() as u32;
        check(mask_count > 0, "Archive mask selects no BPMs")?;
        check(
            params.input_frame_count > 0
                && params.major_sample_count % params.input_frame_count == 0,
            "Input block count must divide major block size",
        )?;
        check(
            params.first_decimation > 1
                && params.input_frame_count % params.first_decimation == 0,
            "First decimation must divide the input block",
        )?;
        check(params.second_decimation > 1, "Second decimation too small")?;
        check(
            params.major_sample_count
                % (params.first_decimation * params.second_decimation)
                == 0,
            "Decimation must divide major block size",
        )?;
        check(
            params.sample_frequency > 0.0,
            "Sample frequency must be positive",
        )?;

        let major_sample_count = params.major_sample_count;
        let d_sample_count = major_sample_count / params.first_decimation;
        let dd_sample_count = d_sample_count / params.second_decimation;
        let major_block_size = mask_count
            * (major_sample_count * FA_ENTRY_SIZE as u32
                + d_sample_count * DECIMATED_SIZE as u32);
        check(
            major_block_size as usize % crate::aligned::page_size() == 0,
            "Major block size is not page aligned",
        )?;

        let dd_block_bytes = dd_sample_count as u64 * mask_count as u64 * DECIMATED_SIZE as u64;
        let data_size = params
            .file_size
            .checked_sub(HEADER_SIZE as u64)
            .ok_or_else(|| FaError::InvalidHeader("File smaller than header".to_string()))?;

        // Initial estimate ignores region rounding, then shrinks to fit.
        let mut count =
            data_size / (INDEX_RECORD_SIZE as u64 + dd_block_bytes + major_block_size as u64);
        let (index_data_size, dd_data_size) = loop {
            check(count >= 2, "File too small for two major blocks")?;
            let index_size = round_up(count * INDEX_RECORD_SIZE as u64, REGION_ALIGN);
            let dd_size = round_up(count * dd_block_bytes, REGION_ALIGN);
            if index_size + dd_size + count * major_block_size as u64 <= data_size {
                break (index_size, dd_size);
            }
            count -= 1;
        };

        let index_data_start = HEADER_SIZE as u64;
        let dd_data_start = index_data_start + index_data_size;
        let major_data_start = dd_data_start + dd_data_size;
        let total_data_size = major_data_start + count * major_block_size as u64;

        Ok(DiskHeader {
            signature: SIGNATURE,
            version: VERSION,
            index_data_start,
            index_data_size,
            dd_data_start,
            dd_data_size,
            major_data_start,
            total_data_size,
            archive_mask: params.archive_mask.words(),
            archive_mask_count: mask_count,
            input_frame_count: params.input_frame_count,
            first_decimation: params.first_decimation,
            second_decimation: params.second_decimation,
            major_sample_count,
            d_sample_count,
            dd_sample_count,
            dd_total_count: count as u32 * dd_sample_count,
            major_block_size,
            major_block_count: count as u32,
            current_major_block: 0,
            last_duration: (major_sample_count as f64 * 1e6 / params.sample_frequency).round()
                as u32,
            id_zero_anchor: 0,
            write_backlog: 0,
            write_buffer: 0,
            _pad: 0,
        })
    }

    /// Structural validation of a header read back from disk.
    pub fn validate(&self, file_size: u64) -> Result<()> {
        check(self.signature == SIGNATURE, "Invalid signature")?;
        check(self.version == VERSION, "Unsupported version")?;
        check(
            self.archive_mask_count == self.mask().count() as u32
                && self.archive_mask_count > 0,
            "Mask count does not match mask",
        )?;
        check(
            self.input_frame_count > 0
                && self.major_sample_count % self.input_frame_count == 0,
            "Input block count must divide major block size",
        )?;
        check(
            self.first_decimation > 1
                && self.second_decimation > 1
                && self.major_sample_count
                    == self.d_sample_count * self.first_decimation
                && self.d_sample_count == self.dd_sample_count * self.second_decimation,
            "Inconsistent decimation counts",
        )?;
        check(
            self.major_block_size
                == self.archive_mask_count
                    * (self.major_sample_count * FA_ENTRY_SIZE as u32
                        + self.d_sample_count * DECIMATED_SIZE as u32),
            "Invalid major block size",
        )?;
        check(
            self.major_block_size as usize % crate::aligned::page_size() == 0,
            "Major block size is not page aligned",
        )?;
        check(self.major_block_count >= 2, "Too few major blocks")?;
        check(
            self.dd_total_count == self.major_block_count * self.dd_sample_count,
            "Invalid DD total count",
        )?;
        check(
            self.index_data_start == HEADER_SIZE as u64
                && self.index_data_size % REGION_ALIGN == 0
                && self.index_data_size
                    >= self.major_block_count as u64 * INDEX_RECORD_SIZE as u64,
            "Invalid index region",
        )?;
        check(
            self.dd_data_start == self.index_data_start + self.index_data_size
                && self.dd_data_size % REGION_ALIGN == 0
                && self.dd_data_size
                    >= self.major_block_count as u64
                        * self.dd_sample_count as u64
                        * self.archive_mask_count as u64
                        * DECIMATED_SIZE as u64,
            "Invalid DD region",
        )?;
        check(
            self.major_data_start == self.dd_data_start + self.dd_data_size
                && self.total_data_size
                    == self.major_data_start
                        + self.major_block_count as u64 * self.major_block_size as u64,
            "Invalid major data region",
        )?;
        check(self.total_data_size <= file_size, "File truncated")?;
        check(
            self.current_major_block < self.major_block_count,
            "Current block out of range",
        )?;
        Ok(())
    }

    /// The archive's BPM selection.
    pub fn mask(&self) -> BpmMask {
        BpmMask::from_words(self.archive_mask)
    }

    /// Number of ring slots that make up one major block.
    pub fn input_block_count(&self) -> u32 {
        self.major_sample_count / self.input_frame_count
    }

    /// Bytes delivered per ring slot.
    pub fn input_block_size(&self) -> usize {
        self.input_frame_count as usize * FA_FRAME_SIZE
    }

    /// Byte offset of a major block within the file.
    pub fn major_data_offset(&self, block: u32) -> u64 {
        debug_assert!(block < self.major_block_count);
        self.major_data_start + block as u64 * self.major_block_size as u64
    }

    /// Bytes of transposed FA columns at the start of each major block.
    pub fn fa_area_size(&self) -> usize {
        self.archive_mask_count as usize * self.major_sample_count as usize * FA_ENTRY_SIZE
    }

    /// Byte offset, within a major block, of the FA column for the `w`-th
    /// masked BPM.
    pub fn fa_offset(&self, w: usize) -> usize {
        debug_assert!(w < self.archive_mask_count as usize);
        w * self.major_sample_count as usize * FA_ENTRY_SIZE
    }

    /// Byte offset, within a major block, of the first-decimation column for
    /// the `w`-th masked BPM.
    pub fn d_offset(&self, w: usize) -> usize {
        debug_assert!(w < self.archive_mask_count as usize);
        self.fa_area_size() + w * self.d_sample_count as usize * DECIMATED_SIZE
    }

    /// Index into the mmap'd DD sample array for the `w`-th masked BPM at
    /// `slot` within `block`.  DD data is laid out per BPM, each BPM's
    /// samples circularly ordered by block.
    pub fn dd_index(&self, w: usize, block: u32, slot: u32) -> usize {
        debug_assert!(w < self.archive_mask_count as usize);
        debug_assert!(block < self.major_block_count && slot < self.dd_sample_count);
        w * self.dd_total_count as usize
            + block as usize * self.dd_sample_count as usize
            + slot as usize
    }

    /// Number of DD samples held in the mapped DD array.
    pub fn dd_array_len(&self) -> usize {
        self.archive_mask_count as usize * self.dd_total_count as usize
    }
}

impl fmt::Display for DiskHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FA archive v{}", self.version)?;
        writeln!(
            f,
            "  capturing {} BPMs, mask {}",
            self.archive_mask_count,
            self.mask().format_raw()
        )?;
        writeln!(
            f,
            "  {} major blocks of {} samples ({} bytes each)",
            self.major_block_count, self.major_sample_count, self.major_block_size
        )?;
        writeln!(
            f,
            "  decimation {}:{}, {} + {} decimated samples per block",
            self.first_decimation,
            self.second_decimation,
            self.d_sample_count,
            self.dd_sample_count
        )?;
        writeln!(
            f,
            "  index at {:#x} ({} bytes), DD at {:#x} ({} bytes), data at {:#x}",
            self.index_data_start,
            self.index_data_size,
            self.dd_data_start,
            self.dd_data_size,
            self.major_data_start
        )?;
        write!(
            f,
            "  current block {}, last duration {} us",
            self.current_major_block, self.last_duration
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn small_params() -> HeaderParams {
        HeaderParams {
            file_size: 64 << 20,
            archive_mask: BpmMask::parse_ids("0-15").unwrap(),
            major_sample_count: 16384,
            input_frame_count: 256,
            first_decimation: 64,
            second_decimation: 4,
            sample_frequency: 10_072.0,
        }
    }

    #[test]
    fn initialise_produces_valid_header() {
        let params = small_params();
        let header = DiskHeader::initialise(&params).unwrap();
        header.validate(params.file_size).unwrap();
        assert_eq!(header.d_sample_count, 256);
        assert_eq!(header.dd_sample_count, 64);
        assert_eq!(header.input_block_count(), 64);
        assert!(header.major_block_count >= 2);
        assert!(header.total_data_size <= params.file_size);
        // 16 BPMs * (16384 * 8 + 256 * 32) bytes.
        assert_eq!(header.major_block_size, 16 * (16384 * 8 + 256 * 32));
    }

    #[test]
    fn regions_do_not_overlap() {
        let params = small_params();
        let header = DiskHeader::initialise(&params).unwrap();
        assert_eq!(header.index_data_start, HEADER_SIZE as u64);
        assert!(header.index_data_size % REGION_ALIGN == 0);
        assert!(header.dd_data_size % REGION_ALIGN == 0);
        assert_eq!(
            header.dd_data_start,
            header.index_data_start + header.index_data_size
        );
        assert_eq!(
            header.major_data_start,
            header.dd_data_start + header.dd_data_size
        );
    }

    #[test]
    fn rejects_undersized_file() {
        let params = HeaderParams {
            file_size: 2 << 20,
            ..small_params()
        };
        assert!(DiskHeader::initialise(&params).is_err());
    }

    #[test]
    fn rejects_bad_decimation() {
        let params = HeaderParams {
            first_decimation: 7,
            ..small_params()
        };
        assert!(DiskHeader::initialise(&params).is_err());
    }

    #[test]
    fn validate_catches_corruption() {
        let params = small_params();
        let mut header = DiskHeader::initialise(&params).unwrap();
        header.signature[0] = b'X';
        assert!(header.validate(params.file_size).is_err());

        let mut header = DiskHeader::initialise(&params).unwrap();
        header.current_major_block = header.major_block_count;
        assert!(header.validate(params.file_size).is_err());

        let header = DiskHeader::initialise(&params).unwrap();
        assert!(header.validate(header.total_data_size - 1).is_err());
    }

    #[test]
    fn block_offsets_are_direct_io_aligned() {
        let params = small_params();
        let header = DiskHeader::initialise(&params).unwrap();
        let page = crate::aligned::page_size() as u64;
        for block in [0, 1, header.major_block_count - 1] {
            assert_eq!(header.major_data_offset(block) % page, 0);
        }
    }

    #[test]
    fn column_offsets_partition_the_block() {
        let params = small_params();
        let header = DiskHeader::initialise(&params).unwrap();
        let last = header.archive_mask_count as usize - 1;
        assert_eq!(header.fa_offset(0), 0);
        assert_eq!(
            header.fa_offset(last) + header.major_sample_count as usize * FA_ENTRY_SIZE,
            header.fa_area_size()
        );
        assert_eq!(
            header.d_offset(last) + header.d_sample_count as usize * DECIMATED_SIZE,
            header.major_block_size as usize
        );
    }
}
