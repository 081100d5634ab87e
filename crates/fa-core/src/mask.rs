//! 256-bit BPM selection mask.
//!
//! Masks select which BPM ids an archive captures and which ids a subscriber
//! or historical read returns.  Two textual forms are accepted: a list of
//! comma separated ids or id ranges (`"1,3,10-20"`), and a raw form of 64
//! hexadecimal digits with bit 255 first (`"FFFF…FF"`).

use crate::error::{FaError, Result};
use crate::frame::{entries_of, entry_bytes, FaEntry, FA_ENTRY_COUNT};

const MASK_WORDS: usize = FA_ENTRY_COUNT / 32;

/// Number of characters in the raw hexadecimal form.
pub const RAW_MASK_CHARS: usize = FA_ENTRY_COUNT / 4;

/// Bit mask of BPM ids, one bit per id 0..255.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BpmMask {
    words: [u32; MASK_WORDS],
}

impl BpmMask {
    /// The empty mask.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Mask selecting every BPM id.
    pub fn full() -> Self {
        BpmMask {
            words: [u32::MAX; MASK_WORDS],
        }
    }

    pub fn set(&mut self, id: usize) {
        debug_assert!(id < FA_ENTRY_COUNT);
        self.words[id >> 5] |= 1 << (id & 0x1f);
    }

    pub fn test(&self, id: usize) -> bool {
        debug_assert!(id < FA_ENTRY_COUNT);
        self.words[id >> 5] & (1 << (id & 0x1f)) != 0
    }

    /// Number of ids selected.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates the selected ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = usize> + '_ {
        (0..FA_ENTRY_COUNT).filter(move |&id| self.test(id))
    }

    /// True if every id selected here is also selected in `other`.
    pub fn subset_of(&self, other: &BpmMask) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & !b == 0)
    }

    /// Raw mask words, bit 0 of word 0 being BPM id 0.  Used to embed the
    /// mask in the on-disk header.
    pub fn words(&self) -> [u32; MASK_WORDS] {
        self.words
    }

    pub fn from_words(words: [u32; MASK_WORDS]) -> Self {
        BpmMask { words }
    }

    /// Formats the raw hexadecimal form, most significant id first.
    pub fn format_raw(&self) -> String {
        let mut out = String::with_capacity(RAW_MASK_CHARS);
        for word in self.words.iter().rev() {
            out.push_str(&format!("{word:08X}"));
        }
        out
    }

    /// Parses the id-list form: `mask = entry ["," mask]`,
    /// `entry = id | id "-" id`.
    pub fn parse_ids(input: &str) -> Result<Self> {
        let mut mask = BpmMask::empty();
        let mut rest = input;
        loop {
            let (first, tail) = parse_id(input, rest)?;
            rest = tail;
            if let Some(tail) = rest.strip_prefix('-') {
                let (last, tail) = parse_id(input, tail)?;
                rest = tail;
                if last < first {
                    return Err(FaError::parse("mask", "Empty id range", input, rest));
                }
                for id in first..=last {
                    mask.set(id);
                }
            } else {
                mask.set(first);
            }
            match rest.strip_prefix(',') {
                Some(tail) => rest = tail,
                None => break,
            }
        }
        if !rest.is_empty() {
            return Err(FaError::parse("mask", "Unexpected characters", input, rest));
        }
        Ok(mask)
    }

    /// Parses the raw form: exactly 64 hexadecimal digits, bit 255 first.
    pub fn parse_raw(input: &str) -> Result<Self> {
        if input.len() != RAW_MASK_CHARS || !input.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FaError::parse(
                "mask",
                format!("Expected {RAW_MASK_CHARS} hex digits"),
                input,
                "",
            ));
        }
        let mut words = [0u32; MASK_WORDS];
        for (i, chunk) in input.as_bytes().chunks(8).enumerate() {
            let text = std::str::from_utf8(chunk).map_err(|_| {
                FaError::parse("mask", "Invalid UTF-8 in mask", input, "")
            })?;
            let word = u32::from_str_radix(text, 16)
                .map_err(|e| FaError::parse("mask", e.to_string(), input, ""))?;
            words[MASK_WORDS - 1 - i] = word;
        }
        Ok(BpmMask { words })
    }

    /// Copies one FA frame, keeping only the selected ids.  Returns the
    /// number of bytes written; the output must hold `8 * count()` bytes.
    pub fn copy_frame(&self, out: &mut [u8], frame: &[u8]) -> usize {
        let entries = entries_of(frame);
        let mut written = 0;
        for id in self.ids() {
            let bytes = entry_bytes(std::slice::from_ref(&entries[id]));
            out[written..written + bytes.len()].copy_from_slice(bytes);
            written += bytes.len();
        }
        written
    }

    /// As [`copy_frame`](Self::copy_frame) but collecting the selected
    /// entries.  Convenient for tests.
    pub fn filter_frame(&self, frame: &[u8]) -> Vec<FaEntry> {
        let entries = entries_of(frame);
        self.ids().map(|id| entries[id]).collect()
    }
}

fn parse_id<'a>(input: &str, rest: &'a str) -> Result<(usize, &'a str)> {
    let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return Err(FaError::parse("mask", "Number missing", input, rest));
    }
    let id: usize = rest[..digits]
        .parse()
        .map_err(|e: std::num::ParseIntError| FaError::parse("mask", e.to_string(), input, rest))?;
    if id >= FA_ENTRY_COUNT {
        return Err(FaError::parse(
            "mask",
            format!("id {id} out of range"),
            input,
            rest,
        ));
    }
    Ok((id, &rest[digits..]))
}
