//! Core types and support code for the FA archiver.
//!
//! Everything in this crate is independent of the archive file format and of
//! the capture pipeline: the FA frame and decimated sample layouts, the
//! 256-bit BPM selection mask, wall-clock timestamp helpers, the shared error
//! type and the typed daemon configuration.

pub mod config;
pub mod error;
pub mod frame;
pub mod mask;
pub mod timing;

pub use error::{FaError, Result};
pub use frame::{DecimatedSample, FaEntry, FA_ENTRY_COUNT, FA_ENTRY_SIZE, FA_FRAME_SIZE};
pub use mask::BpmMask;
pub use timing::Timestamp;
