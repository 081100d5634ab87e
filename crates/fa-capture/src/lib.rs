//! Capture pipeline.
//!
//! Frames enter through a [`source::BlockSource`], land in the in-RAM
//! [`ring::Ring`] one input block at a time, and are fanned out to
//! subscribers and to the [`transform::Transform`], which transposes them
//! into major blocks, decimates them and hands completed blocks to the disk
//! writer.

pub mod ring;
pub mod source;
pub mod transform;

pub use ring::{ReadOutcome, Reader, ReservedOutcome, Ring, RingWriter};
pub use source::{run_capture, BlockSource, DeviceSource, SourceStatus, SyntheticSource};
pub use transform::Transform;
