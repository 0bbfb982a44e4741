//! Payload handling module.
//!
//! Provides loading and chunk planning for images sent to the device.

pub mod image;

pub use image::{Chunk, ChunkIterator, ChunkPlan, FirmwareImage};
