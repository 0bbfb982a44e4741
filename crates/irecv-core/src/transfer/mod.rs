//! Chunked image transfer.
//!
//! - [`machine`]: per-transfer state and bookkeeping
//! - [`engine`]: the mode-aware transfer driver

pub mod engine;
pub mod machine;

pub use engine::{TransferEngine, TransferFlavor, TransferReport};
pub use machine::{TransferSession, TransferState};
