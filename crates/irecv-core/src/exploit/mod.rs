//! Code-execution exploits for locked bootloaders.
//!
//! - [`models`]: supported device models and their heap constants
//! - [`limera1n`]: the heap-grooming sequence itself

pub mod limera1n;
pub mod models;

pub use limera1n::{ExploitReport, limera1n};
pub use models::{ModelProfile, SUPPORTED_MODELS};
