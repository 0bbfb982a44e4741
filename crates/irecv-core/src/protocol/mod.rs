//! Protocol module - bootloader wire definitions.

pub mod constants;
pub mod status;

pub use constants::*;
pub use status::StatusCode;
