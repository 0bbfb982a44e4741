//! Error types for core operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::mode::DeviceMode;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum IrecvError {
    #[error("No device found in Recovery, WTF or DFU mode")]
    DeviceNotFound,

    #[error("USB transfer timed out after {timeout_ms}ms")]
    TransportTimeout { timeout_ms: u64 },

    #[error("Short transfer: expected {expected} bytes, device took {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    /// `actual` is `None` when the status read itself was malformed.
    #[error("Status mismatch: expected {expected}, got {}", fmt_status(.actual))]
    StatusMismatch { expected: u8, actual: Option<u8> },

    #[error("Unsupported device model: {0}")]
    UnsupportedModel(String),

    #[error("Operation requires {expected} mode, device is in {actual} mode")]
    WrongMode {
        expected: DeviceMode,
        actual: DeviceMode,
    },

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Unable to allocate {len} bytes")]
    AllocationFailure { len: usize },

    #[error("Image is empty")]
    EmptyImage,

    #[error("Image needs {chunks} chunks, more than the protocol can index")]
    ImageTooLarge { chunks: usize },

    #[error("Command is too long: {len} bytes (max {max})")]
    CommandTooLong { len: usize, max: usize },

    #[error("Shellcode is too large: {len} bytes (max {max})")]
    ShellcodeTooLarge { len: usize, max: usize },

    #[error("Device did not come back after reset")]
    ReconnectFailed,

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_status(status: &Option<u8>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "malformed response".to_string(),
    }
}

impl From<TransportError> for IrecvError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout { timeout_ms } => IrecvError::TransportTimeout { timeout_ms },
            other => IrecvError::Transport(other),
        }
    }
}

pub type Result<T, E = IrecvError> = std::result::Result<T, E>;
