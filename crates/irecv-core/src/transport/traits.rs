//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for talking to an opened device and the
//! `UsbBus` trait for opening one, allowing different implementations
//! (nusb, mock, etc.).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Reset failed: {0}")]
    ResetFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Setup packet fields of a control transfer.
///
/// `request_type` is the raw `bmRequestType`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    pub const fn new(request_type: u8, request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
        }
    }
}

impl fmt::Debug for ControlSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ControlSetup(0x{:02X}, {}, {}, {})",
            self.request_type, self.request, self.value, self.index
        )
    }
}

/// Abstract USB transport interface for one opened device.
///
/// Dropping the transport closes the device handle.
pub trait UsbTransport: Send + Sync {
    /// Host-to-device control transfer. Returns the number of bytes sent.
    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Device-to-host control transfer of up to `length` bytes.
    fn control_in(
        &self,
        setup: ControlSetup,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Write to a bulk OUT endpoint. Returns the number of bytes sent.
    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration)
    -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes from a bulk IN endpoint.
    fn bulk_in(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Issue a USB port reset.
    fn reset(&self) -> Result<(), TransportError>;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}

/// Opens devices by vendor and product id.
pub trait UsbBus {
    type Transport: UsbTransport;

    /// Open the first device matching `vid`/`pid`, or `Ok(None)` when no such
    /// device is attached.
    fn open(&self, vid: u16, pid: u16) -> Result<Option<Self::Transport>, TransportError>;
}
