//! Wire-level constants for the Apple mobile bootloader USB protocol.
//!
//! The request type bytes are the raw `bmRequestType` values the bootloader
//! firmware expects and must not be rebuilt from their bit fields.

use std::time::Duration;

pub const APPLE_VENDOR_ID: u16 = 0x05AC;

// Product ids, in probe priority order
pub const RECOVERY_PRODUCT_ID: u16 = 0x1281;
pub const WTF_PRODUCT_ID: u16 = 0x1227;
pub const DFU_PRODUCT_ID: u16 = 0x1222;

// bmRequestType values
pub const REQ_TYPE_CLASS_OUT: u8 = 0x21; // host-to-device, class, interface
pub const REQ_TYPE_CLASS_IN: u8 = 0xA1; // device-to-host, class, interface
pub const REQ_TYPE_VENDOR_OUT: u8 = 0x40; // host-to-device, vendor, device
pub const REQ_TYPE_VENDOR_IFACE_OUT: u8 = 0x41; // host-to-device, vendor, interface
pub const REQ_TYPE_VENDOR_IN: u8 = 0xC0; // device-to-host, vendor, device

// DFU class requests
pub const DFU_DNLOAD: u8 = 1;
pub const DFU_EXECUTE: u8 = 2;
pub const DFU_GETSTATUS: u8 = 3;
pub const DFU_CLRSTATUS: u8 = 4;
pub const DFU_GETSTATE: u8 = 5;

// Vendor requests (Recovery)
pub const RECOVERY_COMMAND: u8 = 0;
pub const RECOVERY_INITIATE: u8 = 0;
pub const RECOVERY_GETENV: u8 = 0;

// Endpoints
pub const RECOVERY_BULK_OUT: u8 = 0x04;
pub const RECOVERY_BULK_IN: u8 = 0x81;

// Packet sizes
pub const RECOVERY_PACKET_SIZE: usize = 0x8000;
pub const DFU_PACKET_SIZE: usize = 0x800;

/// Length of a DFU GETSTATUS response.
pub const STATUS_RESPONSE_LEN: u16 = 6;
/// Offset of the state byte inside a GETSTATUS response.
pub const STATUS_STATE_OFFSET: usize = 4;

/// Text commands are NUL-terminated and must fit in 0x200 bytes.
pub const MAX_COMMAND_LEN: usize = 0x200;
pub const GETENV_RESPONSE_LEN: u16 = 0x100;
pub const GETRET_RESPONSE_LEN: u16 = 4;
pub const CONSOLE_BUFFER_SIZE: usize = 0x10000;

pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_STATUS_RETRIES: u32 = 20;
