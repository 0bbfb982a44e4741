//! irecv-core: Apple mobile bootloader (Recovery/WTF/DFU) client in Rust.
//!
//! This crate pushes images into device memory over USB while the device
//! sits in one of its low-level recovery states, and runs the limera1n
//! heap-grooming sequence against locked WTF-mode bootloaders.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Wire constants and status codes
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Mode**: Mode detection and per-mode transfer profiles
//! - **Trailer**: Integrity trailer appended to DFU/WTF images
//! - **Transfer**: Chunked transfer state machine and engine
//! - **Exploit**: limera1n sequencer and supported model table
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Owns the device handle and exposes every operation
//!
//! # Example
//!
//! ```no_run
//! use irecv_core::session::{DeviceSession, SessionConfig};
//! use irecv_core::transport::NusbBus;
//!
//! let mut session = DeviceSession::connect(&NusbBus, SessionConfig::default())
//!     .expect("no device");
//! session.send_file("iBSS.img3").expect("transfer failed");
//! ```

pub mod error;
pub mod events;
pub mod exploit;
pub mod mode;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod trailer;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use error::{IrecvError, Result};
pub use events::{IrecvEvent, IrecvObserver, IrecvPhase, LogLevel, NullObserver, TracingObserver};
pub use exploit::{ExploitReport, ModelProfile, limera1n};
pub use mode::{DeviceMode, ModeProfile, TransportKind, detect};
pub use payload::{Chunk, ChunkPlan, FirmwareImage};
pub use protocol::StatusCode;
pub use session::{DeviceSession, SessionConfig};
pub use trailer::{TrailerCodec, image_checksum, image_trailer};
pub use transfer::{TransferEngine, TransferFlavor, TransferReport, TransferState};
pub use transport::{
    MockBus, MockTransport, NusbBus, NusbTransport, TransportError, UsbBus, UsbTransport,
};
