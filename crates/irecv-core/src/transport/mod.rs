//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockBus, MockTransport, Transfer};
pub use nusb::{NusbBus, NusbTransport};
pub use traits::{ControlSetup, TransportError, UsbBus, UsbTransport};
