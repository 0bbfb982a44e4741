//! Bootloader mode detection and per-mode transfer profiles.

use std::fmt;

use tracing::{debug, info, instrument};

use crate::protocol::constants::*;
use crate::transport::{TransportError, UsbBus};

/// Bootloader state the device presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceMode {
    Recovery,
    Wtf,
    Dfu,
    #[default]
    Unknown,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::Recovery => write!(f, "Recovery"),
            DeviceMode::Wtf => write!(f, "WTF"),
            DeviceMode::Dfu => write!(f, "DFU"),
            DeviceMode::Unknown => write!(f, "Unknown"),
        }
    }
}

/// How chunks travel to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Continuous stream on a bulk endpoint; errors surface synchronously.
    Bulk { endpoint: u8 },
    /// Discrete, individually acknowledged class control writes.
    Control,
}

/// Everything the transfer engine needs to know about a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeProfile {
    pub packet_size: usize,
    pub transport: TransportKind,
    /// Append the integrity trailer to the final chunk.
    pub trailer: bool,
    /// Poll GETSTATUS after every chunk.
    pub status_poll: bool,
    /// Send the zero-length finalize request and confirm the stage markers.
    pub finalize: bool,
}

impl ModeProfile {
    const RECOVERY: Self = Self {
        packet_size: RECOVERY_PACKET_SIZE,
        transport: TransportKind::Bulk {
            endpoint: RECOVERY_BULK_OUT,
        },
        trailer: false,
        status_poll: false,
        finalize: false,
    };

    const CONTROL: Self = Self {
        packet_size: DFU_PACKET_SIZE,
        transport: TransportKind::Control,
        trailer: true,
        status_poll: true,
        finalize: true,
    };
}

impl DeviceMode {
    /// Probe order used by [`detect`].
    pub const PRIORITY: [DeviceMode; 3] = [DeviceMode::Recovery, DeviceMode::Wtf, DeviceMode::Dfu];

    pub fn product_id(&self) -> Option<u16> {
        match self {
            DeviceMode::Recovery => Some(RECOVERY_PRODUCT_ID),
            DeviceMode::Wtf => Some(WTF_PRODUCT_ID),
            DeviceMode::Dfu => Some(DFU_PRODUCT_ID),
            DeviceMode::Unknown => None,
        }
    }

    pub fn from_product_id(pid: u16) -> Self {
        match pid {
            RECOVERY_PRODUCT_ID => DeviceMode::Recovery,
            WTF_PRODUCT_ID => DeviceMode::Wtf,
            DFU_PRODUCT_ID => DeviceMode::Dfu,
            _ => DeviceMode::Unknown,
        }
    }

    /// Transfer profile, or `None` for `Unknown`.
    pub fn profile(&self) -> Option<ModeProfile> {
        match self {
            DeviceMode::Recovery => Some(ModeProfile::RECOVERY),
            DeviceMode::Wtf | DeviceMode::Dfu => Some(ModeProfile::CONTROL),
            DeviceMode::Unknown => None,
        }
    }
}

/// Probe the bus for Recovery, then WTF, then DFU and return the first
/// device that opens along with its mode. Later modes are not probed once
/// one succeeds.
#[instrument(skip(bus), level = "debug")]
pub fn detect<B: UsbBus>(bus: &B) -> Result<(DeviceMode, Option<B::Transport>), TransportError> {
    for mode in DeviceMode::PRIORITY {
        let Some(pid) = mode.product_id() else {
            continue;
        };
        debug!(mode = %mode, pid = %format!("{:04X}", pid), "Probing");
        if let Some(transport) = bus.open(APPLE_VENDOR_ID, pid)? {
            info!(mode = %mode, "Found device");
            return Ok((mode, Some(transport)));
        }
    }
    Ok((DeviceMode::Unknown, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockBus;

    #[test]
    fn test_detect_falls_through_to_dfu() {
        let bus = MockBus::with_attached(&[DFU_PRODUCT_ID]);
        let (mode, transport) = detect(&bus).unwrap();
        assert_eq!(mode, DeviceMode::Dfu);
        assert!(transport.is_some());
        assert_eq!(
            bus.probes(),
            vec![RECOVERY_PRODUCT_ID, WTF_PRODUCT_ID, DFU_PRODUCT_ID]
        );
    }

    #[test]
    fn test_detect_stops_at_first_match() {
        let bus = MockBus::with_attached(&[RECOVERY_PRODUCT_ID, DFU_PRODUCT_ID]);
        let (mode, _) = detect(&bus).unwrap();
        assert_eq!(mode, DeviceMode::Recovery);
        assert_eq!(bus.probes(), vec![RECOVERY_PRODUCT_ID]);
        assert_eq!(bus.opened().len(), 1);
    }

    #[test]
    fn test_detect_nothing_attached() {
        let bus = MockBus::new();
        let (mode, transport) = detect(&bus).unwrap();
        assert_eq!(mode, DeviceMode::Unknown);
        assert!(transport.is_none());
    }

    #[test]
    fn test_profiles() {
        let recovery = DeviceMode::Recovery.profile().unwrap();
        assert_eq!(recovery.packet_size, 0x8000);
        assert_eq!(recovery.transport, TransportKind::Bulk { endpoint: 0x04 });
        assert!(!recovery.trailer && !recovery.status_poll && !recovery.finalize);

        for mode in [DeviceMode::Dfu, DeviceMode::Wtf] {
            let profile = mode.profile().unwrap();
            assert_eq!(profile.packet_size, 0x800);
            assert_eq!(profile.transport, TransportKind::Control);
            assert!(profile.trailer && profile.status_poll && profile.finalize);
        }

        assert!(DeviceMode::Unknown.profile().is_none());
    }
}
