//! nusb-based USB transport implementation.

use std::time::Duration;

use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient, TransferError,
};
use nusb::{Device, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{ControlSetup, TransportError, UsbBus, UsbTransport};
use crate::protocol::constants::RECOVERY_PRODUCT_ID;

/// Interface carrying the control pipe used by every mode.
const CONTROL_INTERFACE: u8 = 0;
/// Interface (alt setting 1) carrying the Recovery bulk endpoints.
const BULK_INTERFACE: u8 = 1;
const BULK_ALT_SETTING: u8 = 1;

/// nusb-based USB transport.
pub struct NusbTransport {
    device: Device,
    control: Interface,
    bulk: Option<Interface>,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Option<Self>, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid);

        match device_info {
            Some(info) => Self::open_device_info(info).map(Some),
            None => {
                debug!("No matching device attached");
                Ok(None)
            }
        }
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        // Some hosts have already configured the device; a failure here is
        // not fatal as long as the interface can be claimed.
        if let Err(e) = device.set_configuration(1).wait() {
            debug!(error = %e, "Set configuration failed");
        }

        let control = device
            .claim_interface(CONTROL_INTERFACE)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: CONTROL_INTERFACE,
                message: e.to_string(),
            })?;

        let bulk = if pid == RECOVERY_PRODUCT_ID {
            Self::claim_bulk_interface(&device)
        } else {
            None
        };

        info!(bulk = bulk.is_some(), "Device opened successfully");

        Ok(Self {
            device,
            control,
            bulk,
            vid,
            pid,
        })
    }

    fn claim_bulk_interface(device: &Device) -> Option<Interface> {
        let interface = match device.claim_interface(BULK_INTERFACE).wait() {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "Could not claim bulk interface");
                return None;
            }
        };
        if let Err(e) = interface.set_alt_setting(BULK_ALT_SETTING).wait() {
            warn!(error = %e, "Could not select bulk alt setting");
            return None;
        }
        Some(interface)
    }

    fn bulk_interface(&self) -> Result<&Interface, TransportError> {
        self.bulk.as_ref().ok_or_else(|| {
            TransportError::ClaimInterfaceFailed {
                interface: BULK_INTERFACE,
                message: "bulk interface not available in this mode".into(),
            }
        })
    }
}

/// Split a raw `bmRequestType` into nusb's typed fields.
fn decode_request_type(request_type: u8) -> (ControlType, Recipient) {
    let control_type = match (request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        _ => ControlType::Vendor,
    };
    let recipient = match request_type & 0x1F {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        _ => Recipient::Other,
    };
    (control_type, recipient)
}

fn map_transfer_error(e: TransferError, timeout: Duration, write: bool) -> TransportError {
    match e {
        TransferError::Cancelled => TransportError::timeout(timeout),
        TransferError::Disconnected => TransportError::Disconnected,
        other if write => TransportError::WriteFailed(other.to_string()),
        other => TransportError::ReadFailed(other.to_string()),
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let (control_type, recipient) = decode_request_type(setup.request_type);
        self.control
            .control_out(
                ControlOut {
                    control_type,
                    recipient,
                    request: setup.request,
                    value: setup.value,
                    index: setup.index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(e, timeout, true))?;

        debug!(bytes_written = data.len(), "Control write complete");
        Ok(data.len())
    }

    #[instrument(skip(self))]
    fn control_in(
        &self,
        setup: ControlSetup,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let (control_type, recipient) = decode_request_type(setup.request_type);
        let data = self
            .control
            .control_in(
                ControlIn {
                    control_type,
                    recipient,
                    request: setup.request,
                    value: setup.value,
                    index: setup.index,
                    length,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(e, timeout, false))?;

        debug!(bytes_read = data.len(), "Control read complete");
        Ok(data)
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn bulk_out(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut ep = self
            .bulk_interface()?
            .endpoint::<Bulk, Out>(endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut out_buf = Buffer::new(data.len());
        out_buf.extend_from_slice(data);

        let completion = ep.transfer_blocking(out_buf, timeout);
        let written = completion.actual_len;
        completion
            .into_result()
            .map_err(|e| map_transfer_error(e, timeout, true))?;

        debug!(bytes_written = written, "Bulk write complete");
        Ok(written)
    }

    #[instrument(skip(self))]
    fn bulk_in(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut ep = self
            .bulk_interface()?
            .endpoint::<Bulk, In>(endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        // Request length must be a multiple of the max packet size
        let max_packet_size = ep.max_packet_size();
        let aligned_len = max_len.div_ceil(max_packet_size) * max_packet_size;
        let mut in_buf = Buffer::new(aligned_len);
        in_buf.set_requested_len(aligned_len);

        let completion = ep.transfer_blocking(in_buf, timeout);
        let data = completion
            .into_result()
            .map_err(|e| map_transfer_error(e, timeout, false))?;

        let n = data.len().min(max_len);
        debug!(bytes_read = n, "Bulk read complete");
        Ok(data[..n].to_vec())
    }

    #[instrument(skip(self))]
    fn reset(&self) -> Result<(), TransportError> {
        self.device
            .reset()
            .wait()
            .map_err(|e| TransportError::ResetFailed(e.to_string()))?;
        info!("Device reset issued");
        Ok(())
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

impl Drop for NusbTransport {
    fn drop(&mut self) {
        info!(
            pid = %format!("{:04X}", self.pid),
            "Closing USB connection"
        );
    }
}

/// Opens real devices through nusb.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBus;

impl UsbBus for NusbBus {
    type Transport = NusbTransport;

    fn open(&self, vid: u16, pid: u16) -> Result<Option<NusbTransport>, TransportError> {
        NusbTransport::open_with_ids(vid, pid)
    }
}
