//! Device session: owns the open handle and exposes every client operation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{IrecvError, Result};
use crate::events::{IrecvEvent, IrecvObserver, IrecvPhase, PacketDirection, TracingObserver};
use crate::mode::{self, DeviceMode};
use crate::payload::FirmwareImage;
use crate::protocol::constants::*;
use crate::transfer::{TransferEngine, TransferFlavor, TransferReport};
use crate::transport::{ControlSetup, TransportError, UsbBus, UsbTransport};

/// Timeouts, retry policy and transfer options for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Timeout for control writes and reads.
    pub control_timeout_ms: u64,
    /// Timeout for GETSTATUS reads.
    pub status_timeout_ms: u64,
    /// Timeout for bulk transfers.
    pub bulk_timeout_ms: u64,
    /// Additional status reads after the first before a chunk is failed.
    pub status_retries: u32,
    /// Pause before each status retry.
    pub retry_interval_ms: u64,
    /// Send a zero-length chunk write before resetting after an upload.
    pub safety_transfer: bool,
    /// Wait after the exploit trigger before re-detecting the device.
    pub settle_delay_ms: u64,
    /// Timeout for the exploit's overflow write.
    pub exploit_write_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            control_timeout_ms: DEFAULT_CONTROL_TIMEOUT.as_millis() as u64,
            status_timeout_ms: DEFAULT_STATUS_TIMEOUT.as_millis() as u64,
            bulk_timeout_ms: 1000,
            status_retries: DEFAULT_STATUS_RETRIES,
            retry_interval_ms: 1000,
            safety_transfer: false,
            settle_delay_ms: 2000,
            exploit_write_timeout_ms: 10,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn exploit_write_timeout(&self) -> Duration {
        Duration::from_millis(self.exploit_write_timeout_ms)
    }
}

/// An open device in a known mode.
///
/// The handle is released when the session is dropped. Operations that
/// re-enumerate the device (the exploit) consume the session and hand back a
/// fresh one.
pub struct DeviceSession<T: UsbTransport, O: IrecvObserver = TracingObserver> {
    transport: T,
    mode: DeviceMode,
    config: SessionConfig,
    observer: Arc<O>,
}

impl<T: UsbTransport> DeviceSession<T, TracingObserver> {
    /// Detect a device on `bus` and open it, logging events through tracing.
    pub fn connect<B: UsbBus<Transport = T>>(bus: &B, config: SessionConfig) -> Result<Self> {
        Self::connect_with_observer(bus, config, Arc::new(TracingObserver))
    }
}

impl<T: UsbTransport, O: IrecvObserver> DeviceSession<T, O> {
    #[instrument(skip_all)]
    pub fn connect_with_observer<B: UsbBus<Transport = T>>(
        bus: &B,
        config: SessionConfig,
        observer: Arc<O>,
    ) -> Result<Self> {
        observer.on_event(&IrecvEvent::PhaseChanged {
            from: IrecvPhase::WaitingForDevice,
            to: IrecvPhase::WaitingForDevice,
        });
        match mode::detect(bus)? {
            (mode, Some(transport)) if mode != DeviceMode::Unknown => {
                Ok(Self::new(transport, mode, config, observer))
            }
            _ => Err(IrecvError::DeviceNotFound),
        }
    }

    /// Wrap an already opened transport.
    pub fn new(transport: T, mode: DeviceMode, config: SessionConfig, observer: Arc<O>) -> Self {
        observer.on_event(&IrecvEvent::DeviceConnected {
            mode,
            vid: transport.vendor_id(),
            pid: transport.product_id(),
        });
        Self {
            transport,
            mode,
            config,
            observer,
        }
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn observer(&self) -> &Arc<O> {
        &self.observer
    }

    /// Fail with `WrongMode` unless the device is in `expected`.
    pub fn require_mode(&self, expected: DeviceMode) -> Result<()> {
        if self.mode != expected {
            return Err(IrecvError::WrongMode {
                expected,
                actual: self.mode,
            });
        }
        Ok(())
    }

    pub(crate) fn observed(&self) -> ObservableTransport<'_, T, O> {
        ObservableTransport {
            inner: &self.transport,
            observer: &self.observer,
        }
    }

    /// Send an image with the mode's transfer profile.
    #[instrument(skip(self, image), fields(mode = %self.mode))]
    pub fn transfer(
        &mut self,
        image: &FirmwareImage,
        flavor: TransferFlavor,
    ) -> Result<TransferReport> {
        let profile = self.mode.profile().ok_or(IrecvError::DeviceNotFound)?;
        let transport = self.observed();
        let mut engine =
            TransferEngine::new(&transport, profile, &self.config, self.observer.as_ref());
        engine.run(image, flavor)
    }

    pub fn send_buffer(&mut self, data: &[u8], flavor: TransferFlavor) -> Result<TransferReport> {
        self.transfer(&FirmwareImage::from_bytes(data.to_vec()), flavor)
    }

    /// Load a file and send it.
    pub fn send_file<P: AsRef<Path>>(&mut self, path: P) -> Result<TransferReport> {
        let image = FirmwareImage::load(path)?;
        self.transfer(&image, TransferFlavor::SendFile)
    }

    /// Load a file, send it and confirm all execution stages.
    pub fn upload_and_execute<P: AsRef<Path>>(&mut self, path: P) -> Result<TransferReport> {
        let image = FirmwareImage::load(path)?;
        self.transfer(&image, TransferFlavor::Execute)
    }

    /// Load a file, send it and reset the device.
    pub fn upload_then_reset<P: AsRef<Path>>(&mut self, path: P) -> Result<TransferReport> {
        let image = FirmwareImage::load(path)?;
        self.transfer(&image, TransferFlavor::Reset)
    }

    /// Send a NUL-terminated text command to the bootloader shell.
    #[instrument(skip(self))]
    pub fn send_command(&mut self, command: &str) -> Result<()> {
        let max = MAX_COMMAND_LEN - 1;
        if command.len() > max {
            return Err(IrecvError::CommandTooLong {
                len: command.len(),
                max,
            });
        }

        let mut data = Vec::with_capacity(command.len() + 1);
        data.extend_from_slice(command.as_bytes());
        data.push(0);

        let setup = ControlSetup::new(REQ_TYPE_VENDOR_OUT, RECOVERY_COMMAND, 0, 0);
        let n = self
            .observed()
            .control_out(setup, &data, self.config.control_timeout())?;
        if n != data.len() {
            return Err(IrecvError::ShortTransfer {
                expected: data.len(),
                actual: n,
            });
        }
        info!(command, "Command sent");
        Ok(())
    }

    /// Read a bootloader environment variable.
    pub fn getenv(&mut self, name: &str) -> Result<String> {
        self.send_command(&format!("getenv {}", name))?;
        let response = self.observed().control_in(
            ControlSetup::new(REQ_TYPE_VENDOR_IN, RECOVERY_GETENV, 0, 0),
            GETENV_RESPONSE_LEN,
            self.config.control_timeout(),
        )?;
        let end = response
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(response.len());
        let value = String::from_utf8_lossy(&response[..end]).into_owned();
        debug!(name, value = %value, "getenv");
        Ok(value)
    }

    /// Read the return value of the last command.
    pub fn getret(&mut self) -> Result<u32> {
        let response = self.observed().control_in(
            ControlSetup::new(REQ_TYPE_VENDOR_IN, RECOVERY_GETENV, 0, 0),
            GETRET_RESPONSE_LEN,
            self.config.control_timeout(),
        )?;
        if response.len() < GETRET_RESPONSE_LEN as usize {
            return Err(IrecvError::ShortTransfer {
                expected: GETRET_RESPONSE_LEN as usize,
                actual: response.len(),
            });
        }
        Ok(LittleEndian::read_u32(&response))
    }

    /// Drain the console endpoint until it goes quiet.
    #[instrument(skip(self))]
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        self.require_mode(DeviceMode::Recovery)?;
        let mut output = Vec::new();
        loop {
            match self.observed().bulk_in(
                RECOVERY_BULK_IN,
                CONSOLE_BUFFER_SIZE,
                self.config.bulk_timeout(),
            ) {
                Ok(data) if data.is_empty() => break,
                Ok(data) => output.extend_from_slice(&data),
                Err(TransportError::Timeout { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }
        debug!(len = output.len(), "Console drained");
        Ok(output)
    }

    /// Zero-length control write with the given request codes.
    pub fn raw_control(&mut self, request_type: u8, request: u8) -> Result<usize> {
        let setup = ControlSetup::new(request_type, request, 0, 0);
        let n = self
            .observed()
            .control_out(setup, &[], self.config.control_timeout())?;
        info!(?setup, "Control request sent");
        Ok(n)
    }

    /// Optionally upload `payload`, then send the execute trigger.
    #[instrument(skip(self, payload))]
    pub fn exploit(&mut self, payload: Option<&FirmwareImage>) -> Result<()> {
        if let Some(image) = payload {
            self.transfer(image, TransferFlavor::SendFile)?;
        }
        self.observer.on_event(&IrecvEvent::PhaseChanged {
            from: IrecvPhase::Sending,
            to: IrecvPhase::Exploit,
        });
        self.raw_control(REQ_TYPE_CLASS_OUT, DFU_EXECUTE)?;
        Ok(())
    }

    /// Reset the device. The handle stays owned by the session.
    pub fn reset(&mut self) -> Result<()> {
        self.observer.on_event(&IrecvEvent::PhaseChanged {
            from: IrecvPhase::Complete,
            to: IrecvPhase::DeviceReset,
        });
        self.transport.reset()?;
        Ok(())
    }
}

impl<T: UsbTransport, O: IrecvObserver> Drop for DeviceSession<T, O> {
    fn drop(&mut self) {
        self.observer.on_event(&IrecvEvent::DeviceDisconnected);
    }
}

/// Transport wrapper that emits packet events.
pub(crate) struct ObservableTransport<'a, T: UsbTransport, O: IrecvObserver> {
    inner: &'a T,
    observer: &'a Arc<O>,
}

impl<T: UsbTransport, O: IrecvObserver> ObservableTransport<'_, T, O> {
    fn emit(&self, direction: PacketDirection, packet_type: String, data: &[u8]) {
        self.observer.on_event(&IrecvEvent::Packet {
            direction,
            packet_type,
            length: data.len(),
            data: Some(data.iter().take(32).cloned().collect()),
        });
    }
}

impl<T: UsbTransport, O: IrecvObserver> UsbTransport for ObservableTransport<'_, T, O> {
    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let res = self.inner.control_out(setup, data, timeout);
        if res.is_ok() {
            self.emit(PacketDirection::Tx, format!("{:?}", setup), data);
        }
        res
    }

    fn control_in(
        &self,
        setup: ControlSetup,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.control_in(setup, length, timeout);
        if let Ok(data) = &res {
            self.emit(PacketDirection::Rx, format!("{:?}", setup), data);
        }
        res
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let res = self.inner.bulk_out(endpoint, data, timeout);
        if res.is_ok() {
            self.emit(PacketDirection::Tx, format!("Bulk {:02X}", endpoint), data);
        }
        res
    }

    fn bulk_in(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.bulk_in(endpoint, max_len, timeout);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.emit(PacketDirection::Rx, format!("Bulk {:02X}", endpoint), data);
        }
        res
    }

    fn reset(&self) -> Result<(), TransportError> {
        let res = self.inner.reset();
        if let Err(e) = &res {
            warn!(error = %e, "Reset failed");
        }
        res
    }

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.inner.product_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingObserver;
    use crate::transport::{MockBus, MockTransport, Transfer};

    fn session(pid: u16) -> (DeviceSession<MockTransport, RecordingObserver>, MockTransport) {
        let bus = MockBus::with_attached(&[pid]);
        let config = SessionConfig {
            retry_interval_ms: 0,
            ..SessionConfig::default()
        };
        let session =
            DeviceSession::connect_with_observer(&bus, config, Arc::new(RecordingObserver::default()))
                .unwrap();
        let mock = bus.opened().remove(0);
        (session, mock)
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.control_timeout(), Duration::from_millis(1000));
        assert_eq!(config.status_timeout(), Duration::from_millis(500));
        assert_eq!(config.status_retries, 20);
        assert!(!config.safety_transfer);
        assert_eq!(config.exploit_write_timeout(), Duration::from_millis(10));
    }

    #[test]
    fn test_config_partial_toml_takes_defaults() {
        let config: SessionConfig =
            toml::from_str("status_retries = 3\nsafety_transfer = true\n").unwrap();
        assert_eq!(config.status_retries, 3);
        assert!(config.safety_transfer);
        assert_eq!(config.control_timeout_ms, 1000);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("irecv-config-{}.toml", std::process::id()));
        let config = SessionConfig {
            settle_delay_ms: 50,
            ..SessionConfig::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_connect_without_device() {
        let bus = MockBus::new();
        let err = DeviceSession::connect(&bus, SessionConfig::default()).err().unwrap();
        assert!(matches!(err, IrecvError::DeviceNotFound));
    }

    #[test]
    fn test_connect_emits_events() {
        let (session, _) = session(WTF_PRODUCT_ID);
        assert_eq!(session.mode(), DeviceMode::Wtf);
        let observer = session.observer().clone();
        drop(session);
        let events = observer.events();
        assert!(events.iter().any(|e| matches!(
            e,
            IrecvEvent::DeviceConnected {
                mode: DeviceMode::Wtf,
                pid: WTF_PRODUCT_ID,
                ..
            }
        )));
        assert!(matches!(events.last(), Some(IrecvEvent::DeviceDisconnected)));
    }

    #[test]
    fn test_send_command() {
        let (mut session, mock) = session(RECOVERY_PRODUCT_ID);
        session.send_command("setenv auto-boot true").unwrap();

        match &mock.transfers()[0] {
            Transfer::ControlOut { setup, data, .. } => {
                assert_eq!(*setup, ControlSetup::new(0x40, 0, 0, 0));
                assert_eq!(data.as_slice(), b"setenv auto-boot true\0");
            }
            other => panic!("unexpected transfer {:?}", other),
        }
    }

    #[test]
    fn test_send_command_too_long() {
        let (mut session, mock) = session(RECOVERY_PRODUCT_ID);
        let command = "a".repeat(MAX_COMMAND_LEN);
        let err = session.send_command(&command).unwrap_err();
        assert!(matches!(
            err,
            IrecvError::CommandTooLong {
                len: 0x200,
                max: 0x1FF
            }
        ));
        assert!(mock.transfers().is_empty());

        // 511 bytes plus the terminator still fits
        session.send_command(&"a".repeat(MAX_COMMAND_LEN - 1)).unwrap();
    }

    #[test]
    fn test_getenv_trims_at_nul() {
        let (mut session, mock) = session(RECOVERY_PRODUCT_ID);
        mock.queue_control_response(b"iBoot-1072.61\0garbage");
        assert_eq!(session.getenv("build-version").unwrap(), "iBoot-1072.61");

        let transfers = mock.transfers();
        match &transfers[0] {
            Transfer::ControlOut { data, .. } => assert_eq!(data.as_slice(), b"getenv build-version\0"),
            other => panic!("unexpected transfer {:?}", other),
        }
        assert_eq!(
            transfers[1],
            Transfer::ControlIn {
                setup: ControlSetup::new(0xC0, 0, 0, 0),
                length: 0x100
            }
        );
    }

    #[test]
    fn test_getret() {
        let (mut session, mock) = session(RECOVERY_PRODUCT_ID);
        mock.queue_control_response(&[0x01, 0x02, 0x00, 0x00]);
        assert_eq!(session.getret().unwrap(), 0x0201);

        mock.queue_control_response(&[0x01]);
        assert!(matches!(
            session.getret().unwrap_err(),
            IrecvError::ShortTransfer {
                expected: 4,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_receive_drains_until_timeout() {
        let (mut session, mock) = session(RECOVERY_PRODUCT_ID);
        mock.queue_bulk_response(b"] ");
        mock.queue_bulk_response(b"ok\n");
        assert_eq!(session.receive().unwrap(), b"] ok\n");

        let reads = mock
            .transfers()
            .iter()
            .filter(|t| matches!(t, Transfer::BulkIn { endpoint: 0x81, .. }))
            .count();
        assert_eq!(reads, 3);
    }

    #[test]
    fn test_receive_requires_recovery() {
        let (mut session, _) = session(DFU_PRODUCT_ID);
        assert!(matches!(
            session.receive().unwrap_err(),
            IrecvError::WrongMode {
                expected: DeviceMode::Recovery,
                actual: DeviceMode::Dfu
            }
        ));
    }

    #[test]
    fn test_raw_control() {
        let (mut session, mock) = session(DFU_PRODUCT_ID);
        assert_eq!(session.raw_control(0x21, 2).unwrap(), 0);
        assert_eq!(
            mock.transfers()[0].setup(),
            Some(ControlSetup::new(0x21, 2, 0, 0))
        );
    }

    #[test]
    fn test_legacy_exploit_uploads_then_triggers() {
        let (mut session, mock) = session(DFU_PRODUCT_ID);
        mock.set_strict(true);
        mock.queue_control_response(&[2]);
        mock.queue_status(5);
        mock.queue_status(6);
        mock.queue_status(7);
        mock.queue_status(8);

        let payload = FirmwareImage::from_bytes(vec![0x41; 0x10]);
        session.exploit(Some(&payload)).unwrap();

        let last = mock.transfers().pop().unwrap();
        assert_eq!(last.setup(), Some(ControlSetup::new(0x21, 2, 0, 0)));
    }

    #[test]
    fn test_send_file_missing() {
        let (mut session, mock) = session(DFU_PRODUCT_ID);
        let err = session.send_file("/nonexistent/iBEC.img3").unwrap_err();
        assert!(matches!(err, IrecvError::FileNotFound(_)));
        assert!(mock.transfers().is_empty());
    }

    #[test]
    fn test_transfer_emits_packets_and_progress() {
        let (mut session, mock) = session(RECOVERY_PRODUCT_ID);
        session.send_buffer(&[0u8; 0x100], TransferFlavor::SendFile).unwrap();
        assert_eq!(mock.transfers().len(), 2);

        let events = session.observer().events();
        assert!(events.iter().any(|e| matches!(
            e,
            IrecvEvent::Packet {
                direction: PacketDirection::Tx,
                length: 0x100,
                ..
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            IrecvEvent::Progress {
                current: 0x100,
                total: 0x100,
                ..
            }
        )));
    }

    #[test]
    fn test_reset() {
        let (mut session, mock) = session(DFU_PRODUCT_ID);
        session.reset().unwrap();
        assert_eq!(mock.transfers(), vec![Transfer::Reset]);
    }
}
