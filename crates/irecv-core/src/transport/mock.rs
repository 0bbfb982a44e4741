//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{ControlSetup, TransportError, UsbBus, UsbTransport};
use crate::protocol::constants::{APPLE_VENDOR_ID, DFU_PRODUCT_ID};

/// One transfer observed by the mock, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    ControlOut {
        setup: ControlSetup,
        data: Vec<u8>,
        timeout: Duration,
    },
    ControlIn {
        setup: ControlSetup,
        length: u16,
    },
    BulkOut {
        endpoint: u8,
        data: Vec<u8>,
    },
    BulkIn {
        endpoint: u8,
        max_len: usize,
    },
    Reset,
}

impl Transfer {
    pub fn setup(&self) -> Option<ControlSetup> {
        match self {
            Transfer::ControlOut { setup, .. } | Transfer::ControlIn { setup, .. } => Some(*setup),
            _ => None,
        }
    }
}

/// Mock transport for unit testing transfer and exploit logic.
///
/// Clones share their queues and logs, so a test can keep a handle after
/// giving one away to a session.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued responses (or failures) for control IN transfers.
    control_responses: Arc<Mutex<VecDeque<Result<Vec<u8>, TransportError>>>>,
    /// Queued responses for bulk IN transfers.
    bulk_responses: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured transfers.
    log: Arc<Mutex<Vec<Transfer>>>,
    /// Simulated short writes: report this many bytes for the next write.
    short_write: Arc<Mutex<Option<usize>>>,
    /// When set, control IN transfers with an empty queue time out instead
    /// of answering "ready".
    strict: Arc<Mutex<bool>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_ids(APPLE_VENDOR_ID, DFU_PRODUCT_ID)
    }

    pub fn with_ids(vid: u16, pid: u16) -> Self {
        Self {
            control_responses: Arc::new(Mutex::new(VecDeque::new())),
            bulk_responses: Arc::new(Mutex::new(VecDeque::new())),
            log: Arc::new(Mutex::new(Vec::new())),
            short_write: Arc::new(Mutex::new(None)),
            strict: Arc::new(Mutex::new(false)),
            vid,
            pid,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue a raw control IN response.
    pub fn queue_control_response(&self, bytes: &[u8]) {
        self.control_responses
            .lock()
            .unwrap()
            .push_back(Ok(bytes.to_vec()));
    }

    /// Fail the next unanswered control IN transfer with `err`.
    pub fn queue_control_error(&self, err: TransportError) {
        self.control_responses.lock().unwrap().push_back(Err(err));
    }

    /// Queue a well-formed six byte GETSTATUS response carrying `state`.
    pub fn queue_status(&self, state: u8) {
        self.queue_control_response(&[0, 0, 0, 0, state, 0]);
    }

    /// Queue a bulk IN response.
    pub fn queue_bulk_response(&self, bytes: &[u8]) {
        self.bulk_responses.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Report `len` bytes for the next OUT transfer instead of its full size.
    pub fn short_next_write(&self, len: usize) {
        *self.short_write.lock().unwrap() = Some(len);
    }

    /// Make control IN transfers time out once the queue is empty.
    pub fn set_strict(&self, strict: bool) {
        *self.strict.lock().unwrap() = strict;
    }

    /// Get all captured transfers.
    pub fn transfers(&self) -> Vec<Transfer> {
        self.log.lock().unwrap().clone()
    }

    /// Clear captured transfers.
    pub fn clear_transfers(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if *self.connected.lock().unwrap() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    fn written_len(&self, requested: usize) -> usize {
        self.short_write
            .lock()
            .unwrap()
            .take()
            .unwrap_or(requested)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.check_connected()?;
        self.log.lock().unwrap().push(Transfer::ControlOut {
            setup,
            data: data.to_vec(),
            timeout,
        });
        Ok(self.written_len(data.len()))
    }

    fn control_in(
        &self,
        setup: ControlSetup,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_connected()?;
        self.log
            .lock()
            .unwrap()
            .push(Transfer::ControlIn { setup, length });
        match self.control_responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None if *self.strict.lock().unwrap() => Err(TransportError::timeout(timeout)),
            // Default answer: a zeroed buffer of the requested size
            None => Ok(vec![0u8; length as usize]),
        }
    }

    fn bulk_out(
        &self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.check_connected()?;
        self.log.lock().unwrap().push(Transfer::BulkOut {
            endpoint,
            data: data.to_vec(),
        });
        Ok(self.written_len(data.len()))
    }

    fn bulk_in(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_connected()?;
        self.log
            .lock()
            .unwrap()
            .push(Transfer::BulkIn { endpoint, max_len });
        self.bulk_responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::timeout(timeout))
    }

    fn reset(&self) -> Result<(), TransportError> {
        self.check_connected()?;
        self.log.lock().unwrap().push(Transfer::Reset);
        Ok(())
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

/// Mock bus exposing a fixed set of attached product ids.
#[derive(Clone, Default)]
pub struct MockBus {
    attached: Arc<Mutex<Vec<u16>>>,
    /// Product ids passed to `open`, in order.
    probes: Arc<Mutex<Vec<u16>>>,
    /// Transports handed out, so tests can inspect them afterwards.
    opened: Arc<Mutex<Vec<MockTransport>>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attached(pids: &[u16]) -> Self {
        let bus = Self::new();
        bus.set_attached(pids);
        bus
    }

    /// Replace the set of attached product ids (simulates re-enumeration).
    pub fn set_attached(&self, pids: &[u16]) {
        *self.attached.lock().unwrap() = pids.to_vec();
    }

    pub fn probes(&self) -> Vec<u16> {
        self.probes.lock().unwrap().clone()
    }

    pub fn opened(&self) -> Vec<MockTransport> {
        self.opened.lock().unwrap().clone()
    }
}

impl UsbBus for MockBus {
    type Transport = MockTransport;

    fn open(&self, vid: u16, pid: u16) -> Result<Option<MockTransport>, TransportError> {
        self.probes.lock().unwrap().push(pid);
        if vid != APPLE_VENDOR_ID || !self.attached.lock().unwrap().contains(&pid) {
            return Ok(None);
        }
        let transport = MockTransport::with_ids(vid, pid);
        self.opened.lock().unwrap().push(transport.clone());
        Ok(Some(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    #[test]
    fn test_mock_status_queue() {
        let mock = MockTransport::new();
        mock.set_strict(true);
        mock.queue_status(5);
        mock.queue_status(6);

        let setup = ControlSetup::new(REQ_TYPE_CLASS_IN, DFU_GETSTATUS, 0, 0);
        let timeout = Duration::from_millis(100);
        assert_eq!(mock.control_in(setup, 6, timeout).unwrap()[4], 5);
        assert_eq!(mock.control_in(setup, 6, timeout).unwrap()[4], 6);

        // Queue is empty now
        assert!(mock.control_in(setup, 6, timeout).is_err());
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        let timeout = Duration::from_millis(100);
        let setup = ControlSetup::new(REQ_TYPE_CLASS_OUT, DFU_DNLOAD, 0, 0);
        mock.control_out(setup, b"Hello", timeout).unwrap();
        mock.bulk_out(RECOVERY_BULK_OUT, b"World", timeout).unwrap();

        let transfers = mock.transfers();
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].setup(), Some(setup));
        assert_eq!(
            transfers[1],
            Transfer::BulkOut {
                endpoint: RECOVERY_BULK_OUT,
                data: b"World".to_vec()
            }
        );
    }

    #[test]
    fn test_mock_short_write() {
        let mock = MockTransport::new();
        mock.short_next_write(3);
        let setup = ControlSetup::new(REQ_TYPE_CLASS_OUT, DFU_DNLOAD, 0, 0);
        let timeout = Duration::from_millis(100);
        assert_eq!(mock.control_out(setup, &[0; 8], timeout).unwrap(), 3);
        assert_eq!(mock.control_out(setup, &[0; 8], timeout).unwrap(), 8);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        mock.disconnect();
        assert!(matches!(mock.reset(), Err(TransportError::Disconnected)));
        mock.reconnect();
        assert!(mock.reset().is_ok());
    }

    #[test]
    fn test_mock_bus_records_probes() {
        let bus = MockBus::with_attached(&[DFU_PRODUCT_ID]);
        assert!(bus.open(APPLE_VENDOR_ID, RECOVERY_PRODUCT_ID).unwrap().is_none());
        assert!(bus.open(APPLE_VENDOR_ID, DFU_PRODUCT_ID).unwrap().is_some());
        assert_eq!(bus.probes(), vec![RECOVERY_PRODUCT_ID, DFU_PRODUCT_ID]);
        assert_eq!(bus.opened().len(), 1);
    }
}
