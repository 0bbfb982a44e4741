//! Image transfer engine.
//!
//! Drives `Init → Sending(i) → Finalizing → Confirming(k) → Done`. The mode
//! profile decides the primitive (bulk vs control), whether the trailer is
//! appended, whether chunks are acknowledged, and whether the finalize
//! handshake runs. Any failure aborts the whole transfer; the only retry is
//! the per-chunk status poll.

use std::thread;

use tracing::{debug, info, instrument, warn};

use super::machine::{TransferSession, TransferState};
use crate::error::{IrecvError, Result};
use crate::events::{IrecvEvent, IrecvObserver, IrecvPhase};
use crate::mode::{ModeProfile, TransportKind};
use crate::payload::{ChunkPlan, FirmwareImage};
use crate::protocol::StatusCode;
use crate::protocol::constants::*;
use crate::session::SessionConfig;
use crate::trailer::TrailerCodec;
use crate::transport::{ControlSetup, UsbTransport};

/// What happens after the last chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFlavor {
    /// Plain send: confirm all three stages.
    SendFile,
    /// Upload and execute: confirm all three stages.
    Execute,
    /// Upload then reset into the next stage: confirm two stages, the
    /// reset preempts the third.
    Reset,
}

impl TransferFlavor {
    pub fn confirm_rounds(&self) -> usize {
        match self {
            TransferFlavor::Reset => 2,
            TransferFlavor::SendFile | TransferFlavor::Execute => 3,
        }
    }

    pub fn resets_device(&self) -> bool {
        matches!(self, TransferFlavor::Reset)
    }
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes_sent: usize,
    pub chunks: usize,
    pub retries: u32,
}

pub struct TransferEngine<'a, T: UsbTransport, O: IrecvObserver + ?Sized> {
    transport: &'a T,
    profile: ModeProfile,
    config: &'a SessionConfig,
    observer: &'a O,
    session: TransferSession,
    phase: IrecvPhase,
}

impl<'a, T: UsbTransport, O: IrecvObserver + ?Sized> TransferEngine<'a, T, O> {
    pub fn new(
        transport: &'a T,
        profile: ModeProfile,
        config: &'a SessionConfig,
        observer: &'a O,
    ) -> Self {
        Self {
            transport,
            profile,
            config,
            observer,
            session: TransferSession::new(),
            phase: IrecvPhase::WaitingForDevice,
        }
    }

    pub fn state(&self) -> &TransferState {
        &self.session.state
    }

    pub fn phase(&self) -> IrecvPhase {
        self.phase
    }

    /// Send `image` and run the post-transfer handshake for `flavor`.
    #[instrument(skip(self, image), fields(len = image.len()))]
    pub fn run(&mut self, image: &FirmwareImage, flavor: TransferFlavor) -> Result<TransferReport> {
        match self.drive(image, flavor) {
            Ok(report) => Ok(report),
            Err(e) => {
                self.session.fail(e.to_string());
                self.enter(IrecvPhase::Error);
                Err(e)
            }
        }
    }

    fn drive(&mut self, image: &FirmwareImage, flavor: TransferFlavor) -> Result<TransferReport> {
        let plan = self.init(image)?;
        self.send_chunks(image, &plan)?;

        if self.profile.finalize {
            self.finalize(&plan)?;
            self.confirm(flavor)?;
        }

        if flavor.resets_device() {
            if self.config.safety_transfer {
                debug!("Sending safety transfer before reset");
                self.control_out(ControlSetup::new(REQ_TYPE_CLASS_OUT, DFU_DNLOAD, 0, 0), &[])?;
            }
            self.enter(IrecvPhase::DeviceReset);
            self.transport.reset()?;
        }

        self.session.goto_state(TransferState::Done);
        self.observer.on_event(&IrecvEvent::Complete);
        info!(
            bytes = self.session.bytes_sent,
            chunks = plan.count,
            "Transfer complete"
        );

        Ok(TransferReport {
            bytes_sent: self.session.bytes_sent,
            chunks: plan.count,
            retries: self.session.retries,
        })
    }

    fn init(&mut self, image: &FirmwareImage) -> Result<ChunkPlan> {
        self.session.goto_state(TransferState::Init);
        if image.is_empty() {
            return Err(IrecvError::EmptyImage);
        }

        let plan = image.plan(self.profile.packet_size);
        // The finalize request carries the chunk count in wValue
        if self.profile.transport == TransportKind::Control && plan.count > u16::MAX as usize {
            return Err(IrecvError::ImageTooLarge { chunks: plan.count });
        }

        self.enter(IrecvPhase::Handshake);
        match self.profile.transport {
            TransportKind::Bulk { .. } => {
                debug!("Initiating bulk transfer");
                self.control_out(
                    ControlSetup::new(REQ_TYPE_VENDOR_IFACE_OUT, RECOVERY_INITIATE, 0, 0),
                    &[],
                )?;
            }
            TransportKind::Control => {
                debug!("Probing DFU state");
                let state = self.transport.control_in(
                    ControlSetup::new(REQ_TYPE_CLASS_IN, DFU_GETSTATE, 0, 0),
                    1,
                    self.config.control_timeout(),
                )?;
                if state.len() != 1 {
                    return Err(IrecvError::ShortTransfer {
                        expected: 1,
                        actual: state.len(),
                    });
                }
            }
        }

        info!(
            chunks = plan.count,
            last = plan.last_len,
            packet = plan.packet_size,
            "Starting transfer"
        );
        Ok(plan)
    }

    fn send_chunks(&mut self, image: &FirmwareImage, plan: &ChunkPlan) -> Result<()> {
        self.enter(IrecvPhase::Sending);
        let mut codec = self.profile.trailer.then(TrailerCodec::new);

        for chunk in plan.iter() {
            self.session.goto_state(TransferState::Sending(chunk.index));
            let bytes = image.chunk_bytes(&chunk);

            let sent = match self.profile.transport {
                TransportKind::Bulk { endpoint } => {
                    let n = self
                        .transport
                        .bulk_out(endpoint, bytes, self.config.bulk_timeout())?;
                    check_len(bytes.len(), n)?;
                    n
                }
                TransportKind::Control => {
                    if let Some(codec) = codec.as_mut() {
                        codec.update(bytes);
                    }
                    let setup =
                        ControlSetup::new(REQ_TYPE_CLASS_OUT, DFU_DNLOAD, chunk.index as u16, 0);
                    let trailer = if plan.is_last(&chunk) {
                        codec.take().map(TrailerCodec::finish_trailer)
                    } else {
                        None
                    };
                    match trailer {
                        Some(trailer) => {
                            let mut wire = Vec::with_capacity(bytes.len() + trailer.len());
                            wire.extend_from_slice(bytes);
                            wire.extend_from_slice(&trailer);
                            self.control_out(setup, &wire)?;
                        }
                        None => {
                            self.control_out(setup, bytes)?;
                        }
                    }
                    bytes.len()
                }
            };

            debug!(index = chunk.index, len = sent, "Chunk sent");

            if self.profile.status_poll {
                self.await_ready(chunk.index)?;
            }

            self.session.advance(sent);
            self.observer.on_event(&IrecvEvent::Progress {
                phase: IrecvPhase::Sending,
                operation: "Upload".to_string(),
                current: self.session.bytes_sent as u64,
                total: plan.image_len as u64,
            });
        }
        Ok(())
    }

    /// Poll until the device reports the chunk accepted, retrying a bounded
    /// number of times one interval apart. Only a not-ready status or a
    /// timed out read is retried.
    fn await_ready(&mut self, index: usize) -> Result<()> {
        let retries = self.config.status_retries;
        for attempt in 0..=retries {
            if attempt > 0 {
                self.session.retries += 1;
                thread::sleep(self.config.retry_interval());
            }
            match self.read_status(StatusCode::READY) {
                Ok(status) if status.is_ready() => return Ok(()),
                Ok(status) => {
                    debug!(index, attempt, status = %status, "Device not ready");
                }
                Err(e @ IrecvError::TransportTimeout { .. }) => {
                    warn!(index, attempt, error = %e, "Status poll timed out");
                }
                Err(e) => return Err(e),
            }
        }
        Err(IrecvError::StatusMismatch {
            expected: StatusCode::READY.value(),
            actual: self.session.last_status.map(|s| s.value()),
        })
    }

    fn finalize(&mut self, plan: &ChunkPlan) -> Result<()> {
        self.session.goto_state(TransferState::Finalizing);
        self.enter(IrecvPhase::Finalizing);
        self.control_out(
            ControlSetup::new(REQ_TYPE_CLASS_OUT, DFU_DNLOAD, plan.count as u16, 0),
            &[],
        )?;
        Ok(())
    }

    fn confirm(&mut self, flavor: TransferFlavor) -> Result<()> {
        self.enter(IrecvPhase::Confirming);
        for (round, expected) in StatusCode::execution_stages(flavor.confirm_rounds()).enumerate() {
            self.session.goto_state(TransferState::Confirming(round));
            let status = self.read_status(expected)?;
            if status != expected {
                return Err(IrecvError::StatusMismatch {
                    expected: expected.value(),
                    actual: Some(status.value()),
                });
            }
            debug!(round, status = %status, "Stage confirmed");
        }
        Ok(())
    }

    /// Read one GETSTATUS response. A response of the wrong length is a
    /// mismatch against `expected`.
    fn read_status(&mut self, expected: StatusCode) -> Result<StatusCode> {
        let response = self.transport.control_in(
            ControlSetup::new(REQ_TYPE_CLASS_IN, DFU_GETSTATUS, 0, 0),
            STATUS_RESPONSE_LEN,
            self.config.status_timeout(),
        )?;
        let status =
            StatusCode::from_response(&response).ok_or(IrecvError::StatusMismatch {
                expected: expected.value(),
                actual: None,
            })?;
        self.session.last_status = Some(status);
        self.observer.on_event(&IrecvEvent::StatusReceived {
            status: status.value(),
        });
        Ok(status)
    }

    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<()> {
        let n = self
            .transport
            .control_out(setup, data, self.config.control_timeout())?;
        check_len(data.len(), n)
    }

    fn enter(&mut self, to: IrecvPhase) {
        let from = std::mem::replace(&mut self.phase, to);
        self.observer.on_event(&IrecvEvent::PhaseChanged { from, to });
    }
}

fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(IrecvError::ShortTransfer { expected, actual });
    }
    Ok(())
}
