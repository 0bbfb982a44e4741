//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to subscribe to protocol events
//! without tight coupling to the core logic.

use std::fmt;

use crate::mode::DeviceMode;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrecvPhase {
    /// Probing for a device.
    WaitingForDevice,
    /// Initiate request / probe read before the first chunk.
    Handshake,
    /// Chunks in flight.
    Sending,
    /// Zero-length completion request.
    Finalizing,
    /// Reading execution-stage status markers.
    Confirming,
    /// Exploit sequence in progress.
    Exploit,
    /// Device is resetting.
    DeviceReset,
    /// All operations complete.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for IrecvPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrecvPhase::WaitingForDevice => write!(f, "Waiting for Device"),
            IrecvPhase::Handshake => write!(f, "Handshake"),
            IrecvPhase::Sending => write!(f, "Sending"),
            IrecvPhase::Finalizing => write!(f, "Finalizing"),
            IrecvPhase::Confirming => write!(f, "Confirming"),
            IrecvPhase::Exploit => write!(f, "Exploit"),
            IrecvPhase::DeviceReset => write!(f, "Device Reset"),
            IrecvPhase::Complete => write!(f, "Complete"),
            IrecvPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by a device session.
#[derive(Debug, Clone)]
pub enum IrecvEvent {
    /// Device connected.
    DeviceConnected { mode: DeviceMode, vid: u16, pid: u16 },
    /// Device handle released.
    DeviceDisconnected,
    /// Phase changed.
    PhaseChanged { from: IrecvPhase, to: IrecvPhase },
    /// Progress update for current operation.
    Progress {
        phase: IrecvPhase,
        operation: String,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Status byte read from the device.
    StatusReceived { status: u8 },
    /// Exploit stage reached.
    ExploitStage { stage: u8, description: String },
    /// USB Packet sent/received.
    Packet {
        direction: PacketDirection,
        packet_type: String,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// All operations completed successfully.
    Complete,
}

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Device)
    Rx, // Receive (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait IrecvObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &IrecvEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl IrecvObserver for NullObserver {
    fn on_event(&self, _event: &IrecvEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl IrecvObserver for TracingObserver {
    fn on_event(&self, event: &IrecvEvent) {
        match event {
            IrecvEvent::DeviceConnected { mode, vid, pid } => {
                tracing::info!(mode = %mode, vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device connected");
            }
            IrecvEvent::DeviceDisconnected => {
                tracing::info!("Device released");
            }
            IrecvEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            IrecvEvent::Progress {
                phase,
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(phase = %phase, operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            IrecvEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            IrecvEvent::StatusReceived { status } => {
                tracing::trace!(status = status, "Status received");
            }
            IrecvEvent::ExploitStage { stage, description } => {
                tracing::info!(stage = stage, "{}", description);
            }
            IrecvEvent::Packet {
                direction,
                packet_type,
                length,
                ..
            } => {
                tracing::trace!(
                    dir = %direction,
                    type_ = %packet_type,
                    len = length,
                    "USB Packet"
                );
            }
            IrecvEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}
