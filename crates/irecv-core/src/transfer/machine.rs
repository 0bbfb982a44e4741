//! Transfer state machine bookkeeping.

use std::fmt;

use crate::protocol::StatusCode;

/// State of one image transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferState {
    /// Validating the image and issuing the initiate/probe request.
    #[default]
    Init,
    /// Sending chunk `i`.
    Sending(usize),
    /// Zero-length completion request.
    Finalizing,
    /// Confirmation round `k`.
    Confirming(usize),
    Done,
    /// Absorbing failure state.
    Error(String),
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Init => write!(f, "INIT"),
            TransferState::Sending(i) => write!(f, "SENDING({})", i),
            TransferState::Finalizing => write!(f, "FINALIZING"),
            TransferState::Confirming(k) => write!(f, "CONFIRMING({})", k),
            TransferState::Done => write!(f, "DONE"),
            TransferState::Error(reason) => write!(f, "ERROR({})", reason),
        }
    }
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Done | TransferState::Error(_))
    }
}

/// Ephemeral state of one transfer call.
#[derive(Debug, Default)]
pub struct TransferSession {
    pub state: TransferState,
    /// Index of the chunk being sent.
    pub chunk_index: usize,
    /// Image bytes acknowledged by the transport (trailer excluded).
    pub bytes_sent: usize,
    /// Most recent status byte read from the device.
    pub last_status: Option<StatusCode>,
    /// Status poll retries spent over the whole transfer.
    pub retries: u32,
}

impl TransferSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state. `Error` is absorbing.
    pub fn goto_state(&mut self, new_state: TransferState) {
        if matches!(self.state, TransferState::Error(_)) {
            return;
        }
        tracing::debug!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(state = %self.state, reason = %reason, "Transfer aborted");
        self.goto_state(TransferState::Error(reason));
    }

    /// Record a sent chunk and move past it.
    pub fn advance(&mut self, chunk_len: usize) {
        self.bytes_sent += chunk_len;
        self.chunk_index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_absorbing() {
        let mut session = TransferSession::new();
        session.goto_state(TransferState::Sending(0));
        session.fail("boom");
        session.goto_state(TransferState::Done);
        assert_eq!(session.state, TransferState::Error("boom".into()));
        assert!(session.state.is_terminal());
    }

    #[test]
    fn test_advance() {
        let mut session = TransferSession::new();
        session.advance(0x800);
        session.advance(1);
        assert_eq!(session.chunk_index, 2);
        assert_eq!(session.bytes_sent, 0x801);
    }

    #[test]
    fn test_display() {
        assert_eq!(TransferState::Sending(3).to_string(), "SENDING(3)");
        assert_eq!(TransferState::Confirming(1).to_string(), "CONFIRMING(1)");
    }
}
