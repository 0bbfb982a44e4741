//! DFU status parsing.
//!
//! A GETSTATUS response is six bytes; the bootloader reports its progress
//! through the state byte at offset 4.

use std::fmt;

use super::constants::{STATUS_RESPONSE_LEN, STATUS_STATE_OFFSET};

/// Device state byte taken from a GETSTATUS response.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u8);

impl StatusCode {
    /// Chunk accepted, ready for the next one.
    pub const READY: Self = Self(5);
    /// First execution-stage acknowledgement after the finalize request.
    pub const MANIFEST_SYNC: Self = Self(6);
    pub const MANIFEST: Self = Self(7);
    pub const MANIFEST_WAIT_RESET: Self = Self(8);

    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Parse a raw GETSTATUS response. Returns `None` when the byte count
    /// is not exactly six.
    pub fn from_response(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != STATUS_RESPONSE_LEN as usize {
            return None;
        }
        Some(Self(bytes[STATUS_STATE_OFFSET]))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn is_ready(&self) -> bool {
        *self == Self::READY
    }

    /// Stage markers expected after finalize, in order.
    pub fn execution_stages(rounds: usize) -> impl Iterator<Item = StatusCode> {
        (Self::MANIFEST_SYNC.0..=Self::MANIFEST_WAIT_RESET.0)
            .take(rounds)
            .map(StatusCode)
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCode({})", self.0)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ready() {
        let status = StatusCode::from_response(&[0, 0, 0, 0, 5, 0]).unwrap();
        assert!(status.is_ready());
        assert_eq!(status.value(), 5);
    }

    #[test]
    fn test_malformed_length() {
        assert!(StatusCode::from_response(&[0, 0, 0, 0, 5]).is_none());
        assert!(StatusCode::from_response(&[]).is_none());
        assert!(StatusCode::from_response(&[0; 7]).is_none());
    }

    #[test]
    fn test_execution_stages_ascend() {
        let stages: Vec<u8> = StatusCode::execution_stages(3).map(|s| s.value()).collect();
        assert_eq!(stages, vec![6, 7, 8]);

        let two: Vec<u8> = StatusCode::execution_stages(2).map(|s| s.value()).collect();
        assert_eq!(two, vec![6, 7]);
    }
}
