//! Error types for programmer operations

use thiserror::Error;

use crate::protocol::Status;

/// Why a single request/response attempt failed.
///
/// Every variant is retried by [`Transport::exchange`](crate::Transport::exchange)
/// until the attempt budget runs out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFailure {
    /// Nothing arrived before the read timeout
    #[error("timeout waiting for response")]
    Timeout,

    /// Some, but not all, of the expected bytes arrived
    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    /// Response CRC did not match the locally computed one
    #[error("response CRC mismatch: got 0x{received:02X}, expected 0x{expected:02X}")]
    ChecksumMismatch { expected: u8, received: u8 },

    /// Request frame could not be written
    #[error("write failed: {0}")]
    WriteError(String),

    /// Any other I/O error on the link
    #[error("I/O error: {0}")]
    Io(String),
}

/// Programmer error
#[derive(Debug, Error)]
pub enum Error {
    /// No valid response after all attempts
    #[error("transport failed after {attempts} attempt(s): {failure}")]
    Transport {
        failure: TransportFailure,
        attempts: u32,
    },

    /// The programmer answered with a non-OK status
    #[error("device error: {status} (command 0x{command:02X})")]
    Device { command: u8, status: Status },

    /// Payload does not fit the u16 length field
    #[error("payload of {0} bytes exceeds frame limit")]
    PayloadTooLarge(usize),

    /// Page data is not exactly one flash page
    #[error("page at 0x{address:06X} has {len} bytes, expected {expected}")]
    InvalidPage {
        address: u32,
        len: usize,
        expected: usize,
    },

    /// Requested range runs past the 24-bit target address space
    #[error("range 0x{start:06X} + {size} bytes is outside the 24-bit address space")]
    AddressRange { start: u32, size: u32 },

    /// Response payload has the wrong shape
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Interrupted by the user
    #[error("operation cancelled")]
    Cancelled,

    #[error("encoding error: {0}")]
    Encoding(#[from] scroll::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The failure classification, for transport errors.
    pub fn transport_failure(&self) -> Option<&TransportFailure> {
        match self {
            Error::Transport { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Process-level result of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    VerifyFailed,
    Fatal,
    Cancelled,
}

impl Outcome {
    pub const fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::VerifyFailed => 1,
            Outcome::Fatal => 2,
            Outcome::Cancelled => 130,
        }
    }

    /// Map a fatal error to its outcome, keeping cancellation distinct.
    pub fn from_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<Error>() {
            Some(Error::Cancelled) => Outcome::Cancelled,
            _ => Outcome::Fatal,
        }
    }
}
