//! The underlying binary protocol of the PICokit programmer

use std::fmt;

use bitfield::bitfield;
use scroll::{Pread, Pwrite, LE};

use crate::constants::{commands, status, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};

/// CRC-8, polynomial 0x07, init 0x00, no final XOR, MSB first.
///
/// Must match the programmer firmware bit for bit.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |mut crc, &b| {
        crc ^= b;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
        crc
    })
}

/// Build `head ‖ len ‖ payload ‖ crc8`. Used for requests and, in tests, for responses.
pub fn encode_frame(head: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::PayloadTooLarge(payload.len()));
    }
    let mut buf = vec![0u8; FRAME_HEADER_SIZE + payload.len() + 1];
    buf[0] = head;
    buf.pwrite_with(payload.len() as u16, 1, LE)?;
    buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    let body = FRAME_HEADER_SIZE + payload.len();
    buf[body] = crc8(&buf[..body]);
    Ok(buf)
}

/// PICokit command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Read device and revision ID of the target.
    Diagnose,
    /// Bulk erase flash, EEPROM, config and user ID.
    Erase,
    /// Program one flash page.
    ///
    /// `data` must be exactly one page long.
    WritePage { address: u32, data: Vec<u8> },
    /// Program config bytes starting at `address`.
    WriteConfig { address: u32, data: Vec<u8> },
    /// Program EEPROM bytes starting at `address`.
    WriteEeprom { address: u32, data: Vec<u8> },
    /// Read `len` bytes from any region.
    Read { address: u32, len: u16 },
    /// Release the target from ICSP, letting it run.
    ResetTarget,
    /// Erase, write and read back a pattern at the start of EEPROM.
    TestEeprom,
    /// Programmer firmware version string.
    Version,
}

impl Command {
    pub fn write_page(address: u32, data: Vec<u8>) -> Self {
        Command::WritePage { address, data }
    }

    pub fn write_config(address: u32, data: Vec<u8>) -> Self {
        Command::WriteConfig { address, data }
    }

    pub fn write_eeprom(address: u32, data: Vec<u8>) -> Self {
        Command::WriteEeprom { address, data }
    }

    pub fn read(address: u32, len: u16) -> Self {
        Command::Read { address, len }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::Diagnose => commands::DIAGNOSE,
            Command::Erase => commands::ERASE,
            Command::WritePage { .. } => commands::WRITE_PAGE,
            Command::WriteConfig { .. } => commands::WRITE_CONFIG,
            Command::WriteEeprom { .. } => commands::WRITE_EEPROM,
            Command::Read { .. } => commands::READ,
            Command::ResetTarget => commands::RESET_TARGET,
            Command::TestEeprom => commands::TEST_EEPROM,
            Command::Version => commands::VERSION,
        }
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        match self {
            Command::WritePage { address, data } => {
                // ADDR, DATA
                if data.len() != PAGE_SIZE {
                    return Err(Error::InvalidPage {
                        address: *address,
                        len: data.len(),
                        expected: PAGE_SIZE,
                    });
                }
                let mut buf = vec![0u8; 4 + data.len()];
                buf.pwrite_with(*address, 0, LE)?;
                buf[4..].copy_from_slice(data);
                Ok(buf)
            }
            Command::WriteConfig { address, data } | Command::WriteEeprom { address, data } => {
                // ADDR, LEN, DATA
                if data.len() > u16::MAX as usize {
                    return Err(Error::PayloadTooLarge(data.len()));
                }
                let mut buf = vec![0u8; 4 + 2 + data.len()];
                buf.pwrite_with(*address, 0, LE)?;
                buf.pwrite_with(data.len() as u16, 4, LE)?;
                buf[6..].copy_from_slice(data);
                Ok(buf)
            }
            Command::Read { address, len } => {
                let mut buf = vec![0u8; 6];
                buf.pwrite_with(*address, 0, LE)?;
                buf.pwrite_with(*len, 4, LE)?;
                Ok(buf)
            }
            Command::Diagnose
            | Command::Erase
            | Command::ResetTarget
            | Command::TestEeprom
            | Command::Version => Ok(Vec::new()),
        }
    }

    pub fn into_raw(self) -> Result<Vec<u8>> {
        encode_frame(self.opcode(), &self.payload()?)
    }
}

/// Response status reported by the programmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    InvalidCommand,
    CrcMismatch,
    NoTarget,
    VerifyFailed,
    InvalidPayload,
    Unknown(u8),
}

impl From<u8> for Status {
    fn from(code: u8) -> Self {
        match code {
            status::OK => Status::Ok,
            status::INVALID_COMMAND => Status::InvalidCommand,
            status::CRC_MISMATCH => Status::CrcMismatch,
            status::NO_TARGET => Status::NoTarget,
            status::VERIFY_FAILED => Status::VerifyFailed,
            status::INVALID_PAYLOAD => Status::InvalidPayload,
            other => Status::Unknown(other),
        }
    }
}

impl From<Status> for u8 {
    fn from(s: Status) -> u8 {
        match s {
            Status::Ok => status::OK,
            Status::InvalidCommand => status::INVALID_COMMAND,
            Status::CrcMismatch => status::CRC_MISMATCH,
            Status::NoTarget => status::NO_TARGET,
            Status::VerifyFailed => status::VERIFY_FAILED,
            Status::InvalidPayload => status::INVALID_PAYLOAD,
            Status::Unknown(code) => code,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::InvalidCommand => write!(f, "invalid command"),
            Status::CrcMismatch => write!(f, "CRC mismatch"),
            Status::NoTarget => write!(f, "no target detected"),
            Status::VerifyFailed => write!(f, "verification failed"),
            Status::InvalidPayload => write!(f, "invalid payload"),
            Status::Unknown(code) => write!(f, "0x{:02X}", code),
        }
    }
}

/// A CRC-checked response frame.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Response {
    pub status: Status,
    pub payload: Vec<u8>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            write!(f, "OK[{}]", hex::encode(&self.payload))
        } else {
            write!(f, "ERR({})[{}]", self.status, hex::encode(&self.payload))
        }
    }
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

bitfield! {
    /// PIC18 revision ID word.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RevisionId(u16);
    impl Debug;
    pub major, _: 10, 6;
    pub minor, _: 5, 0;
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let major = (b'A' + self.major() as u8) as char;
        write!(f, "{}{}", major, self.minor())
    }
}

/// Decoded diagnose response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: u16,
    pub revision: RevisionId,
    /// Name as identified by the programmer firmware
    pub name: String,
}

impl DeviceInfo {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(Error::InvalidResponse(format!(
                "diagnose payload too short: {} bytes",
                payload.len()
            )));
        }
        let device_id = payload.pread_with::<u16>(0, LE)?;
        let revision = RevisionId(payload.pread_with::<u16>(2, LE)?);
        let name = String::from_utf8_lossy(&payload[4..]).into_owned();
        Ok(DeviceInfo {
            device_id,
            revision,
            name,
        })
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (ID 0x{:04X}, rev {} 0x{:04X})",
            self.name, self.device_id, self.revision, self.revision.0
        )
    }
}

pub fn decode_version(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

/// EEPROM self-test result; an empty payload counts as failure.
pub fn decode_test_eeprom(payload: &[u8]) -> bool {
    payload.first().is_some_and(|&b| b != 0)
}
