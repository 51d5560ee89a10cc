//! Protocol constants and the PIC18 address layout.

use std::time::Duration;

pub mod commands {
    pub const DIAGNOSE: u8 = 0x01;
    pub const ERASE: u8 = 0x02;
    pub const WRITE_PAGE: u8 = 0x03;
    pub const WRITE_CONFIG: u8 = 0x04;
    pub const WRITE_EEPROM: u8 = 0x05;
    pub const READ: u8 = 0x06;
    pub const RESET_TARGET: u8 = 0x07;
    pub const TEST_EEPROM: u8 = 0x08;
    pub const VERSION: u8 = 0x09;
}

pub mod status {
    pub const OK: u8 = 0x00;
    pub const INVALID_COMMAND: u8 = 0x01;
    pub const CRC_MISMATCH: u8 = 0x02;
    pub const NO_TARGET: u8 = 0x03;
    pub const VERIFY_FAILED: u8 = 0x04;
    pub const INVALID_PAYLOAD: u8 = 0x05;
}

/// Bytes of frame header: command/status + u16 length.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Largest payload the u16 length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Flash page size; WRITE_PAGE carries exactly this many data bytes.
pub const PAGE_SIZE: usize = 128;

/// Target addresses are 24 bits wide; everything lies below this.
pub const ADDRESS_SPACE_END: u32 = 0x0100_0000;

/// Erased flash reads back as this value.
pub const ERASED_BYTE: u8 = 0xFF;

/// Memory region an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Flash,
    Config,
    Eeprom,
}

/// Retry behaviour of a single frame exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Layout::PIC18.retry
    }
}

/// Every fixed parameter of the wire protocol and the target's address space.
///
/// Passed by value into the transport, the partitioner and the programmer;
/// nothing here changes at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub flash_start: u32,
    pub page_size: usize,
    pub chunk_size: usize,
    pub config_start: u32,
    /// Inclusive.
    pub config_end: u32,
    pub eeprom_start: u32,
    pub retry: RetryPolicy,
    pub read_timeout: Duration,
    pub baudrate: u32,
    /// Time the programmer needs after its CDC port is opened.
    pub settle_delay: Duration,
}

impl Layout {
    pub const PIC18: Layout = Layout {
        flash_start: 0x000000,
        page_size: PAGE_SIZE,
        chunk_size: 128,
        config_start: 0x300000,
        config_end: 0x30000F,
        eeprom_start: 0x310000,
        retry: RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(50),
        },
        read_timeout: Duration::from_secs(30),
        baudrate: 115200,
        settle_delay: Duration::from_secs(2),
    };

    /// Classify an address. Config wins over EEPROM, EEPROM over flash.
    pub const fn region(&self, address: u32) -> Region {
        if address >= self.config_start && address <= self.config_end {
            Region::Config
        } else if address >= self.eeprom_start {
            Region::Eeprom
        } else {
            Region::Flash
        }
    }

    /// Start address of the flash page containing `address`.
    pub const fn page_of(&self, address: u32) -> u32 {
        let size = self.page_size as u32;
        address / size * size
    }

    pub const fn config_size(&self) -> usize {
        (self.config_end - self.config_start + 1) as usize
    }
}

impl Default for Layout {
    fn default() -> Self {
        Layout::PIC18
    }
}
