//! Programming, verification and dump sequences.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};

use crate::constants::{Layout, ADDRESS_SPACE_END};
use crate::error::{Error, Result};
use crate::image::MemoryImage;
use crate::partition::{Block, Page, Partition};
use crate::protocol::{self, Command, DeviceInfo};
use crate::Transport;

/// Mismatches reported individually; the rest are only counted.
pub const MAX_REPORTED_MISMATCHES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub address: u32,
    pub expected: u8,
    pub actual: u8,
}

/// Outcome of comparing the target against a reference image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked: usize,
    pub mismatches: usize,
    /// First few mismatches, ascending address
    pub details: Vec<Mismatch>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }

    fn record(&mut self, mismatch: Mismatch) {
        if self.details.len() < MAX_REPORTED_MISMATCHES {
            log::error!(
                "Mismatch at 0x{:06X}: expected 0x{:02X}, read 0x{:02X}",
                mismatch.address,
                mismatch.expected,
                mismatch.actual
            );
            self.details.push(mismatch);
        }
        self.mismatches += 1;
    }
}

pub struct Programmer<T: Transport> {
    transport: T,
    layout: Layout,
    cancel: Arc<AtomicBool>,
    show_progress: bool,
}

impl<T: Transport> Programmer<T> {
    pub fn new(transport: T, layout: Layout) -> Self {
        Programmer {
            transport,
            layout,
            cancel: Arc::new(AtomicBool::new(false)),
            show_progress: false,
        }
    }

    /// Flag checked before every request and retry; once set, the current
    /// sequence stops.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Exchange `cmd` and require an OK status. Returns the response payload.
    pub fn send_ok(&mut self, cmd: Command) -> Result<Vec<u8>> {
        let cancel = &self.cancel;
        let resp = self
            .transport
            .exchange_until(&cmd, self.layout.retry, &|| cancel.load(Ordering::SeqCst))?;
        if !resp.is_ok() {
            return Err(Error::Device {
                command: cmd.opcode(),
                status: resp.status,
            });
        }
        Ok(resp.payload)
    }

    pub fn version(&mut self) -> Result<String> {
        let payload = self.send_ok(Command::Version)?;
        Ok(protocol::decode_version(&payload))
    }

    pub fn diagnose(&mut self) -> Result<DeviceInfo> {
        let payload = self.send_ok(Command::Diagnose)?;
        DeviceInfo::from_payload(&payload)
    }

    pub fn erase(&mut self) -> Result<()> {
        self.send_ok(Command::Erase)?;
        log::info!("Chip erased");
        Ok(())
    }

    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        if page.data.len() != self.layout.page_size {
            return Err(Error::InvalidPage {
                address: page.address,
                len: page.data.len(),
                expected: self.layout.page_size,
            });
        }
        self.send_ok(Command::write_page(page.address, page.data.clone()))?;
        Ok(())
    }

    pub fn write_config(&mut self, block: &Block) -> Result<()> {
        self.send_ok(Command::write_config(block.address, block.data.clone()))?;
        Ok(())
    }

    pub fn write_eeprom(&mut self, block: &Block) -> Result<()> {
        self.send_ok(Command::write_eeprom(block.address, block.data.clone()))?;
        Ok(())
    }

    /// Read a single chunk. `len` must not exceed the chunk size.
    pub fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        debug_assert!(len <= self.layout.chunk_size);
        let data = self.send_ok(Command::read(address, len as u16))?;
        if data.len() != len {
            return Err(Error::InvalidResponse(format!(
                "read 0x{:06X}: asked for {} bytes, got {}",
                address,
                len,
                data.len()
            )));
        }
        Ok(data)
    }

    /// Read `[start, end)` chunk by chunk, handing each chunk to `f`.
    pub fn read_range<F>(&mut self, start: u32, end: u32, mut f: F) -> Result<()>
    where
        F: FnMut(u32, &[u8]),
    {
        let chunk = self.layout.chunk_size as u32;
        let mut addr = start;
        while addr < end {
            let n = (end - addr).min(chunk);
            let data = self.read(addr, n as usize)?;
            f(addr, &data);
            addr += n;
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.send_ok(Command::ResetTarget)?;
        log::info!("Target reset");
        Ok(())
    }

    pub fn test_eeprom(&mut self) -> Result<bool> {
        let payload = self.send_ok(Command::TestEeprom)?;
        Ok(protocol::decode_test_eeprom(&payload))
    }

    /// Read all config bytes, then release the target.
    pub fn read_config(&mut self) -> Result<Vec<u8>> {
        let size = self.layout.config_size();
        let data = self.read(self.layout.config_start, size)?;
        self.reset()?;
        Ok(data)
    }

    /// Diagnose, erase, write flash, config and EEPROM, then reset.
    ///
    /// Any failure aborts immediately and leaves the target in programming mode.
    pub fn program(&mut self, image: &MemoryImage) -> Result<DeviceInfo> {
        self.program_with(image, |_| ())
    }

    /// Like [`program`](Self::program), calling `inspect` with the diagnose
    /// result before anything is erased.
    pub fn program_with<F>(&mut self, image: &MemoryImage, inspect: F) -> Result<DeviceInfo>
    where
        F: FnOnce(&DeviceInfo),
    {
        let info = self.diagnose()?;
        log::info!("Target: {}", info);
        inspect(&info);

        self.erase()?;

        let partition = Partition::new(image, self.layout);
        let pages = partition.flash_pages();
        if !pages.is_empty() {
            log::info!("Writing {} flash pages", pages.len());
            let pb = self.progress_bar(pages.len() as u64, "Flash");
            for page in &pages {
                self.write_page(page)?;
                pb.inc(1);
            }
            pb.finish();
        }

        if let Some(block) = partition.config_block() {
            log::info!(
                "Writing {} config bytes at 0x{:06X}",
                block.len(),
                block.address
            );
            self.write_config(&block)?;
        }

        let chunks = partition.eeprom_chunks(self.layout.chunk_size);
        if !chunks.is_empty() {
            let total: usize = chunks.iter().map(Block::len).sum();
            log::info!("Writing EEPROM ({} bytes)", total);
            let pb = self.progress_bar(chunks.len() as u64, "EEPROM");
            for chunk in &chunks {
                self.write_eeprom(chunk)?;
                pb.inc(1);
            }
            pb.finish();
        }

        self.reset()?;
        log::info!("Write complete");
        Ok(info)
    }

    /// Read back every segment of `image` and compare. Always resets the target
    /// once the read loop completes, whatever the result.
    pub fn verify(&mut self, image: &MemoryImage) -> Result<VerifyReport> {
        let segments = image.segments();
        let total: u64 = segments.iter().map(|&(s, e)| (e - s) as u64).sum();
        let pb = self.progress_bar_bytes(total, "Verify");

        let mut report = VerifyReport::default();
        for (start, end) in segments {
            self.read_range(start, end, |addr, data| {
                for (address, &actual) in (addr..).zip(data) {
                    // every address inside a segment is present
                    let expected = image.get(address).unwrap_or(actual);
                    if expected != actual {
                        report.record(Mismatch {
                            address,
                            expected,
                            actual,
                        });
                    }
                }
                report.checked += data.len();
                pb.inc(data.len() as u64);
            })?;
        }
        pb.finish();

        self.reset()?;
        if report.passed() {
            log::info!("Verification OK: {} bytes match", report.checked);
        } else {
            log::error!(
                "Verification FAILED: {} mismatches in {} bytes",
                report.mismatches,
                report.checked
            );
        }
        Ok(report)
    }

    /// Read `size` bytes from `start` into a fresh image, then reset.
    pub fn dump(&mut self, start: u32, size: u32) -> Result<MemoryImage> {
        let end = start
            .checked_add(size)
            .filter(|&end| end <= ADDRESS_SPACE_END)
            .ok_or(Error::AddressRange { start, size })?;
        log::info!("Reading {} bytes from 0x{:06X}", size, start);
        let pb = self.progress_bar_bytes(size as u64, "Read");
        let mut image = MemoryImage::new();
        self.read_range(start, end, |addr, data| {
            image.extend_from(addr, data);
            pb.inc(data.len() as u64);
        })?;
        pb.finish();
        self.reset()?;
        Ok(image)
    }

    fn progress_bar(&self, len: u64, prefix: &'static str) -> ProgressBar {
        self.styled_bar(len, prefix, "{prefix:>8} [{bar:40.cyan/blue}] {pos}/{len}")
    }

    fn progress_bar_bytes(&self, len: u64, prefix: &'static str) -> ProgressBar {
        self.styled_bar(
            len,
            prefix,
            "{prefix:>8} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )
    }

    fn styled_bar(&self, len: u64, prefix: &'static str, template: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len).with_prefix(prefix);
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}
