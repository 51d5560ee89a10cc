//! Memory image file formats
use std::path::Path;
use std::str;

use anyhow::Result;
use ihex::Record;

use crate::constants::{ADDRESS_SPACE_END, ERASED_BYTE};
use crate::image::MemoryImage;

/// Bytes per Intel HEX data record when writing.
const IHEX_RECORD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum ImageFormat {
    /// Intel HEX
    #[value(name = "hex")]
    IntelHex,
    /// Raw binary, loaded at address 0
    #[value(name = "bin")]
    Binary,
}

pub fn read_image_from_file<P: AsRef<Path>>(path: P) -> Result<MemoryImage> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;
    anyhow::ensure!(!raw.is_empty(), "{} is empty", p.display());

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    let image = match format {
        ImageFormat::IntelHex => read_ihex(str::from_utf8(&raw)?)?,
        ImageFormat::Binary => read_binary(&raw)?,
    };
    anyhow::ensure!(!image.is_empty(), "{} contains no data", p.display());
    Ok(image)
}

pub fn guess_format(path: &Path, raw: &[u8]) -> ImageFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return ImageFormat::IntelHex;
    }

    if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        ImageFormat::IntelHex
    } else {
        ImageFormat::Binary
    }
}

pub fn read_ihex(data: &str) -> Result<MemoryImage> {
    let mut base_address = 0;

    let mut image = MemoryImage::new();
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;
                let end = offset as u64 + value.len() as u64;
                anyhow::ensure!(
                    end <= ADDRESS_SPACE_END as u64,
                    "data record at 0x{:08X} lies outside the 24-bit address space",
                    offset
                );
                image.extend_from(offset, &value);
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    Ok(image)
}

pub fn read_binary(raw: &[u8]) -> Result<MemoryImage> {
    anyhow::ensure!(
        raw.len() <= ADDRESS_SPACE_END as usize,
        "binary image of {} bytes exceeds the 24-bit address space",
        raw.len()
    );
    let mut image = MemoryImage::new();
    image.extend_from(0, raw);
    Ok(image)
}

pub fn write_image_to_file<P: AsRef<Path>>(
    image: &MemoryImage,
    path: P,
    format: ImageFormat,
) -> Result<()> {
    let bytes = match format {
        ImageFormat::IntelHex => write_ihex(image)?.into_bytes(),
        ImageFormat::Binary => write_binary(image),
    };
    std::fs::write(path.as_ref(), bytes)?;
    log::info!("Saved {} bytes to {}", image.len(), path.as_ref().display());
    Ok(())
}

/// Intel HEX text with extended linear address records.
pub fn write_ihex(image: &MemoryImage) -> Result<String> {
    let mut records = vec![];
    let mut upper: Option<u16> = None;

    for (start, end) in image.segments() {
        let mut addr = start;
        while addr < end {
            let hi = (addr >> 16) as u16;
            if upper != Some(hi) {
                records.push(Record::ExtendedLinearAddress(hi));
                upper = Some(hi);
            }
            // records never cross a 64 KiB boundary
            let bank_end = ((hi as u32) + 1) << 16;
            let n = (end.min(bank_end) - addr).min(IHEX_RECORD_SIZE as u32);
            let value = image.range(addr, addr + n - 1).map(|(_, b)| b).collect();
            records.push(Record::Data {
                offset: addr as u16,
                value,
            });
            addr += n;
        }
    }
    records.push(Record::EndOfFile);
    Ok(ihex::create_object_file_representation(&records)?)
}

/// Raw bytes from the lowest to the highest present address, holes as `0xFF`.
pub fn write_binary(image: &MemoryImage) -> Vec<u8> {
    let (Some(lo), Some(hi)) = (image.min_address(), image.max_address()) else {
        return Vec::new();
    };
    let mut buf = vec![ERASED_BYTE; (hi - lo) as usize + 1];
    for (addr, b) in image.iter() {
        buf[(addr - lo) as usize] = b;
    }
    buf
}
