//! Split a sparse image into the payloads the write commands accept.
//!
//! Flash goes out as whole, page-aligned pages. Config bytes go out as a
//! single contiguous block. EEPROM goes out as one contiguous block cut into
//! chunks no larger than the protocol's chunk size. Holes are filled with
//! the erased value `0xFF`.

use std::collections::BTreeMap;

use crate::constants::{Layout, Region, ERASED_BYTE};
use crate::image::MemoryImage;

/// One flash page, always `Layout::page_size` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub address: u32,
    pub data: Vec<u8>,
}

/// A contiguous run of bytes starting at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Block {
    /// Build a block spanning `[min, max]` of the given bytes. `None` when empty.
    fn span(bytes: impl IntoIterator<Item = (u32, u8)>) -> Option<Block> {
        let bytes: Vec<(u32, u8)> = bytes.into_iter().collect();
        let base = bytes.iter().map(|&(a, _)| a).min()?;
        let top = bytes.iter().map(|&(a, _)| a).max()?;

        let mut data = vec![ERASED_BYTE; (top - base) as usize + 1];
        for (addr, value) in bytes {
            data[(addr - base) as usize] = value;
        }
        Some(Block {
            address: base,
            data,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Exclusive end address.
    pub fn end(&self) -> u32 {
        self.address + self.data.len() as u32
    }

    /// Consecutive pieces of at most `size` bytes, covering the block exactly.
    pub fn chunks(&self, size: usize) -> Vec<Block> {
        assert!(size > 0, "chunk size must be non-zero");
        self.data
            .chunks(size)
            .enumerate()
            .map(|(i, chunk)| Block {
                address: self.address + (i * size) as u32,
                data: chunk.to_vec(),
            })
            .collect()
    }
}

/// Read-only view of an image classified by region.
pub struct Partition<'a> {
    image: &'a MemoryImage,
    layout: Layout,
}

impl<'a> Partition<'a> {
    pub fn new(image: &'a MemoryImage, layout: Layout) -> Self {
        Partition { image, layout }
    }

    fn bytes_in(&self, region: Region) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.image
            .iter()
            .filter(move |&(addr, _)| self.layout.region(addr) == region)
    }

    /// Every page touched by a flash byte, ascending.
    pub fn flash_pages(&self) -> Vec<Page> {
        let page_size = self.layout.page_size;
        let mut pages: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        for (addr, value) in self.bytes_in(Region::Flash) {
            let page = self.layout.page_of(addr);
            let data = pages
                .entry(page)
                .or_insert_with(|| vec![ERASED_BYTE; page_size]);
            data[(addr - page) as usize] = value;
        }
        pages
            .into_iter()
            .map(|(address, data)| Page { address, data })
            .collect()
    }

    pub fn config_block(&self) -> Option<Block> {
        Block::span(self.bytes_in(Region::Config))
    }

    pub fn eeprom_block(&self) -> Option<Block> {
        Block::span(self.bytes_in(Region::Eeprom))
    }

    pub fn eeprom_chunks(&self, chunk_size: usize) -> Vec<Block> {
        self.eeprom_block()
            .map(|block| block.chunks(chunk_size))
            .unwrap_or_default()
    }

    /// Highest flash address present, if any.
    pub fn flash_end(&self) -> Option<u32> {
        self.bytes_in(Region::Flash).map(|(a, _)| a).last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(image: &MemoryImage) -> Partition<'_> {
        Partition::new(image, Layout::PIC18)
    }

    #[test]
    fn single_flash_byte_makes_one_page() {
        let mut image = MemoryImage::new();
        image.insert(0x000010, 0x42);
        let pages = partition(&image).flash_pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].address, 0x0);
        assert_eq!(pages[0].data.len(), 128);
        assert_eq!(pages[0].data[0x10], 0x42);
        assert_eq!(pages[0].data.iter().filter(|&&b| b == 0xFF).count(), 127);
    }

    #[test]
    fn pages_are_ascending_and_aligned() {
        let mut image = MemoryImage::new();
        image.insert(0x1234, 1);
        image.insert(0x0081, 2);
        image.insert(0x0080, 3);
        image.insert(0x1FFFF, 4);
        image.insert(0x000005, 5);
        let pages = partition(&image).flash_pages();
        let addrs: Vec<u32> = pages.iter().map(|p| p.address).collect();
        assert_eq!(addrs, vec![0x0000, 0x0080, 0x1200, 0x1FF80]);
        for page in &pages {
            assert_eq!(page.address % 128, 0);
            assert_eq!(page.data.len(), 128);
        }
        assert_eq!(&pages[1].data[..2], &[3u8, 2]);
        assert_eq!(pages[2].data[0x34], 1);
        assert_eq!(pages[3].data[127], 4);
    }

    #[test]
    fn config_block_fills_gaps() {
        let mut image = MemoryImage::new();
        image.insert(0x300000, 0x11);
        image.insert(0x300005, 0x55);
        let block = partition(&image).config_block().unwrap();
        assert_eq!(block.address, 0x300000);
        assert_eq!(block.data, vec![0x11, 0xFF, 0xFF, 0xFF, 0xFF, 0x55]);
        assert!(partition(&image).flash_pages().is_empty());
    }

    #[test]
    fn config_block_absent_without_config_bytes() {
        let mut image = MemoryImage::new();
        image.insert(0x0, 0);
        image.insert(0x310000, 0);
        assert_eq!(partition(&image).config_block(), None);
    }

    #[test]
    fn block_bounds_follow_present_bytes() {
        let mut image = MemoryImage::new();
        image.insert(0x310007, 0xAB);
        image.insert(0x310003, 0xCD);
        let block = partition(&image).eeprom_block().unwrap();
        assert_eq!(block.address, 0x310003);
        assert_eq!(block.len(), 0x310007 - 0x310003 + 1);
        assert_eq!(block.end(), 0x310008);
    }

    #[test]
    fn eeprom_chunking_covers_block() {
        let mut image = MemoryImage::new();
        image.extend_from(0x310000, &(0..300u32).map(|i| i as u8).collect::<Vec<_>>());
        let p = partition(&image);
        let chunks = p.eeprom_chunks(128);
        let lens: Vec<usize> = chunks.iter().map(Block::len).collect();
        let addrs: Vec<u32> = chunks.iter().map(|c| c.address).collect();
        assert_eq!(lens, vec![128, 128, 44]);
        assert_eq!(addrs, vec![0x310000, 0x310080, 0x310100]);

        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(joined, p.eeprom_block().unwrap().data);
    }

    #[test]
    fn chunk_count_is_ceiling() {
        for len in [1usize, 127, 128, 129, 256, 1000] {
            let block = Block {
                address: 0x310000,
                data: vec![0; len],
            };
            let chunks = block.chunks(128);
            assert_eq!(chunks.len(), len.div_ceil(128));
            assert_eq!(chunks.iter().map(Block::len).sum::<usize>(), len);
            assert!(chunks.iter().all(|c| c.len() <= 128));
            for pair in chunks.windows(2) {
                assert_eq!(pair[0].end(), pair[1].address);
            }
        }
    }

    #[test]
    fn regions_are_disjoint() {
        let mut image = MemoryImage::new();
        image.insert(0x2FFFFF, 1);
        image.insert(0x30000F, 2);
        image.insert(0x300010, 3);
        image.insert(0x310000, 4);
        let p = partition(&image);
        let pages = p.flash_pages();
        assert_eq!(pages.len(), 2);
        assert_eq!(p.config_block().unwrap().data, vec![2]);
        assert_eq!(p.eeprom_block().unwrap().data, vec![4]);
        assert_eq!(p.flash_end(), Some(0x300010));
    }

    #[test]
    fn empty_image_produces_nothing() {
        let image = MemoryImage::new();
        let p = partition(&image);
        assert!(p.flash_pages().is_empty());
        assert!(p.config_block().is_none());
        assert!(p.eeprom_chunks(128).is_empty());
    }
}
