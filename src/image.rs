//! Sparse, byte-addressed memory image.

use std::collections::BTreeMap;

/// Address to byte map covering whatever an image file or a read-back supplied.
///
/// Ordered so that iteration and segment listing are always ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    bytes: BTreeMap<u32, u8>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: u32, value: u8) -> Option<u8> {
        self.bytes.insert(address, value)
    }

    /// Store `data` at consecutive addresses starting at `address`.
    /// Bytes that would land past `u32::MAX` are dropped.
    pub fn extend_from(&mut self, address: u32, data: &[u8]) {
        let room = (u32::MAX - address) as u64 + 1;
        let take = (data.len() as u64).min(room) as usize;
        for (addr, &b) in (address..=u32::MAX).zip(&data[..take]) {
            self.bytes.insert(addr, b);
        }
    }

    pub fn contains(&self, address: u32) -> bool {
        self.bytes.contains_key(&address)
    }

    pub fn get(&self, address: u32) -> Option<u8> {
        self.bytes.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn min_address(&self) -> Option<u32> {
        self.bytes.keys().next().copied()
    }

    pub fn max_address(&self) -> Option<u32> {
        self.bytes.keys().next_back().copied()
    }

    /// Present addresses, ascending.
    pub fn addresses(&self) -> impl Iterator<Item = u32> + '_ {
        self.bytes.keys().copied()
    }

    /// `(address, byte)` pairs, ascending.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.bytes.iter().map(|(&a, &b)| (a, b))
    }

    /// `(address, byte)` pairs with `start <= address <= end`.
    pub fn range(&self, start: u32, end: u32) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.bytes.range(start..=end).map(|(&a, &b)| (a, b))
    }

    /// Maximal runs of consecutive addresses as `(start, end_exclusive)`.
    ///
    /// A byte at `u32::MAX` has no representable exclusive end and is left out.
    pub fn segments(&self) -> Vec<(u32, u32)> {
        let mut segments: Vec<(u32, u32)> = Vec::new();
        for addr in self.addresses() {
            let Some(next) = addr.checked_add(1) else {
                break;
            };
            match segments.last_mut() {
                Some((_, end)) if *end == addr => *end = next,
                _ => segments.push((addr, next)),
            }
        }
        segments
    }
}

impl FromIterator<(u32, u8)> for MemoryImage {
    fn from_iter<I: IntoIterator<Item = (u32, u8)>>(iter: I) -> Self {
        MemoryImage {
            bytes: iter.into_iter().collect(),
        }
    }
}
