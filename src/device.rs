//! Target chip definitions and config byte decoding
use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A chip family, as described by `devices/*.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub description: String,
    pub variants: Vec<Chip>,
    #[serde(default)]
    pub config_fields: Vec<ConfigField>,
}

/// Represents a target MCU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chip {
    pub name: String,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub device_id: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub mask: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub flash_size: u32,
}

impl ::std::fmt::Display for Chip {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(
            f,
            "{}(0x{:04x}, {}KiB flash)",
            self.name,
            self.device_id,
            self.flash_size / 1024
        )
    }
}

impl Chip {
    pub fn matches(&self, device_id: u16) -> bool {
        (device_id as u32 & self.mask) == (self.device_id & self.mask)
    }
}

/// One named bit field inside a config byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigField {
    /// Byte offset from the start of config memory
    pub offset: usize,
    pub name: String,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub mask: u32,
    pub shift: u32,
    /// Labels per field value; an empty table prints the raw number.
    #[serde(default)]
    pub values: BTreeMap<u8, String>,
    #[serde(default)]
    pub default: Option<String>,
}

impl ConfigField {
    pub fn decode(&self, byte: u8) -> String {
        let value = ((byte as u32 & self.mask) >> self.shift) as u8;
        if self.values.is_empty() {
            return format!("{}={}", self.name, value);
        }
        let label = self
            .values
            .get(&value)
            .or(self.default.as_ref())
            .cloned()
            .unwrap_or_else(|| format!("0x{:X}", value));
        format!("{}={}", self.name, label)
    }
}

/// One decoded config byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRow {
    /// e.g. `CONFIG1L`
    pub register: String,
    pub address: u32,
    pub value: u8,
    pub description: String,
}

pub struct ChipDB {
    families: Vec<Family>,
}

impl ChipDB {
    pub fn load() -> Result<Self> {
        Ok(ChipDB {
            families: vec![serde_yaml::from_str(include_str!(
                "../devices/pic18.yaml"
            ))?],
        })
    }

    pub fn find_chip(&self, device_id: u16) -> Option<&Chip> {
        let chip = self
            .families
            .iter()
            .flat_map(|f| f.variants.iter())
            .find(|c| c.matches(device_id));
        match chip {
            Some(chip) => log::debug!("Find chip: {}", chip),
            None => log::warn!("Unknown device ID 0x{:04x}", device_id),
        }
        chip
    }

    fn family_of(&self, device_id: u16) -> Option<&Family> {
        self.families
            .iter()
            .find(|f| f.variants.iter().any(|c| c.matches(device_id)))
    }

    /// Decode config bytes read from `base`. Unknown parts use the first family's table.
    pub fn decode_config(&self, device_id: Option<u16>, base: u32, bytes: &[u8]) -> Vec<ConfigRow> {
        let fields: &[ConfigField] = device_id
            .and_then(|id| self.family_of(id))
            .or(self.families.first())
            .map(|f| f.config_fields.as_slice())
            .unwrap_or_default();
        decode_config(fields, base, bytes)
    }
}

/// Pure lookup from config bytes to labelled rows.
pub fn decode_config(fields: &[ConfigField], base: u32, bytes: &[u8]) -> Vec<ConfigRow> {
    bytes
        .iter()
        .enumerate()
        .map(|(offset, &value)| {
            let description = fields
                .iter()
                .filter(|f| f.offset == offset)
                .map(|f| f.decode(value))
                .collect::<Vec<_>>()
                .join(" ");
            ConfigRow {
                register: format!(
                    "CONFIG{}{}",
                    offset / 2 + 1,
                    if offset % 2 == 0 { 'L' } else { 'H' }
                ),
                address: base + offset as u32,
                value,
                description,
            }
        })
        .collect()
}

fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(n) = s.strip_suffix("KiB") {
        n.parse::<u32>().map(|n| n * 1024)
    } else if let Some(n) = s.strip_suffix("KB").or_else(|| s.strip_suffix('K')) {
        n.parse::<u32>().map(|n| n * 1024)
    } else {
        s.parse()
    };
    parsed.map_err(|e| D::Error::custom(format!("error while parsing {:?}: {}", s, e)))
}
