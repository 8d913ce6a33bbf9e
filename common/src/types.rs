use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Device name used when a band does not say otherwise.
pub const DEFAULT_DEVICE: &str = "numa-0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileableKey(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkKey(pub String);

macro_rules! string_key {
    ($name:ident) => {
        impl $name {
            pub fn new(key: impl Into<String>) -> Self {
                Self(key.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_key!(TileableKey);
string_key!(ChunkKey);

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Address of the node currently holding a chunk, plus the device on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Band {
    pub address: String,
    pub device: String,
}

impl Band {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            device: DEFAULT_DEVICE.to_string(),
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.device)
    }
}

/// Storage medium class a chunk is stored at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StorageLevel {
    Gpu,
    #[default]
    Memory,
    Disk,
    Remote,
}

impl StorageLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageLevel::Gpu => "gpu",
            StorageLevel::Memory => "memory",
            StorageLevel::Disk => "disk",
            StorageLevel::Remote => "remote",
        }
    }
}

impl fmt::Display for StorageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" => Ok(StorageLevel::Gpu),
            "memory" => Ok(StorageLevel::Memory),
            "disk" => Ok(StorageLevel::Disk),
            "remote" => Ok(StorageLevel::Remote),
            other => Err(format!("unknown storage level `{other}`")),
        }
    }
}

/// Result of a storage put: where the object landed and how large it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataInfo {
    pub object_id: String,
    pub level: StorageLevel,
    pub memory_size: u64,
    pub store_size: u64,
    pub band: Band,
}

/// How a lookup treats a missing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    #[default]
    Raise,
    /// A missing entry becomes `None`/success. Any other failure still raises.
    Ignore,
}

bitflags! {
    /// Selects which fields of a [`ChunkMeta`] a lookup fills in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MetaFields: u8 {
        const BANDS = 1;
        const MEMORY_SIZE = 1 << 1;
        const STORE_SIZE = 1 << 2;
        const SHAPE = 1 << 3;
        const INDEX = 1 << 4;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub chunk_key: ChunkKey,
    pub bands: Vec<Band>,
    pub memory_size: u64,
    pub store_size: u64,
    pub shape: Vec<usize>,
    pub index: Vec<usize>,
}

impl ChunkMeta {
    /// Copy of this meta carrying only the requested fields; the rest are
    /// left at their defaults.
    pub fn select(&self, fields: MetaFields) -> ChunkMeta {
        ChunkMeta {
            chunk_key: self.chunk_key.clone(),
            bands: if fields.contains(MetaFields::BANDS) {
                self.bands.clone()
            } else {
                Vec::new()
            },
            memory_size: if fields.contains(MetaFields::MEMORY_SIZE) {
                self.memory_size
            } else {
                0
            },
            store_size: if fields.contains(MetaFields::STORE_SIZE) {
                self.store_size
            } else {
                0
            },
            shape: if fields.contains(MetaFields::SHAPE) {
                self.shape.clone()
            } else {
                Vec::new()
            },
            index: if fields.contains(MetaFields::INDEX) {
                self.index.clone()
            } else {
                Vec::new()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_level_parse() {
        assert_eq!("MEMORY".parse::<StorageLevel>(), Ok(StorageLevel::Memory));
        assert_eq!("disk".parse::<StorageLevel>(), Ok(StorageLevel::Disk));
        assert!("tape".parse::<StorageLevel>().is_err());
        assert_eq!(StorageLevel::Disk.to_string(), "disk");
    }

    #[test]
    fn test_meta_select_drops_unrequested_fields() {
        let meta = ChunkMeta {
            chunk_key: ChunkKey::from("c1"),
            bands: vec![Band::new("node-0")],
            memory_size: 64,
            store_size: 64,
            shape: vec![2, 4],
            index: vec![0, 1],
        };
        let only_bands = meta.select(MetaFields::BANDS);
        assert_eq!(only_bands.bands, meta.bands);
        assert_eq!(only_bands.memory_size, 0);
        assert!(only_bands.shape.is_empty());
        assert_eq!(meta.select(MetaFields::all()), meta);
    }
}
