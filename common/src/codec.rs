//! Binary encoding used on every wire surface (storage tunnel bodies,
//! `DataInfo` replies, stored disk-tier files).

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DataError;

pub const CONTENT_TYPE: &str = "application/octet-stream";

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, DataError> {
    bincode::serialize(value).map_err(|e| DataError::Codec(e.to_string()))
}

pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DataError> {
    bincode::deserialize(bytes).map_err(|e| DataError::Codec(e.to_string()))
}
