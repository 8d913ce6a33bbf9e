use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::tensor::{IndexItem, Tensor};

/// Position of a chunk within its tileable's partition layout.
pub type ChunkIndex = Vec<usize>;

/// Value stored for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChunkData {
    Tensor(Tensor),
    Bytes(Vec<u8>),
}

impl ChunkData {
    pub fn nbytes(&self) -> u64 {
        match self {
            ChunkData::Tensor(t) => t.nbytes(),
            ChunkData::Bytes(b) => b.len() as u64,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            ChunkData::Tensor(t) => Some(t),
            ChunkData::Bytes(_) => None,
        }
    }

    pub fn into_tensor(self) -> Result<Tensor, DataError> {
        match self {
            ChunkData::Tensor(t) => Ok(t),
            ChunkData::Bytes(_) => Err(DataError::TypeMismatch(
                "expected a tensor, found bytes".to_string(),
            )),
        }
    }

    /// Partial read: applies plain index items to a tensor value.
    pub fn select(&self, conditions: &[IndexItem]) -> Result<ChunkData, DataError> {
        match self {
            ChunkData::Tensor(t) => Ok(ChunkData::Tensor(t.index(conditions)?)),
            ChunkData::Bytes(_) if conditions.is_empty() => Ok(self.clone()),
            ChunkData::Bytes(_) => Err(DataError::TypeMismatch(
                "conditions cannot be applied to bytes".to_string(),
            )),
        }
    }
}

impl From<Tensor> for ChunkData {
    fn from(value: Tensor) -> Self {
        ChunkData::Tensor(value)
    }
}

/// Concatenates chunk results back into one value according to their index.
///
/// Tensors are joined along the innermost axis first, then outwards, so the
/// arrival order of `pieces` does not matter.
pub fn merge_chunks(mut pieces: Vec<(ChunkIndex, ChunkData)>) -> Result<ChunkData, DataError> {
    pieces.sort_by(|a, b| a.0.cmp(&b.0));
    let holds_tensors = match pieces.first() {
        None => return Err(DataError::Empty),
        Some((_, data)) => matches!(data, ChunkData::Tensor(_)),
    };
    if holds_tensors {
        let mut items = Vec::with_capacity(pieces.len());
        for (index, data) in pieces {
            items.push((index, data.into_tensor()?));
        }
        return merge_tensors(items).map(ChunkData::Tensor);
    }

    let mut result = None;
    for (_, data) in pieces {
        match data {
            ChunkData::Bytes(b) if b.is_empty() => continue,
            ChunkData::Bytes(b) => {
                if result.is_some() {
                    return Err(DataError::TypeMismatch(
                        "cannot merge more than one non-empty bytes chunk".to_string(),
                    ));
                }
                result = Some(b);
            }
            ChunkData::Tensor(_) => {
                return Err(DataError::TypeMismatch(
                    "cannot merge bytes with tensors".to_string(),
                ));
            }
        }
    }
    Ok(ChunkData::Bytes(result.unwrap_or_default()))
}

fn merge_tensors(mut items: Vec<(ChunkIndex, Tensor)>) -> Result<Tensor, DataError> {
    let ndim = items[0].1.ndim();
    if ndim == 0 {
        return Ok(items.swap_remove(0).1);
    }
    for axis in (1..ndim).rev() {
        let mut grouped: Vec<(ChunkIndex, Vec<Tensor>)> = Vec::new();
        for (index, tensor) in items {
            let prefix = index[..axis].to_vec();
            match grouped.last_mut() {
                Some((last, group)) if *last == prefix => group.push(tensor),
                _ => grouped.push((prefix, vec![tensor])),
            }
        }
        items = grouped
            .into_iter()
            .map(|(prefix, group)| Tensor::concatenate(&group, axis).map(|t| (prefix, t)))
            .collect::<Result<_, _>>()?;
    }
    let rows: Vec<Tensor> = items.into_iter().map(|(_, t)| t).collect();
    Tensor::concatenate(&rows, 0)
}
