//! Client-side tileables and the graph a session submits for execution.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::data::ChunkIndex;
use crate::tensor::{IndexItem, Tensor};
use crate::types::{ChunkKey, TileableKey};

/// Hex digest over `parts`; used for every content key in the engine.
pub fn tokenize(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Operation producing a tileable from its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Ones { shape: Vec<usize>, chunk_size: usize },
    FromTensor { value: Tensor, chunk_size: usize },
    AddScalar { value: f64 },
    Index { indexes: Vec<IndexItem> },
    /// Always raises `kind: message` when executed.
    Fail { kind: String, message: String },
}

impl Operand {
    pub fn name(&self) -> &'static str {
        match self {
            Operand::Ones { .. } => "Ones",
            Operand::FromTensor { .. } => "FromTensor",
            Operand::AddScalar { .. } => "AddScalar",
            Operand::Index { .. } => "Index",
            Operand::Fail { .. } => "Fail",
        }
    }
}

/// Externally visible metadata of a tileable. `None` extents are unknown until
/// the tileable has been executed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TileableParams {
    pub shape: Vec<Option<usize>>,
}

impl TileableParams {
    pub fn known(shape: &[usize]) -> Self {
        Self {
            shape: shape.iter().copied().map(Some).collect(),
        }
    }

    pub fn concrete_shape(&self) -> Option<Vec<usize>> {
        self.shape.iter().copied().collect()
    }
}

struct TileableInner {
    key: TileableKey,
    op: Operand,
    inputs: Vec<Tileable>,
    params: RwLock<TileableParams>,
}

/// Logical, possibly not yet materialized result. Clones share identity.
#[derive(Clone)]
pub struct Tileable {
    inner: Arc<TileableInner>,
}

impl fmt::Debug for Tileable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tileable")
            .field("key", &self.inner.key)
            .field("op", &self.inner.op.name())
            .field("params", &self.params())
            .finish()
    }
}

impl Tileable {
    fn build(op: Operand, inputs: Vec<Tileable>, params: TileableParams) -> Self {
        let op_bytes = bincode::serialize(&op).unwrap_or_default();
        let mut parts: Vec<&[u8]> = vec![op.name().as_bytes(), op_bytes.as_slice()];
        for input in &inputs {
            parts.push(input.key().as_str().as_bytes());
        }
        let key = TileableKey(tokenize(&parts));
        Self {
            inner: Arc::new(TileableInner {
                key,
                op,
                inputs,
                params: RwLock::new(params),
            }),
        }
    }

    pub fn ones(shape: &[usize], chunk_size: usize) -> Self {
        Self::build(
            Operand::Ones {
                shape: shape.to_vec(),
                chunk_size: chunk_size.max(1),
            },
            Vec::new(),
            TileableParams::known(shape),
        )
    }

    pub fn from_tensor(value: Tensor, chunk_size: usize) -> Self {
        let params = TileableParams::known(value.shape());
        Self::build(
            Operand::FromTensor {
                value,
                chunk_size: chunk_size.max(1),
            },
            Vec::new(),
            params,
        )
    }

    pub fn add(&self, value: f64) -> Self {
        Self::build(
            Operand::AddScalar { value },
            vec![self.clone()],
            self.params(),
        )
    }

    pub fn index(&self, indexes: Vec<IndexItem>) -> Self {
        let input_shape = self.params().shape;
        let mut shape = Vec::new();
        for (axis, size) in input_shape.iter().enumerate() {
            match indexes.get(axis) {
                None => shape.push(*size),
                Some(IndexItem::Int(_)) => {}
                Some(item) => shape.push(item.output_len(*size)),
            }
        }
        Self::build(
            Operand::Index { indexes },
            vec![self.clone()],
            TileableParams { shape },
        )
    }

    /// A tileable whose execution deterministically raises `kind`.
    pub fn fail(&self, kind: &str, message: &str) -> Self {
        Self::build(
            Operand::Fail {
                kind: kind.to_string(),
                message: message.to_string(),
            },
            vec![self.clone()],
            self.params(),
        )
    }

    pub fn key(&self) -> &TileableKey {
        &self.inner.key
    }

    pub fn op(&self) -> &Operand {
        &self.inner.op
    }

    pub fn inputs(&self) -> &[Tileable] {
        &self.inner.inputs
    }

    pub fn params(&self) -> TileableParams {
        match self.inner.params.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replaces the params once the actual shape is known after execution.
    pub fn set_params(&self, params: TileableParams) {
        match self.inner.params.write() {
            Ok(mut guard) => *guard = params,
            Err(poisoned) => *poisoned.into_inner() = params,
        }
    }

    pub fn shape(&self) -> Vec<Option<usize>> {
        self.params().shape
    }
}

impl PartialEq for Tileable {
    fn eq(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key
    }
}

impl Eq for Tileable {}

/// Wire form of one tileable in a submitted graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub key: TileableKey,
    pub op: Operand,
    pub inputs: Vec<TileableKey>,
    pub params: TileableParams,
}

/// Tileables reachable from the requested results, inputs first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TileableGraph {
    pub nodes: Vec<GraphNode>,
    pub results: Vec<TileableKey>,
}

impl TileableGraph {
    pub fn build(results: &[Tileable]) -> Self {
        let mut visited = HashSet::new();
        let mut nodes = Vec::new();
        for tileable in results {
            Self::visit(tileable, &mut visited, &mut nodes);
        }
        Self {
            nodes,
            results: results.iter().map(|t| t.key().clone()).collect(),
        }
    }

    fn visit(tileable: &Tileable, visited: &mut HashSet<TileableKey>, nodes: &mut Vec<GraphNode>) {
        if visited.contains(tileable.key()) {
            return;
        }
        for input in tileable.inputs() {
            Self::visit(input, visited, nodes);
        }
        visited.insert(tileable.key().clone());
        nodes.push(GraphNode {
            key: tileable.key().clone(),
            op: tileable.op().clone(),
            inputs: tileable.inputs().iter().map(|i| i.key().clone()).collect(),
            params: tileable.params(),
        });
    }

    pub fn node(&self, key: &TileableKey) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| &n.key == key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One physical partition of a materialized tileable. The owning band is
/// looked up lazily through the metadata directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub key: ChunkKey,
    pub index: ChunkIndex,
    pub shape: Vec<usize>,
}

impl Chunk {
    pub fn key_for(tileable_key: &TileableKey, index: &[usize]) -> ChunkKey {
        let index_bytes = bincode::serialize(index).unwrap_or_default();
        ChunkKey(tokenize(&[tileable_key.as_str().as_bytes(), index_bytes.as_slice()]))
    }
}

/// Readable physical plan of a tileable after successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchTileable {
    pub tileable_key: TileableKey,
    pub params: TileableParams,
    pub chunks: Vec<Chunk>,
}

impl FetchTileable {
    pub fn chunk_keys(&self) -> Vec<ChunkKey> {
        self.chunks.iter().map(|c| c.key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_deterministic() {
        let a = Tileable::ones(&[10, 10], 5).add(1.0);
        let b = Tileable::ones(&[10, 10], 5).add(1.0);
        let c = Tileable::ones(&[10, 10], 5).add(2.0);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a, b);
    }

    #[test]
    fn test_graph_is_topological_and_deduplicated() {
        let base = Tileable::ones(&[4], 2);
        let x = base.add(1.0);
        let y = base.add(2.0);
        let graph = TileableGraph::build(&[x.clone(), y.clone()]);
        assert_eq!(graph.len(), 3);
        assert_eq!(&graph.nodes[0].key, base.key());
        assert_eq!(graph.results, vec![x.key().clone(), y.key().clone()]);
    }

    #[test]
    fn test_index_shape_inference() {
        let t = Tileable::ones(&[10, 8], 4);
        let sliced = t.index(vec![IndexItem::range(2, 5), IndexItem::Int(0)]);
        assert_eq!(sliced.shape(), vec![Some(3)]);
        let masked = t.index(vec![IndexItem::Mask(vec![true; 10])]);
        assert_eq!(masked.shape(), vec![None, Some(8)]);
    }

    #[test]
    fn test_set_params_visible_to_clones() {
        let t = Tileable::ones(&[2], 1);
        let clone = t.clone();
        t.set_params(TileableParams::known(&[5]));
        assert_eq!(clone.params().concrete_shape(), Some(vec![5]));
    }
}
