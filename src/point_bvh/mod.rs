mod building;
mod flattening;
mod gpu_layout;
mod printing;
mod traversal;

use std::ops::Range;

use bon::Builder;
use index_vec::{IndexSlice, IndexVec};
use thiserror::Error;

use crate::geometry::{Axis, FloatType, WorldBox};
use crate::memory_arena::{ArenaError, MemoryArena};

pub use gpu_layout::GpuBvhNode;
pub use printing::BvhStatistics;
pub use traversal::{TraversalStack, points_near_ray};

index_vec::define_index_type! {
    pub struct NodeIdx = u32;
}

/// How the builder partitions points of an inner node between its two children.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SplitMethod {
    /// Surface area heuristic evaluated over equal width buckets.
    Sah,
    /// Spatial midpoint of the longest axis.
    #[default]
    Middle,
    /// Median point along the longest axis, both children get the same number of points.
    EqualCounts,
}

#[derive(Clone, Debug, Builder)]
pub struct BvhSettings {
    /// Leaf boxes are grown by half of this on every face.
    #[builder(default = 0.5)]
    pub voxel_length: FloatType,
    /// Nodes whose box is smaller than this along every axis become leaves.
    #[builder(default = 1.0)]
    pub min_bound_length: FloatType,
    #[builder(default)]
    pub split_method: SplitMethod,
    /// Block size of the arena used for build nodes.
    #[builder(default = 128)]
    pub arena_block_size_mib: usize,
}

impl BvhSettings {
    pub fn validate(&self) -> Result<(), BvhError> {
        if !self.voxel_length.is_finite() || self.voxel_length < 0.0 {
            return Err(BvhError::InvalidSettings(
                "voxel length must be finite and non-negative",
            ));
        }
        if !self.min_bound_length.is_finite() {
            return Err(BvhError::InvalidSettings("minimum bound length must be finite"));
        }
        if self.arena_block_size_mib == 0 {
            return Err(BvhError::InvalidSettings("arena block size must be non-zero"));
        }
        if self.arena_block_size_mib > MemoryArena::MAX_BLOCK_SIZE / (1024 * 1024) {
            return Err(BvhError::InvalidSettings("arena block size must be below 4 GiB"));
        }
        Ok(())
    }
}

impl Default for BvhSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Error)]
pub enum BvhError {
    #[error("Arena allocation failed: {0}")]
    Arena(#[from] ArenaError),

    #[error("Point cloud has {count} points, at most {max} are supported")]
    TooManyPoints { count: usize, max: usize },

    #[error("Invalid settings: {0}")]
    InvalidSettings(&'static str),

    #[error("Leaf node {node:?} holds {count} points, GPU layout supports at most {max}")]
    LeafTooLarge { node: NodeIdx, count: u32, max: u32 },

    #[error("Traversal stack exceeded its limit of {limit} entries")]
    TraversalStackOverflow { limit: usize },
}

/// Node of the flattened tree.
/// Left child of an interior node is always the node directly following it.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearBvhNode {
    pub bounds: WorldBox,
    pub kind: LinearNodeKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinearNodeKind {
    Leaf { primitives_offset: u32, count: u32 },
    Interior { second_child: NodeIdx, axis: Axis },
}

impl LinearBvhNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, LinearNodeKind::Leaf { .. })
    }
}

/// Bounding volume hierarchy over a point cloud, flattened into a single node array.
#[derive(Clone, Debug, Default)]
pub struct PointBvh {
    nodes: IndexVec<NodeIdx, LinearBvhNode>,
    /// Point indices in leaf order; leaves reference ranges of this.
    order: Vec<u32>,
    /// Bytes the build arena held when the tree was built.
    arena_bytes: usize,
}

impl PointBvh {
    pub fn nodes(&self) -> &IndexSlice<NodeIdx, [LinearBvhNode]> {
        &self.nodes
    }

    pub fn order(&self) -> &[u32] {
        &self.order
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn leaves(&self) -> impl Iterator<Item = (NodeIdx, &LinearBvhNode)> {
        self.nodes.iter_enumerated().filter(|(_, node)| node.is_leaf())
    }

    /// Range in the order array covering all leaves below the node.
    fn order_range(&self, index: NodeIdx) -> Range<usize> {
        let mut first = index;
        let start = loop {
            match self.nodes[first].kind {
                LinearNodeKind::Leaf {
                    primitives_offset, ..
                } => break primitives_offset as usize,
                LinearNodeKind::Interior { .. } => first += 1,
            }
        };

        let mut last = index;
        let end = loop {
            match self.nodes[last].kind {
                LinearNodeKind::Leaf {
                    primitives_offset,
                    count,
                } => break (primitives_offset + count) as usize,
                LinearNodeKind::Interior { second_child, .. } => last = second_child,
            }
        };

        start..end
    }
}
