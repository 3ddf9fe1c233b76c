use std::fmt::Display;
use std::io;

use super::{LinearBvhNode, LinearNodeKind, NodeIdx, PointBvh};
use crate::geometry::WorldPoint;
use crate::util::SampleSummary;

#[derive(Clone, Debug)]
pub struct BvhStatistics {
    pub node_count: usize,
    pub leaf_count: usize,
    pub point_count: usize,
    /// Number of levels from the root down to each leaf, root alone is 1.
    pub leaf_depth: SampleSummary,
    pub leaf_size: SampleSummary,
    /// Memory held by the flattened tree.
    pub node_bytes: usize,
    /// Memory the build arena held at the end of the build.
    pub arena_bytes: usize,
}

impl Display for BvhStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Nodes: {} ({} leaves) for {} points",
            self.node_count, self.leaf_count, self.point_count
        )?;
        writeln!(f, "Leaf depth: {}", self.leaf_depth)?;
        writeln!(f, "Leaf size: {}", self.leaf_size)?;
        write!(
            f,
            "Memory: {:.2} MB nodes, {:.2} MB arena",
            self.node_bytes as f32 / (1024.0 * 1024.0),
            self.arena_bytes as f32 / (1024.0 * 1024.0)
        )
    }
}

impl PointBvh {
    /// Bytes used by the node array and point order.
    pub fn node_bytes(&self) -> usize {
        self.nodes.len() * std::mem::size_of::<LinearBvhNode>()
            + self.order.len() * std::mem::size_of::<u32>()
    }

    pub fn arena_bytes(&self) -> usize {
        self.arena_bytes
    }

    pub fn statistics(&self) -> BvhStatistics {
        let mut leaf_depth = SampleSummary::default();
        if !self.nodes.is_empty() {
            let mut stack = vec![(NodeIdx::new(0), 1)];
            while let Some((index, depth)) = stack.pop() {
                match self.nodes[index].kind {
                    LinearNodeKind::Leaf { .. } => leaf_depth.add_sample(depth),
                    LinearNodeKind::Interior { second_child, .. } => {
                        stack.push((second_child, depth + 1));
                        stack.push((index + 1, depth + 1));
                    }
                }
            }
        }

        let leaf_size: SampleSummary = self
            .leaves()
            .filter_map(|(_, leaf)| match leaf.kind {
                LinearNodeKind::Leaf { count, .. } => Some(count as usize),
                LinearNodeKind::Interior { .. } => None,
            })
            .collect();

        BvhStatistics {
            node_count: self.node_count(),
            leaf_count: leaf_size.count,
            point_count: self.order.len(),
            leaf_depth,
            leaf_size,
            node_bytes: self.node_bytes(),
            arena_bytes: self.arena_bytes,
        }
    }

    /// Writes one line per node, indented by depth.
    pub fn write_tree<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        if self.nodes.is_empty() {
            return writeln!(out, "<EMPTY>");
        }
        self.write_recursive(out, 0, NodeIdx::new(0))
    }

    fn write_recursive<W: io::Write>(
        &self,
        out: &mut W,
        indent: usize,
        index: NodeIdx,
    ) -> io::Result<()> {
        let node = &self.nodes[index];
        let indent_str = "  ".repeat(indent);
        let min = PointFmt(&node.bounds.min);
        let max = PointFmt(&node.bounds.max);

        match node.kind {
            LinearNodeKind::Leaf {
                primitives_offset,
                count,
            } => writeln!(
                out,
                "{indent_str}- L{}: {min}-{max} points {}..{}",
                index.index(),
                primitives_offset,
                primitives_offset + count
            ),
            LinearNodeKind::Interior { second_child, axis } => {
                writeln!(
                    out,
                    "{indent_str}- I{} ({axis:?}): {min}-{max}",
                    index.index()
                )?;
                self.write_recursive(out, indent + 1, index + 1)?;
                self.write_recursive(out, indent + 1, second_child)
            }
        }
    }
}

struct PointFmt<'a>(&'a WorldPoint);

impl Display for PointFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.0.x, self.0.y, self.0.z)
    }
}
