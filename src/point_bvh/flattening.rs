use index_vec::IndexVec;

use super::building::{BuildNode, BuildNodeKind};
use super::{LinearBvhNode, LinearNodeKind, NodeIdx};
use crate::memory_arena::{MemoryArena, TypedSpan};

/// Lays the build tree out in depth first order, left subtree first.
pub(super) fn flatten(
    arena: &MemoryArena,
    root: TypedSpan<BuildNode>,
    total_nodes: usize,
) -> IndexVec<NodeIdx, LinearBvhNode> {
    let mut nodes = IndexVec::with_capacity(total_nodes);
    flatten_recursive(arena, root, &mut nodes);
    assert2::assert!(nodes.len() == total_nodes);
    nodes
}

fn flatten_recursive(
    arena: &MemoryArena,
    node: TypedSpan<BuildNode>,
    nodes: &mut IndexVec<NodeIdx, LinearBvhNode>,
) -> NodeIdx {
    let build_node = arena.value(node);
    let bounds = build_node.bounds();

    match build_node.decode() {
        BuildNodeKind::Leaf { first, count } => nodes.push(LinearBvhNode {
            bounds,
            kind: LinearNodeKind::Leaf {
                primitives_offset: first,
                count,
            },
        }),
        BuildNodeKind::Interior {
            axis,
            children: [left, right],
        } => {
            // Second child index is not known until the left subtree is laid out
            let index = nodes.push(LinearBvhNode {
                bounds,
                kind: LinearNodeKind::Interior {
                    second_child: NodeIdx::new(0),
                    axis,
                },
            });

            let first_child = flatten_recursive(arena, left, nodes);
            debug_assert!(first_child == index + 1);
            let second_child = flatten_recursive(arena, right, nodes);

            nodes[index].kind = LinearNodeKind::Interior { second_child, axis };
            index
        }
    }
}
