use bytemuck::{Pod, Zeroable};

use super::{BvhError, LinearBvhNode, LinearNodeKind, NodeIdx, PointBvh};
use crate::geometry::{Axis, WorldBox};

/// Fixed size node record for upload to a GPU buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct GpuBvhNode {
    pub bounds_min: [f32; 3],
    pub bounds_max: [f32; 3],
    /// First index into the order array for leaves, index of the second child for interior
    /// nodes.
    pub offset: u32,
    /// Zero for interior nodes.
    pub primitive_count: u16,
    pub axis: u8,
    pub pad: u8,
}

const _: () = assert!(std::mem::size_of::<GpuBvhNode>() == 32);

impl GpuBvhNode {
    pub fn bounds(&self) -> WorldBox {
        WorldBox::new(self.bounds_min.into(), self.bounds_max.into())
    }

    pub fn decode(&self) -> LinearBvhNode {
        let kind = if self.primitive_count > 0 {
            LinearNodeKind::Leaf {
                primitives_offset: self.offset,
                count: self.primitive_count.into(),
            }
        } else {
            LinearNodeKind::Interior {
                second_child: NodeIdx::new(self.offset as usize),
                axis: Axis::ALL[usize::from(self.axis) % 3],
            }
        };
        LinearBvhNode {
            bounds: self.bounds(),
            kind,
        }
    }
}

impl PointBvh {
    /// Nodes converted to [`GpuBvhNode`], fails if a leaf holds more points than fit the
    /// 16 bit count.
    pub fn gpu_nodes(&self) -> Result<Vec<GpuBvhNode>, BvhError> {
        self.nodes
            .iter_enumerated()
            .map(|(index, node)| {
                let (offset, primitive_count, axis) = match node.kind {
                    LinearNodeKind::Leaf {
                        primitives_offset,
                        count,
                    } => {
                        let count = u16::try_from(count).map_err(|_| BvhError::LeafTooLarge {
                            node: index,
                            count,
                            max: u16::MAX.into(),
                        })?;
                        (primitives_offset, count, 0)
                    }
                    LinearNodeKind::Interior { second_child, axis } => {
                        (second_child.raw(), 0, u8::from(axis))
                    }
                };
                Ok(GpuBvhNode {
                    bounds_min: node.bounds.min.into(),
                    bounds_max: node.bounds.max.into(),
                    offset,
                    primitive_count,
                    axis,
                    pad: 0,
                })
            })
            .collect()
    }

    /// [`Self::gpu_nodes`] as raw bytes, native endianness.
    pub fn gpu_bytes(&self) -> Result<Vec<u8>, BvhError> {
        let nodes = self.gpu_nodes()?;
        Ok(bytemuck::cast_slice(&nodes).to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::WorldPoint;
    use crate::point_bvh::{
        BvhSettings, SplitMethod,
        test::{point_cloud, split_method, test_settings},
    };

    use assert2::{assert, let_assert};
    use test_strategy::proptest;

    #[test]
    fn node_is_32_bytes() {
        assert!(std::mem::size_of::<GpuBvhNode>() == 32);
        assert!(std::mem::align_of::<GpuBvhNode>() == 4);
    }

    #[proptest]
    fn decodes_to_linear_node(
        #[strategy(point_cloud())] points: Vec<WorldPoint>,
        #[strategy(split_method())] method: SplitMethod,
    ) {
        let bvh = PointBvh::build(&points, &test_settings(method)).unwrap();
        let gpu_nodes = bvh.gpu_nodes().unwrap();
        assert!(gpu_nodes.len() == bvh.node_count());
        for (gpu_node, node) in gpu_nodes.iter().zip(bvh.nodes().iter()) {
            assert!(&gpu_node.decode() == node);
        }
    }

    #[test]
    fn byte_layout() {
        let points = [WorldPoint::new(0.0, 0.0, 0.0), WorldPoint::new(10.0, 0.0, 0.0)];
        let bvh = PointBvh::build(&points, &test_settings(SplitMethod::Middle)).unwrap();
        let bytes = bvh.gpu_bytes().unwrap();
        assert!(bytes.len() == 3 * 32);

        let root: GpuBvhNode = bytemuck::pod_read_unaligned(&bytes[..32]);
        assert!(root.bounds_min == [-0.25, -0.25, -0.25]);
        assert!(root.offset == 2);
        assert!(root.primitive_count == 0);
        assert!(root.axis == 0);

        let leaf: GpuBvhNode = bytemuck::pod_read_unaligned(&bytes[64..]);
        assert!(leaf.offset == 1);
        assert!(leaf.primitive_count == 1);
    }

    #[test]
    fn oversized_leaf_is_rejected() {
        // Huge minimum bound keeps everything in the root leaf
        let settings = BvhSettings::builder()
            .min_bound_length(1e6)
            .arena_block_size_mib(1)
            .build();
        let points = vec![WorldPoint::new(1.0, 2.0, 3.0); 70_000];
        let bvh = PointBvh::build(&points, &settings).unwrap();
        assert!(bvh.node_count() == 1);

        let_assert!(Err(BvhError::LeafTooLarge { node, count, max }) = bvh.gpu_nodes());
        assert!(node == NodeIdx::new(0));
        assert!(count == 70_000);
        assert!(max == 65_535);
    }
}
