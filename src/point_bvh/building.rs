use bytemuck::{Pod, Zeroable};

use super::{BvhError, BvhSettings, PointBvh, SplitMethod, flattening::flatten};
use crate::geometry::{Axis, FloatType, WorldBox, WorldPoint};
use crate::memory_arena::{ArenaSpan, MemoryArena, TypedSpan};

/// Number of equal width buckets the SAH split evaluates.
const SAH_BUCKET_COUNT: usize = 12;

const LEAF_TAG: u32 = 0;
const INTERIOR_TAG: u32 = 1;

/// Node of the tree while it is being built, lives in the build arena.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(super) struct BuildNode {
    bounds_min: [FloatType; 3],
    bounds_max: [FloatType; 3],
    children: [ArenaSpan; 2],
    tag: u32,
    split_axis: u32,
    first_prim_offset: u32,
    n_primitives: u32,
}

#[derive(Debug)]
pub(super) enum BuildNodeKind {
    Leaf {
        first: u32,
        count: u32,
    },
    Interior {
        axis: Axis,
        children: [TypedSpan<BuildNode>; 2],
    },
}

impl BuildNode {
    fn leaf(first: u32, count: u32, bounds: &WorldBox) -> BuildNode {
        BuildNode {
            bounds_min: bounds.min.into(),
            bounds_max: bounds.max.into(),
            children: [ArenaSpan::zeroed(); 2],
            tag: LEAF_TAG,
            split_axis: 0,
            first_prim_offset: first,
            n_primitives: count,
        }
    }

    fn interior(axis: Axis, children: [TypedSpan<BuildNode>; 2], bounds: &WorldBox) -> BuildNode {
        BuildNode {
            bounds_min: bounds.min.into(),
            bounds_max: bounds.max.into(),
            children: children.map(|child| child.span()),
            tag: INTERIOR_TAG,
            split_axis: axis.index() as u32,
            first_prim_offset: 0,
            n_primitives: 0,
        }
    }

    pub(super) fn bounds(&self) -> WorldBox {
        WorldBox::new(self.bounds_min.into(), self.bounds_max.into())
    }

    pub(super) fn decode(&self) -> BuildNodeKind {
        match self.tag {
            LEAF_TAG => BuildNodeKind::Leaf {
                first: self.first_prim_offset,
                count: self.n_primitives,
            },
            _ => BuildNodeKind::Interior {
                axis: Axis::ALL[self.split_axis as usize],
                children: self.children.map(TypedSpan::from_value_span),
            },
        }
    }
}

impl PointBvh {
    /// Builds the hierarchy using a fresh arena of `settings.arena_block_size_mib`.
    pub fn build(points: &[WorldPoint], settings: &BvhSettings) -> Result<PointBvh, BvhError> {
        settings.validate()?;
        let mut arena = MemoryArena::with_block_size_mib(settings.arena_block_size_mib);
        Self::build_in(points, settings, &mut arena)
    }

    /// Builds the hierarchy with build nodes allocated from `arena`.
    /// The arena is reset before returning, its blocks can be reused by the next build.
    #[tracing::instrument(skip_all, fields(point_count = points.len(), split_method = ?settings.split_method))]
    pub fn build_in(
        points: &[WorldPoint],
        settings: &BvhSettings,
        arena: &mut MemoryArena,
    ) -> Result<PointBvh, BvhError> {
        settings.validate()?;
        let point_count = u32::try_from(points.len()).map_err(|_| BvhError::TooManyPoints {
            count: points.len(),
            max: u32::MAX as usize,
        })?;

        if points.is_empty() {
            tracing::debug!("empty point cloud, BVH has no nodes");
            return Ok(PointBvh::default());
        }

        let mut builder = Builder {
            points,
            settings,
            arena,
            indices: (0..point_count).collect(),
            order: Vec::with_capacity(points.len()),
            total_nodes: 0,
        };

        let root = builder.build_recursive(0, points.len());
        let Builder {
            arena,
            order,
            total_nodes,
            ..
        } = builder;

        let nodes = root.map(|root| flatten(arena, root, total_nodes));
        let arena_bytes = arena.total_allocated();
        arena.reset();

        let bvh = PointBvh {
            nodes: nodes?,
            order,
            arena_bytes,
        };

        tracing::info!(
            "BVH created with {} nodes for {} points ({:.2} MB), arena allocated {:.2} MB",
            bvh.node_count(),
            points.len(),
            bvh.node_bytes() as f32 / (1024.0 * 1024.0),
            arena_bytes as f32 / (1024.0 * 1024.0),
        );

        Ok(bvh)
    }
}

struct Builder<'a> {
    points: &'a [WorldPoint],
    settings: &'a BvhSettings,
    arena: &'a mut MemoryArena,
    /// Point indices, reordered in place as nodes get split.
    indices: Vec<u32>,
    /// Point indices in the order leaves were created.
    order: Vec<u32>,
    total_nodes: usize,
}

#[derive(Copy, Clone, Debug, Default)]
struct Bucket {
    count: usize,
    bounds: WorldBox,
}

impl Builder<'_> {
    /// Builds the subtree over `indices[start..end]`, which must not be empty.
    fn build_recursive(
        &mut self,
        start: usize,
        end: usize,
    ) -> Result<TypedSpan<BuildNode>, BvhError> {
        debug_assert!(start < end);

        // Placeholder, overwritten once the children are known
        let node = self.arena.alloc_value(BuildNode::zeroed())?;
        self.total_nodes += 1;

        let bounds = self.range_bounds(start, end);
        let small = bounds
            .diagonal()
            .iter()
            .all(|extent| *extent < self.settings.min_bound_length);

        if small || end - start <= 1 {
            let leaf = self.make_leaf(start, end, &bounds);
            *self.arena.value_mut(node) = leaf;
            return Ok(node);
        }

        let axis = bounds.maximum_extent();
        let mid = self.partition(start, end, &bounds, axis);

        let left = self.build_recursive(start, mid)?;
        let right = self.build_recursive(mid, end)?;

        let bounds = self
            .arena
            .value(left)
            .bounds()
            .union(&self.arena.value(right).bounds());
        *self.arena.value_mut(node) = BuildNode::interior(axis, [left, right], &bounds);

        Ok(node)
    }

    fn range_bounds(&self, start: usize, end: usize) -> WorldBox {
        self.indices[start..end]
            .iter()
            .fold(WorldBox::empty(), |b, &i| b.union_point(&self.points[i as usize]))
    }

    fn make_leaf(&mut self, start: usize, end: usize, bounds: &WorldBox) -> BuildNode {
        let first = self.order.len() as u32;
        self.order.extend_from_slice(&self.indices[start..end]);
        BuildNode::leaf(
            first,
            (end - start) as u32,
            &bounds.inflate(self.settings.voxel_length / 2.0),
        )
    }

    /// Reorders `indices[start..end]` and returns the split position.
    /// Both sides of the split are non-empty.
    fn partition(&mut self, start: usize, end: usize, bounds: &WorldBox, axis: Axis) -> usize {
        let mid = match self.settings.split_method {
            SplitMethod::Middle => self.partition_middle(start, end, bounds, axis),
            SplitMethod::Sah => self.partition_sah(start, end, bounds, axis),
            SplitMethod::EqualCounts => return self.partition_equal_counts(start, end, axis),
        };

        if mid == start || mid == end {
            tracing::debug!(
                "{:?} split of {} points is degenerate, using equal counts",
                self.settings.split_method,
                end - start
            );
            self.partition_equal_counts(start, end, axis)
        } else {
            mid
        }
    }

    fn partition_middle(&mut self, start: usize, end: usize, bounds: &WorldBox, axis: Axis) -> usize {
        let pmid = (bounds.min[axis] + bounds.max[axis]) / 2.0;
        let points = self.points;
        start
            + itertools::partition(&mut self.indices[start..end], |&i| {
                points[i as usize][axis] < pmid
            })
    }

    fn partition_equal_counts(&mut self, start: usize, end: usize, axis: Axis) -> usize {
        let mid = (start + end) / 2;
        let points = self.points;
        self.indices[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
            points[a as usize][axis].total_cmp(&points[b as usize][axis])
        });
        mid
    }

    fn partition_sah(&mut self, start: usize, end: usize, bounds: &WorldBox, axis: Axis) -> usize {
        let (lo, hi) = (bounds.min[axis], bounds.max[axis]);
        if hi <= lo {
            return start;
        }

        let bucket_of = |p: &WorldPoint| {
            let b = (SAH_BUCKET_COUNT as FloatType * (p[axis] - lo) / (hi - lo)) as usize;
            b.min(SAH_BUCKET_COUNT - 1)
        };

        let mut buckets = [Bucket::default(); SAH_BUCKET_COUNT];
        for &i in &self.indices[start..end] {
            let p = &self.points[i as usize];
            let bucket = &mut buckets[bucket_of(p)];
            bucket.count += 1;
            bucket.bounds = bucket.bounds.union_point(p);
        }

        let best = cheapest_sah_split(&buckets, bounds);

        let points = self.points;
        start
            + itertools::partition(&mut self.indices[start..end], |&i| {
                bucket_of(&points[i as usize]) <= best
            })
    }
}

/// Index of the last bucket below the cheapest split. The first of equally cheap splits wins.
fn cheapest_sah_split(buckets: &[Bucket; SAH_BUCKET_COUNT], bounds: &WorldBox) -> usize {
    let total_area = bounds.surface_area();
    let merge = |buckets: &[Bucket]| {
        buckets.iter().fold((0usize, WorldBox::empty()), |(count, b), bucket| {
            (count + bucket.count, b.union(&bucket.bounds))
        })
    };

    let mut best = (0, FloatType::INFINITY);
    for split in 0..SAH_BUCKET_COUNT - 1 {
        let (below, above) = buckets.split_at(split + 1);
        let (count0, bounds0) = merge(below);
        let (count1, bounds1) = merge(above);
        let cost = 1.0
            + (count0 as FloatType * area_or_zero(&bounds0)
                + count1 as FloatType * area_or_zero(&bounds1))
                / total_area;
        if cost < best.1 {
            best = (split, cost);
        }
    }
    best.0
}

fn area_or_zero(b: &WorldBox) -> FloatType {
    if b.is_empty() { 0.0 } else { b.surface_area() }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory_arena::ArenaError;
    use crate::point_bvh::{
        LinearNodeKind, NodeIdx,
        test::{point_cloud, split_method, test_settings},
    };

    use assert2::{assert, let_assert};
    use test_case::test_case;
    use test_strategy::proptest;

    fn four_points() -> Vec<WorldPoint> {
        vec![
            WorldPoint::new(0.0, 0.0, 0.0),
            WorldPoint::new(10.0, 0.0, 0.0),
            WorldPoint::new(0.0, 10.0, 0.0),
            WorldPoint::new(10.0, 10.0, 0.0),
        ]
    }

    #[proptest]
    fn every_point_in_exactly_one_leaf(
        #[strategy(point_cloud())] points: Vec<WorldPoint>,
        #[strategy(split_method())] method: SplitMethod,
    ) {
        let bvh = PointBvh::build(&points, &test_settings(method)).unwrap();

        let mut seen = vec![0u32; points.len()];
        for (_, leaf) in bvh.leaves() {
            let_assert!(LinearNodeKind::Leaf { primitives_offset, count } = leaf.kind);
            assert!(count >= 1);
            for &i in &bvh.order()[primitives_offset as usize..][..count as usize] {
                seen[i as usize] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
        assert!(bvh.order().len() == points.len());
    }

    #[proptest]
    fn leaf_bounds_contain_their_points(
        #[strategy(point_cloud())] points: Vec<WorldPoint>,
        #[strategy(split_method())] method: SplitMethod,
    ) {
        let settings = test_settings(method);
        let bvh = PointBvh::build(&points, &settings).unwrap();

        for (index, leaf) in bvh.leaves() {
            let_assert!(LinearNodeKind::Leaf { primitives_offset, count } = leaf.kind);
            let exact = WorldBox::from_points(
                bvh.order()[primitives_offset as usize..][..count as usize]
                    .iter()
                    .map(|&i| &points[i as usize]),
            )
            .unwrap();
            assert!(
                leaf.bounds == exact.inflate(settings.voxel_length / 2.0),
                "leaf {index:?}"
            );
        }
    }

    #[proptest]
    fn interior_bounds_are_union_of_children(
        #[strategy(point_cloud())] points: Vec<WorldPoint>,
        #[strategy(split_method())] method: SplitMethod,
    ) {
        let bvh = PointBvh::build(&points, &test_settings(method)).unwrap();
        let nodes = bvh.nodes();

        for (index, node) in nodes.iter_enumerated() {
            if let LinearNodeKind::Interior { second_child, .. } = node.kind {
                let union = nodes[index + 1].bounds.union(&nodes[second_child].bounds);
                assert!(node.bounds == union, "node {index:?}");
            }
        }
    }

    #[test]
    fn empty_cloud_gives_empty_tree() {
        let bvh = PointBvh::build(&[], &test_settings(SplitMethod::Sah)).unwrap();
        assert!(bvh.is_empty());
        assert!(bvh.order().is_empty());
    }

    #[test]
    fn single_point_is_single_leaf() {
        let points = [WorldPoint::new(1.0, 2.0, 3.0)];
        let bvh = PointBvh::build(&points, &test_settings(SplitMethod::Middle)).unwrap();

        assert!(bvh.node_count() == 1);
        let node = &bvh.nodes()[0];
        assert!(node.kind == LinearNodeKind::Leaf { primitives_offset: 0, count: 1 });
        assert!(node.bounds.min == WorldPoint::new(0.75, 1.75, 2.75));
        assert!(node.bounds.max == WorldPoint::new(1.25, 2.25, 3.25));
    }

    #[test_case(SplitMethod::Middle)]
    #[test_case(SplitMethod::EqualCounts)]
    #[test_case(SplitMethod::Sah)]
    fn four_point_square(method: SplitMethod) {
        let points = four_points();
        let bvh = PointBvh::build(&points, &test_settings(method)).unwrap();

        // Root splits along x (tie with y), both halves split along y into single point leaves
        assert!(bvh.node_count() == 7);
        assert!(bvh.leaves().count() == 4);

        let root = &bvh.nodes()[0];
        let_assert!(LinearNodeKind::Interior { second_child, axis } = root.kind);
        assert!(axis == Axis::X);
        assert!(second_child == NodeIdx::new(4));
        assert!(root.bounds.min == WorldPoint::new(-0.25, -0.25, -0.25));
        assert!(root.bounds.max == WorldPoint::new(10.25, 10.25, 0.25));

        let left = &bvh.nodes()[1];
        let_assert!(LinearNodeKind::Interior { axis: left_axis, .. } = left.kind);
        assert!(left_axis == Axis::Y);
        assert!(left.bounds.max.x == 0.25);

        let mut left_points = bvh.points_in_node(1.into()).unwrap().to_vec();
        left_points.sort();
        assert!(left_points == vec![0, 2]);
    }

    #[test]
    fn two_pairs_split_at_midpoint() {
        let points = [
            WorldPoint::new(0.0, 0.0, 0.0),
            WorldPoint::new(1.0, 0.0, 0.0),
            WorldPoint::new(10.0, 0.0, 0.0),
            WorldPoint::new(11.0, 0.0, 0.0),
        ];
        let settings = BvhSettings::builder()
            .min_bound_length(0.5)
            .arena_block_size_mib(1)
            .build();
        let bvh = PointBvh::build(&points, &settings).unwrap();

        let_assert!(LinearNodeKind::Interior { second_child, axis } = bvh.nodes()[0].kind);
        assert!(axis == Axis::X);
        assert!(second_child == NodeIdx::new(4));

        let mut left = bvh.points_in_node(1.into()).unwrap().to_vec();
        let mut right = bvh.points_in_node(second_child).unwrap().to_vec();
        left.sort();
        right.sort();
        assert!(left == vec![0, 1]);
        assert!(right == vec![2, 3]);
        assert!(bvh.nodes()[1].bounds.max.x < 5.5);
        assert!(bvh.nodes()[second_child].bounds.min.x > 5.5);
    }

    #[test]
    fn points_within_minimum_bound_share_a_leaf() {
        let points = [
            WorldPoint::new(0.0, 0.0, 0.0),
            WorldPoint::new(0.3, 0.2, 0.1),
            WorldPoint::new(0.5, 0.5, 0.5),
        ];
        let bvh = PointBvh::build(&points, &test_settings(SplitMethod::Sah)).unwrap();
        assert!(bvh.node_count() == 1);
        assert!(bvh.nodes()[0].kind == LinearNodeKind::Leaf { primitives_offset: 0, count: 3 });
    }

    #[test_case(SplitMethod::Middle)]
    #[test_case(SplitMethod::Sah)]
    #[test_case(SplitMethod::EqualCounts)]
    fn coincident_points_terminate(method: SplitMethod) {
        let settings = BvhSettings::builder()
            .split_method(method)
            .min_bound_length(0.0)
            .arena_block_size_mib(1)
            .build();
        let points = vec![WorldPoint::new(5.0, 5.0, 5.0); 9];
        let bvh = PointBvh::build(&points, &settings).unwrap();

        // Zero sized boxes can never be smaller than zero, splitting continues down to
        // single point leaves through the equal counts fallback.
        assert!(bvh.leaves().count() == 9);
        assert!(bvh.node_count() == 17);
    }

    #[test]
    fn middle_split_isolates_outlier() {
        // Every point except the last one is left of the midpoint along x
        let mut points: Vec<_> = (0..8).map(|i| WorldPoint::new(i as f32 * 0.1, 0.0, 0.0)).collect();
        points.push(WorldPoint::new(100.0, 0.0, 0.0));

        let bvh = PointBvh::build(&points, &test_settings(SplitMethod::Middle)).unwrap();
        let root = &bvh.nodes()[0];
        let_assert!(LinearNodeKind::Interior { second_child, .. } = root.kind);
        assert!(bvh.points_in_node(1.into()).unwrap().len() == 8);
        assert!(bvh.points_in_node(second_child).unwrap() == &[8]);
    }

    #[test]
    fn sah_separates_clusters() {
        // Two tight clusters, uneven in size, the cheapest split is between them
        let mut points: Vec<_> = (0..30)
            .map(|i| WorldPoint::new((i % 3) as f32 * 0.2, (i / 3) as f32 * 0.05, 0.0))
            .collect();
        points.extend((0..5).map(|i| WorldPoint::new(50.0 + i as f32 * 0.1, 0.0, 0.0)));

        let bvh = PointBvh::build(&points, &test_settings(SplitMethod::Sah)).unwrap();
        let root = &bvh.nodes()[0];
        let_assert!(LinearNodeKind::Interior { second_child, axis } = root.kind);
        assert!(axis == Axis::X);

        let mut right = bvh.points_in_node(second_child).unwrap().to_vec();
        right.sort();
        assert!(right == (30..35).collect::<Vec<u32>>());
    }

    #[test]
    fn equal_counts_halves() {
        let points: Vec<_> = (0..10)
            .rev()
            .map(|i| WorldPoint::new(i as f32 * 3.0, 0.0, 0.0))
            .collect();
        let bvh = PointBvh::build(&points, &test_settings(SplitMethod::EqualCounts)).unwrap();
        let_assert!(LinearNodeKind::Interior { second_child, .. } = bvh.nodes()[0].kind);

        let mut left = bvh.points_in_node(1.into()).unwrap().to_vec();
        left.sort();
        // Points are stored in descending x, so the lower half has the high indices
        assert!(left == vec![5, 6, 7, 8, 9]);
        assert!(bvh.points_in_node(second_child).unwrap().len() == 5);
    }

    #[test]
    fn cheapest_split_prefers_first_minimum() {
        let mut buckets = [Bucket::default(); SAH_BUCKET_COUNT];
        let bounds = WorldBox::new(WorldPoint::new(0.0, 0.0, 0.0), WorldPoint::new(12.0, 1.0, 1.0));
        for i in [0, 11] {
            buckets[i] = Bucket {
                count: 1,
                bounds: WorldBox::from_point(WorldPoint::new(i as f32, 0.5, 0.5)),
            };
        }
        // All splits between the two occupied buckets cost the same
        assert!(cheapest_sah_split(&buckets, &bounds) == 0);
    }

    #[test]
    fn arena_is_reset_and_reused() {
        let points = four_points();
        let settings = test_settings(SplitMethod::Middle);
        let mut arena = MemoryArena::new(4096);

        let first = PointBvh::build_in(&points, &settings, &mut arena).unwrap();
        let allocated = arena.total_allocated();
        let second = PointBvh::build_in(&points, &settings, &mut arena).unwrap();

        assert!(arena.total_allocated() == allocated);
        assert!(first.nodes().as_raw_slice() == second.nodes().as_raw_slice());
        assert!(first.order() == second.order());
    }

    #[test_case(SplitMethod::Sah)]
    #[test_case(SplitMethod::Middle)]
    #[test_case(SplitMethod::EqualCounts)]
    fn arena_exhaustion_fails_build(method: SplitMethod) {
        let points: Vec<_> = (0..200)
            .map(|i| WorldPoint::new(i as f32 * 3.0, 0.0, 0.0))
            .collect();
        let settings = test_settings(method);
        let mut arena = MemoryArena::new(256);
        arena.set_limit(Some(1024));

        let_assert!(
            Err(BvhError::Arena(ArenaError::OutOfMemory { .. })) =
                PointBvh::build_in(&points, &settings, &mut arena)
        );
        assert!(arena.total_allocated() <= 1024);

        // The arena was reset, so a smaller build fits in the recycled blocks
        let allocated = arena.total_allocated();
        let bvh = PointBvh::build_in(&points[..2], &settings, &mut arena).unwrap();
        assert!(bvh.node_count() == 3);
        assert!(bvh.order().len() == 2);
        assert!(arena.total_allocated() == allocated);
    }

    #[test]
    fn build_node_round_trip() {
        let bounds = WorldBox::new(WorldPoint::new(-1.0, 0.0, 1.0), WorldPoint::new(2.0, 3.0, 4.0));
        let leaf = BuildNode::leaf(7, 3, &bounds);
        assert!(leaf.bounds() == bounds);
        let_assert!(BuildNodeKind::Leaf { first: 7, count: 3 } = leaf.decode());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = BvhSettings::builder().voxel_length(f32::INFINITY).build();
        let_assert!(Err(BvhError::InvalidSettings(_)) = PointBvh::build(&four_points(), &settings));
    }
}
