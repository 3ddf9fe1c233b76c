use super::{BvhError, LinearBvhNode, LinearNodeKind, NodeIdx, PointBvh};
use crate::geometry::{FloatType, Ray, RayIntersectionExt as _, WorldBox, WorldPoint};

/// Reusable node stack for ray traversal.
/// Grows on demand up to `limit` entries, going over the limit fails the traversal.
#[derive(Clone, Debug)]
pub struct TraversalStack {
    stack: Vec<NodeIdx>,
    limit: usize,
}

impl TraversalStack {
    pub const DEFAULT_LIMIT: usize = 1 << 16;

    pub fn new() -> Self {
        Self::with_limit(Self::DEFAULT_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        TraversalStack {
            stack: Vec::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn push(&mut self, index: NodeIdx) -> Result<(), BvhError> {
        if self.stack.len() >= self.limit {
            return Err(BvhError::TraversalStackOverflow { limit: self.limit });
        }
        self.stack.push(index);
        Ok(())
    }
}

impl Default for TraversalStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Event reported to the visitor of [`PointBvh::walk_ray`].
enum Visit<'a> {
    Leaf(NodeIdx, &'a LinearBvhNode),
    Children(&'a LinearBvhNode, &'a LinearBvhNode),
}

impl PointBvh {
    /// Leaves whose boxes the ray passes through, in front to back order of their far
    /// intersection distance.
    /// Stops after `max_leaves` leaves, zero means no limit.
    pub fn intersect_leaves(
        &self,
        ray: &Ray,
        max_leaves: usize,
        stack: &mut TraversalStack,
    ) -> Result<Vec<NodeIdx>, BvhError> {
        let mut leaves = Vec::new();
        self.walk_ray(ray, max_leaves, stack, |visit| {
            if let Visit::Leaf(index, _) = visit {
                leaves.push(index);
            }
        })?;
        Ok(leaves)
    }

    /// Boxes the traversal looks at: every leaf that is hit, and both child boxes of every
    /// interior node that is entered.
    pub fn intersect_bounds(
        &self,
        ray: &Ray,
        max_leaves: usize,
        stack: &mut TraversalStack,
    ) -> Result<Vec<WorldBox>, BvhError> {
        let mut boxes = Vec::new();
        self.walk_ray(ray, max_leaves, stack, |visit| match visit {
            Visit::Leaf(_, node) => boxes.push(node.bounds),
            Visit::Children(left, right) => {
                boxes.push(left.bounds);
                boxes.push(right.bounds);
            }
        })?;
        Ok(boxes)
    }

    /// Indices of points within `radius` of the ray, searched in the first `max_leaves`
    /// leaves hit. `points` should be the slice the tree was built from, indices past its
    /// end are skipped.
    pub fn search_points(
        &self,
        points: &[WorldPoint],
        ray: &Ray,
        max_leaves: usize,
        radius: FloatType,
        stack: &mut TraversalStack,
    ) -> Result<Vec<u32>, BvhError> {
        let leaves = self.intersect_leaves(ray, max_leaves, stack)?;
        let candidates = leaves
            .into_iter()
            .filter_map(|leaf| self.points_in_node(leaf))
            .flatten()
            .copied();
        Ok(points_near_ray(points, ray, candidates, radius))
    }

    /// Boxes of all nodes at `depth` below the root, plus leaves that end above it.
    /// Depth 0 gives just the root box.
    pub fn bound_tree(&self, depth: usize) -> Vec<WorldBox> {
        let mut boxes = Vec::new();
        if self.nodes.is_empty() {
            return boxes;
        }

        let mut to_visit = vec![(NodeIdx::new(0), 0usize)];
        while let Some((index, node_depth)) = to_visit.pop() {
            let node = &self.nodes[index];
            match node.kind {
                LinearNodeKind::Interior { second_child, .. } if node_depth < depth => {
                    to_visit.push((second_child, node_depth + 1));
                    to_visit.push((index + 1, node_depth + 1));
                }
                _ => boxes.push(node.bounds),
            }
        }
        boxes
    }

    /// Point indices stored below the node, `None` if there is no such node.
    pub fn points_in_node(&self, node: NodeIdx) -> Option<&[u32]> {
        if node.index() >= self.nodes.len() {
            return None;
        }
        Some(&self.order[self.order_range(node)])
    }

    fn walk_ray<'a>(
        &'a self,
        ray: &Ray,
        max_leaves: usize,
        stack: &mut TraversalStack,
        mut visit: impl FnMut(Visit<'a>),
    ) -> Result<(), BvhError> {
        stack.stack.clear();

        let Some(root) = self.nodes.get(NodeIdx::new(0)) else {
            return Ok(());
        };
        if !root.bounds.intersect_p(ray) {
            return Ok(());
        }
        stack.push(NodeIdx::new(0))?;

        let mut leaf_count = 0;
        while let Some(index) = stack.stack.pop() {
            let node = &self.nodes[index];
            match node.kind {
                LinearNodeKind::Leaf { .. } => {
                    visit(Visit::Leaf(index, node));
                    leaf_count += 1;
                    if leaf_count == max_leaves {
                        break;
                    }
                }
                LinearNodeKind::Interior { second_child, .. } => {
                    let first_child = index + 1;
                    let left = &self.nodes[first_child];
                    let right = &self.nodes[second_child];
                    visit(Visit::Children(left, right));

                    // Nearer child goes on top, the left one when both are equally far
                    match (
                        left.bounds.intersect_distance(ray),
                        right.bounds.intersect_distance(ray),
                    ) {
                        (Some(t_left), Some(t_right)) if t_right < t_left => {
                            stack.push(first_child)?;
                            stack.push(second_child)?;
                        }
                        (Some(_), Some(_)) => {
                            stack.push(second_child)?;
                            stack.push(first_child)?;
                        }
                        (Some(_), None) => stack.push(first_child)?,
                        (None, Some(_)) => stack.push(second_child)?,
                        (None, None) => {}
                    }
                }
            }
        }

        stack.stack.clear();
        Ok(())
    }
}

/// Candidates whose distance from the ray is at most `radius`, in candidate order.
/// Candidates that don't index into `points` are skipped.
pub fn points_near_ray(
    points: &[WorldPoint],
    ray: &Ray,
    candidates: impl IntoIterator<Item = u32>,
    radius: FloatType,
) -> Vec<u32> {
    candidates
        .into_iter()
        .filter(|&i| {
            points
                .get(i as usize)
                .is_some_and(|point| ray.distance_to_point(point) <= radius)
        })
        .collect()
}
