use rayon::prelude::*;

use super::{WorldBox, WorldPoint};

/// Primitive that can report an axis aligned box around itself.
pub trait Bounded {
    fn bounds(&self) -> WorldBox;
}

impl Bounded for WorldPoint {
    fn bounds(&self) -> WorldBox {
        WorldBox::from_point(*self)
    }
}

/// Triangle given by its three vertices.
impl Bounded for [WorldPoint; 3] {
    fn bounds(&self) -> WorldBox {
        WorldBox::from_point(self[0])
            .union_point(&self[1])
            .union_point(&self[2])
    }
}

/// Computes bounding boxes of all primitives in parallel, output is in input order.
#[tracing::instrument(skip_all, fields(primitive_count = primitives.len()))]
pub fn compute_primitive_bounds<P: Bounded + Sync>(primitives: &[P]) -> Vec<WorldBox> {
    primitives.par_iter().map(Bounded::bounds).collect()
}
