mod aabb;
mod primitive_bounds;
mod ray_box_intersection;

use std::ops::{Index, IndexMut};

use nalgebra::{ClosedAddAssign, ClosedDivAssign, ClosedMulAssign, ClosedSubAssign, Scalar};
use num_traits::Float;

pub use aabb::AABB;
pub use primitive_bounds::{Bounded, compute_primitive_bounds};
pub use ray_box_intersection::RayIntersectionExt;

pub type FloatType = f32;

pub type Point3<T> = nalgebra::Point3<T>;
pub type Vector3<T> = nalgebra::Vector3<T>;
pub type Bounds3<T> = AABB<Point3<T>>;

pub type WorldPoint = Point3<FloatType>;
pub type WorldVector = Vector3<FloatType>;
pub type WorldBox = Bounds3<FloatType>;

/// Scalar types usable as box coordinates (`f32` and `f64`).
pub trait BoxScalar:
    Scalar + Float + ClosedAddAssign + ClosedSubAssign + ClosedMulAssign + ClosedDivAssign
{
}

impl<T> BoxScalar for T where
    T: Scalar + Float + ClosedAddAssign + ClosedSubAssign + ClosedMulAssign + ClosedDivAssign
{
}

/// Conservative bound on the relative rounding error of `n` consecutive floating point
/// operations.
pub fn gamma<T: Float>(n: T) -> T {
    let machine_epsilon = T::epsilon() / (T::one() + T::one());
    (n * machine_epsilon) / (T::one() - n * machine_epsilon)
}

/// Multiplier for the far slab distance that keeps ray-box tests free of false negatives.
pub fn robust_slab_scale<T: Float>() -> T {
    let two = T::one() + T::one();
    T::one() + two * gamma(two + T::one())
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Axis {
    #[default]
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl From<Axis> for u8 {
    fn from(axis: Axis) -> u8 {
        axis as u8
    }
}

impl<T: Scalar> Index<Axis> for Point3<T> {
    type Output = T;

    fn index(&self, axis: Axis) -> &T {
        &self.coords[axis.index()]
    }
}

impl<T: Scalar> IndexMut<Axis> for Point3<T> {
    fn index_mut(&mut self, axis: Axis) -> &mut T {
        &mut self.coords[axis.index()]
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Ray {
    pub origin: WorldPoint,
    /// Normalized direction of the ray
    pub direction: WorldVector,

    /// Componentwise inverse of the ray direction
    /// Zeros in direction get turned into positive infinity regardless of the sign of the zero
    pub inv_direction: WorldVector,

    /// Per axis, whether the ray travels towards negative coordinates.
    /// Selects which box face is the near one in the slab test.
    pub dir_is_neg: [bool; 3],
}

impl Ray {
    /// `direction` gets normalized and must not be zero.
    pub fn new(origin: WorldPoint, direction: WorldVector) -> Ray {
        debug_assert!(direction != WorldVector::zeros(), "ray direction must be non-zero");
        let direction = direction.normalize();
        let inv_direction = direction.map(|x| if x == 0.0 { FloatType::INFINITY } else { 1.0 / x });
        let dir_is_neg = [
            inv_direction.x < 0.0,
            inv_direction.y < 0.0,
            inv_direction.z < 0.0,
        ];

        Ray {
            origin,
            direction,
            inv_direction,
            dir_is_neg,
        }
    }

    pub fn point_at(&self, distance: FloatType) -> WorldPoint {
        self.origin + self.direction * distance
    }

    /// Distance of the point from the ray, considering only the part of the ray in front
    /// of its origin.
    pub fn distance_to_point(&self, point: &WorldPoint) -> FloatType {
        let t = (point - self.origin).dot(&self.direction).max(0.0);
        (point - self.point_at(t)).norm()
    }
}
