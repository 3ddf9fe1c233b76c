use std::ops::{Add, Sub};

use nalgebra::Vector3;

use super::{Axis, BoxScalar, Point3};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AABB<Point> {
    pub min: Point,
    pub max: Point,
}

impl<Point> AABB<Point> {
    pub fn new(min: Point, max: Point) -> AABB<Point> {
        AABB { min, max }
    }

    pub fn with_size<S>(min: Point, size: &S) -> AABB<Point>
    where
        for<'a> &'a Point: Add<&'a S, Output = Point>,
    {
        let max = &min + size;
        AABB { min, max }
    }

    pub fn map<Point2, F: FnMut(&Point) -> Point2>(&self, mut f: F) -> AABB<Point2> {
        AABB {
            min: f(&self.min),
            max: f(&self.max),
        }
    }
}

impl<Point: Sub + Copy> AABB<Point> {
    pub fn size(&self) -> Point::Output {
        self.max - self.min
    }
}

impl<T: BoxScalar> AABB<Point3<T>> {
    /// Box that contains nothing; union with anything yields that thing.
    pub fn empty() -> Self {
        AABB {
            min: Point3::from(Vector3::repeat(T::infinity())),
            max: Point3::from(Vector3::repeat(T::neg_infinity())),
        }
    }

    /// Degenerate box containing exactly one point.
    pub fn from_point(p: Point3<T>) -> Self {
        AABB { min: p, max: p }
    }

    /// Smallest box containing all the points, or `None` if the iterator is empty.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point3<T>>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        Some(points.fold(Self::from_point(*first), |b, p| b.union_point(p)))
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|i| self.min[i] > self.max[i])
    }

    pub fn union_point(&self, p: &Point3<T>) -> Self {
        AABB {
            min: self.min.coords.zip_map(&p.coords, T::min).into(),
            max: self.max.coords.zip_map(&p.coords, T::max).into(),
        }
    }

    pub fn union(&self, other: &Self) -> Self {
        AABB {
            min: self.min.coords.zip_map(&other.min.coords, T::min).into(),
            max: self.max.coords.zip_map(&other.max.coords, T::max).into(),
        }
    }

    /// Grows the box by `amount` on every face.
    pub fn inflate(&self, amount: T) -> Self {
        AABB {
            min: self.min.map(|x| x - amount),
            max: self.max.map(|x| x + amount),
        }
    }

    pub fn diagonal(&self) -> Vector3<T> {
        self.max - self.min
    }

    pub fn surface_area(&self) -> T {
        let d = self.diagonal();
        let two = T::one() + T::one();
        two * (d.x * d.y + d.x * d.z + d.y * d.z)
    }

    pub fn volume(&self) -> T {
        let d = self.diagonal();
        d.x * d.y * d.z
    }

    pub fn center(&self) -> Point3<T> {
        let two = T::one() + T::one();
        Point3::from((self.min.coords + self.max.coords) / two)
    }

    /// Axis with the longest extent. Ties prefer X, then Y.
    pub fn maximum_extent(&self) -> Axis {
        let d = self.diagonal();
        if d.x >= d.y && d.x >= d.z {
            Axis::X
        } else if d.y >= d.z {
            Axis::Y
        } else {
            Axis::Z
        }
    }

    /// Position of the point relative to the box, 0 at `min` and 1 at `max` on each axis.
    /// Axes where the box is flat are left as absolute offsets.
    pub fn offset(&self, p: &Point3<T>) -> Vector3<T> {
        let mut o = p - self.min;
        for i in 0..3 {
            if self.max[i] > self.min[i] {
                o[i] /= self.max[i] - self.min[i];
            }
        }
        o
    }

    /// One of the 8 corners; bit 0 of `corner` selects max x, bit 1 max y, bit 2 max z.
    pub fn corner(&self, corner: usize) -> Point3<T> {
        let pick = |bit: usize, i: usize| {
            if corner & bit != 0 {
                self.max[i]
            } else {
                self.min[i]
            }
        };
        Point3::new(pick(1, 0), pick(2, 1), pick(4, 2))
    }

    pub fn contains(&self, p: &Point3<T>) -> bool {
        (0..3).all(|i| self.min[i] <= p[i] && p[i] <= self.max[i])
    }
}

impl<T: BoxScalar> Default for AABB<Point3<T>> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<Point> From<[Point; 2]> for AABB<Point> {
    fn from(value: [Point; 2]) -> Self {
        let [min, max] = value;
        AABB { min, max }
    }
}

impl<Point> From<(Point, Point)> for AABB<Point> {
    fn from(value: (Point, Point)) -> Self {
        let (min, max) = value;
        AABB { min, max }
    }
}
