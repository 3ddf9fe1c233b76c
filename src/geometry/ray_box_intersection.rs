use crate::geometry::{FloatType, Ray, WorldBox, robust_slab_scale};

pub trait RayIntersectionExt {
    type DistanceType;

    /// Calculate first and last ray intersection with the box, with the far distance on each
    /// axis multiplied by `scale`.
    /// Returns `None` if the parameter intervals of the slabs don't overlap.
    fn intersect_scaled(
        &self,
        ray: &Ray,
        scale: Self::DistanceType,
    ) -> Option<(Self::DistanceType, Self::DistanceType)>;

    /// Calculate first and last ray intersection with the box, conservatively rounded so that
    /// a true hit is never reported as a miss.
    fn intersect(&self, ray: &Ray) -> Option<(Self::DistanceType, Self::DistanceType)>;

    /// Far intersection distance, if the box is hit in front of the ray origin.
    fn intersect_distance(&self, ray: &Ray) -> Option<Self::DistanceType>;

    fn intersect_p(&self, ray: &Ray) -> bool {
        self.intersect_distance(ray).is_some()
    }
}

impl RayIntersectionExt for WorldBox {
    type DistanceType = FloatType;

    fn intersect_scaled(&self, ray: &Ray, scale: FloatType) -> Option<(FloatType, FloatType)> {
        let mut t_min = FloatType::NEG_INFINITY;
        let mut t_max = FloatType::INFINITY;

        for axis in 0..3 {
            let (near, far) = if ray.dir_is_neg[axis] {
                (self.max[axis], self.min[axis])
            } else {
                (self.min[axis], self.max[axis])
            };

            // The multiplication is NAN if the ray is starting inside the slab bounding plane
            // and is parallel to it. In this case we blend to +-infinity, so that the range becomes infinite
            let t_near = nan_to((near - ray.origin[axis]) * ray.inv_direction[axis], FloatType::NEG_INFINITY);
            let t_far = nan_to((far - ray.origin[axis]) * ray.inv_direction[axis], FloatType::INFINITY) * scale;

            if t_min > t_far || t_near > t_max {
                return None;
            }
            t_min = t_min.max(t_near);
            t_max = t_max.min(t_far);
        }

        Some((t_min, t_max))
    }

    fn intersect(&self, ray: &Ray) -> Option<(FloatType, FloatType)> {
        self.intersect_scaled(ray, robust_slab_scale())
    }

    fn intersect_distance(&self, ray: &Ray) -> Option<FloatType> {
        let (_t_min, t_max) = self.intersect(ray)?;
        (t_max > 0.0).then_some(t_max)
    }
}

#[inline(always)]
fn nan_to(x: FloatType, replacement: FloatType) -> FloatType {
    if x.is_nan() { replacement } else { x }
}
