use crate::Vec3;

/// Reciprocal used for zero direction components.
const HUGE_RECIP: f32 = 1e30;

/// Origin and direction plus the reciprocal direction the slab tests use.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    pub inv_direction: Vec3,
}

impl Ray {
    /// Zero direction components get a finite reciprocal of `1e30` that keeps
    /// the sign of the zero.
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        let recip = |d: f32| if d.abs() > 1e-30 { d.recip() } else { HUGE_RECIP.copysign(d) };
        Self {
            origin,
            direction,
            inv_direction: Vec3::new(recip(direction.x), recip(direction.y), recip(direction.z)),
        }
    }

    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Per axis, 1 when the direction points toward negative values.
    #[inline]
    pub fn neg_dir_mask(&self) -> [usize; 3] {
        let d = self.direction;
        [d.x, d.y, d.z].map(|c| usize::from(c < 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_along_ray() {
        let ray = Ray::new(Vec3::new(1.0, 0.0, 0.0), Vec3::Y);
        assert_eq!(ray.at(0.0), Vec3::X);
        assert_eq!(ray.at(2.0), Vec3::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn test_zero_components_stay_finite() {
        let ray = Ray::new(Vec3::ZERO, Vec3::new(0.0, -0.0, 2.0));
        assert!(ray.inv_direction.x.is_finite() && ray.inv_direction.x > 0.0);
        assert!(ray.inv_direction.y < 0.0);
        assert_eq!(ray.inv_direction.z, 0.5);
        assert_eq!(ray.neg_dir_mask(), [0, 0, 0]);
        assert_eq!(Ray::new(Vec3::ZERO, Vec3::new(-1.0, 1.0, -1.0)).neg_dir_mask(), [1, 0, 1]);
    }
}
