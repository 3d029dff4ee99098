use crate::{Interval, Ray, Vec3};

/// Boxes thinner than this along an axis are padded out to it.
const MIN_EXTENT: f32 = 1e-4;

/// Axis-aligned box, one [`Interval`] per axis.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Aabb {
    pub x: Interval,
    pub y: Interval,
    pub z: Interval,
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb {
        x: Interval::EMPTY,
        y: Interval::EMPTY,
        z: Interval::EMPTY,
    };

    /// Box spanned by two opposite corners, in any order.
    ///
    /// Flat boxes (a quad in a coordinate plane) get a minimum thickness so
    /// the slab test never divides a zero-width slab.
    pub fn from_points(a: Vec3, b: Vec3) -> Self {
        let axis = |i: usize| Interval::EMPTY.grow(a[i]).grow(b[i]).pad_to(MIN_EXTENT);
        Self {
            x: axis(0),
            y: axis(1),
            z: axis(2),
        }
    }

    /// Tight bounds of a point cloud, [`Aabb::EMPTY`] for an empty slice.
    pub fn from_point_cloud(points: &[Vec3]) -> Self {
        points.iter().fold(Self::EMPTY, |acc, &p| acc.include(p))
    }

    pub fn surrounding(a: &Aabb, b: &Aabb) -> Self {
        Self {
            x: a.x.union(b.x),
            y: a.y.union(b.y),
            z: a.z.union(b.z),
        }
    }

    pub fn include(&self, p: Vec3) -> Self {
        Self {
            x: self.x.grow(p.x),
            y: self.y.grow(p.y),
            z: self.z.grow(p.z),
        }
    }

    #[inline]
    fn axes(&self) -> [Interval; 3] {
        [self.x, self.y, self.z]
    }

    #[inline]
    pub fn min(&self) -> Vec3 {
        Vec3::new(self.x.min, self.y.min, self.z.min)
    }

    #[inline]
    pub fn max(&self) -> Vec3 {
        Vec3::new(self.x.max, self.y.max, self.z.max)
    }

    pub fn is_empty(&self) -> bool {
        self.axes().iter().any(Interval::is_empty)
    }

    pub fn centroid(&self) -> Vec3 {
        (self.min() + self.max()) * 0.5
    }

    /// Axis of the largest extent, ties resolved toward Z.
    pub fn longest_axis(&self) -> usize {
        let d = self.max() - self.min();
        if d.x > d.y && d.x > d.z {
            0
        } else if d.y > d.z {
            1
        } else {
            2
        }
    }

    /// Surface area, zero for empty boxes.
    pub fn surface_area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let d = self.max() - self.min();
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// Slab test against the parameter range `t`.
    ///
    /// Returns the entry distance clamped to `t.min`, so a ray that starts
    /// inside the box reports `t.min`.
    pub fn hit(&self, ray: &Ray, t: Interval) -> Option<f32> {
        self.axes()
            .iter()
            .enumerate()
            .try_fold(t, |t, (i, slab)| {
                let inv = ray.inv_direction[i];
                let t0 = (slab.min - ray.origin[i]) * inv;
                let t1 = (slab.max - ray.origin[i]) * inv;
                t.overlap(Interval::new(t0.min(t1), t0.max(t1)))
            })
            .map(|t| t.min)
    }
}
