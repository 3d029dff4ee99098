use crate::Aabb;
use glam::{Mat4, Vec3};

/// Instance transform helpers on top of glam's `Mat4`.
pub trait Mat4Ext {
    /// Linear part only, translation is ignored.
    fn transform_vector3(&self, v: Vec3) -> Vec3;

    /// Map an object-space normal to world space. `self` must be the
    /// world-to-object matrix of the instance.
    fn transform_normal_by_inverse(&self, n: Vec3) -> Vec3;

    /// World bounds of a transformed box, from its eight corners.
    fn transform_aabb(&self, aabb: &Aabb) -> Aabb;
}

impl Mat4Ext for Mat4 {
    #[inline]
    fn transform_vector3(&self, v: Vec3) -> Vec3 {
        self.x_axis.truncate() * v.x + self.y_axis.truncate() * v.y + self.z_axis.truncate() * v.z
    }

    #[inline]
    fn transform_normal_by_inverse(&self, n: Vec3) -> Vec3 {
        self.transpose().transform_vector3(n)
    }

    fn transform_aabb(&self, aabb: &Aabb) -> Aabb {
        if aabb.is_empty() {
            return *aabb;
        }
        let corners = [aabb.min(), aabb.max()];
        (0..8usize).fold(Aabb::EMPTY, |acc, i| {
            let c = Vec3::new(corners[i & 1].x, corners[(i >> 1) & 1].y, corners[(i >> 2) & 1].z);
            acc.include(self.transform_point3(c))
        })
    }
}
