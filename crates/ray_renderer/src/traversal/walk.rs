//! Stack-based BVH walks over the binary and 8-wide node layouts.
//!
//! Both walks visit the top level first; leaves there are mesh instances
//! whose bottom-level tree is walked with the ray moved into object space.
//! The triangle callback owns the current `t_max`, so pruning always uses
//! the closest accepted hit.

use ray_core::{BvhNode, SceneSnapshot, WideBvhNode, INVALID_INDEX};
use ray_math::{Interval, Mat4Ext, Ray, Vec3};

use super::triangle::{intersect_tri, TriHit};

pub const MAX_STACK_SIZE: usize = 64;

/// Entry distance into the box `[min, max]`, if it overlaps `[0, t_max]`.
///
/// A box entered exactly at `t_max` is kept.
#[inline]
fn slab(ray: &Ray, min: [f32; 3], max: [f32; 3], t_max: f32) -> Option<f32> {
    let mut t = Interval::new(0.0, t_max);
    for axis in 0..3 {
        let inv = ray.inv_direction[axis];
        let mut t0 = (min[axis] - ray.origin[axis]) * inv;
        let mut t1 = (max[axis] - ray.origin[axis]) * inv;
        if inv < 0.0 {
            std::mem::swap(&mut t0, &mut t1);
        }
        t.min = t.min.max(t0);
        t.max = t.max.min(t1);
        if t.max < t.min {
            return None;
        }
    }
    Some(t.min)
}

/// Visit the leaves of a binary tree front to back. `leaf` returns `true` to stop.
pub fn walk_binary(
    nodes: &[BvhNode],
    root: u32,
    ray: &Ray,
    t_max: &mut f32,
    mut leaf: impl FnMut(u32, u32, &mut f32) -> bool,
) -> bool {
    if root == INVALID_INDEX {
        return false;
    }
    let neg = ray.neg_dir_mask();
    let mut stack = [0u32; MAX_STACK_SIZE];
    stack[0] = root;
    let mut sp = 1;

    while sp > 0 {
        sp -= 1;
        let node = &nodes[stack[sp] as usize];
        if slab(ray, node.bbox_min, node.bbox_max, *t_max).is_none() {
            continue;
        }
        if node.is_leaf() {
            if leaf(node.first_prim(), node.prim_count, t_max) {
                return true;
            }
            continue;
        }
        let (near, far) = if neg[node.split_axis()] == 1 {
            (node.right_child(), node.left_child())
        } else {
            (node.left_child(), node.right_child())
        };
        debug_assert!(sp + 2 <= MAX_STACK_SIZE, "traversal stack overflow");
        if sp + 2 > MAX_STACK_SIZE {
            continue;
        }
        stack[sp] = far;
        stack[sp + 1] = near;
        sp += 2;
    }
    false
}

/// Visit the leaves of an 8-wide tree, nearest children first.
pub fn walk_wide(
    nodes: &[WideBvhNode],
    root: u32,
    ray: &Ray,
    t_max: &mut f32,
    mut leaf: impl FnMut(u32, u32, &mut f32) -> bool,
) -> bool {
    if root == INVALID_INDEX {
        return false;
    }
    let mut stack = [0u32; MAX_STACK_SIZE];
    stack[0] = root;
    let mut sp = 1;

    while sp > 0 {
        sp -= 1;
        let node = &nodes[stack[sp] as usize];
        if node.is_leaf() {
            if leaf(node.first_prim(), node.prim_count(), t_max) {
                return true;
            }
            continue;
        }

        let mut hits = [(0.0f32, 0u32); 8];
        let mut count = 0;
        for i in 0..8 {
            let child = node.child[i];
            if child == INVALID_INDEX {
                continue;
            }
            let min = [node.bbox_min[0][i], node.bbox_min[1][i], node.bbox_min[2][i]];
            let max = [node.bbox_max[0][i], node.bbox_max[1][i], node.bbox_max[2][i]];
            if let Some(entry) = slab(ray, min, max, *t_max) {
                hits[count] = (entry, child);
                count += 1;
            }
        }
        // Farthest first so the nearest child is popped next
        hits[..count].sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));

        debug_assert!(sp + count <= MAX_STACK_SIZE, "traversal stack overflow");
        for &(_, child) in &hits[..count] {
            if sp < MAX_STACK_SIZE {
                stack[sp] = child;
                sp += 1;
            }
        }
    }
    false
}

/// Walk the whole scene, calling `on_hit(instance, triangle, hit)` for every
/// triangle intersection within the current `t_max`.
pub fn walk_scene(
    sc: &SceneSnapshot,
    wide: bool,
    o: Vec3,
    d: Vec3,
    t_max: &mut f32,
    mut on_hit: impl FnMut(u32, u32, TriHit, &mut f32) -> bool,
) -> bool {
    if sc.is_empty() {
        return false;
    }
    let world_ray = Ray::new(o, d);

    let mut instance_leaf = |first: u32, count: u32, t_max: &mut f32| -> bool {
        for k in first..first + count {
            let mi_index = sc.mi_indices[k as usize];
            let mi = &sc.mesh_instances[mi_index as usize];
            if mi.bounds.hit(&world_ray, Interval::new(0.0, *t_max)).is_none() {
                continue;
            }
            let mesh = &sc.meshes[mi.mesh_index as usize];
            let inv = &sc.transforms[mi.tr_index as usize].inv_xform;
            let local = Ray::new(inv.transform_point3(o), inv.transform_vector3(d));

            let mut tri_leaf = |first: u32, count: u32, t_max: &mut f32| -> bool {
                for tri in first..first + count {
                    if let Some(hit) = intersect_tri(local.origin, local.direction, &sc.tris[tri as usize], *t_max) {
                        if on_hit(mi_index, tri, hit, t_max) {
                            return true;
                        }
                    }
                }
                false
            };
            let stop = if wide {
                walk_wide(&sc.wide_nodes, mesh.wide_node_index, &local, t_max, &mut tri_leaf)
            } else {
                walk_binary(&sc.nodes, mesh.node_index, &local, t_max, &mut tri_leaf)
            };
            if stop {
                return true;
            }
        }
        false
    };

    if wide {
        walk_wide(&sc.wide_nodes, sc.wide_root_node, &world_ray, t_max, &mut instance_leaf)
    } else {
        walk_binary(&sc.nodes, sc.root_node, &world_ray, t_max, &mut instance_leaf)
    }
}
