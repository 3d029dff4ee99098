//! Flattened bounding volume hierarchies.
//!
//! Binary nodes are built with a median split on the longest centroid axis
//! and can be collapsed into 8-wide nodes. Both layouts are plain `Pod`
//! records so backends can upload them unchanged. Top-level (instances) and
//! bottom-level (triangles) trees share the same node arrays.

use bytemuck::{Pod, Zeroable};
use ray_math::{Aabb, Vec3};

/// Maximum primitives per leaf node before splitting.
pub const LEAF_MAX_SIZE: usize = 4;

pub const LEAF_NODE_BIT: u32 = 0x8000_0000;
pub const PRIM_INDEX_BITS: u32 = 0x7fff_ffff;
pub const SEP_AXIS_BITS: u32 = 0xc000_0000;
pub const RIGHT_CHILD_BITS: u32 = 0x3fff_ffff;

/// Sentinel for "no node" (an empty tree, an unused wide slot).
pub const INVALID_INDEX: u32 = 0xffff_ffff;

/// Binary BVH node.
///
/// Leaves: `prim_index = LEAF_NODE_BIT | first`, `prim_count = count`.
/// Interior: `prim_index = left child`, `prim_count = right child | axis << 30`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct BvhNode {
    pub bbox_min: [f32; 3],
    pub prim_index: u32,
    pub bbox_max: [f32; 3],
    pub prim_count: u32,
}

impl BvhNode {
    fn leaf(bbox: &Aabb, first: u32, count: u32) -> Self {
        Self {
            bbox_min: bbox.min().to_array(),
            prim_index: LEAF_NODE_BIT | (first & PRIM_INDEX_BITS),
            bbox_max: bbox.max().to_array(),
            prim_count: count,
        }
    }

    fn interior(bbox: &Aabb, left: u32, right: u32, axis: usize) -> Self {
        Self {
            bbox_min: bbox.min().to_array(),
            prim_index: left,
            bbox_max: bbox.max().to_array(),
            prim_count: (right & RIGHT_CHILD_BITS) | ((axis as u32) << 30),
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.prim_index & LEAF_NODE_BIT != 0
    }

    #[inline]
    pub fn first_prim(&self) -> u32 {
        self.prim_index & PRIM_INDEX_BITS
    }

    #[inline]
    pub fn left_child(&self) -> u32 {
        self.prim_index
    }

    #[inline]
    pub fn right_child(&self) -> u32 {
        self.prim_count & RIGHT_CHILD_BITS
    }

    #[inline]
    pub fn split_axis(&self) -> usize {
        ((self.prim_count & SEP_AXIS_BITS) >> 30) as usize
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::from_point_cloud(&[Vec3::from_array(self.bbox_min), Vec3::from_array(self.bbox_max)])
    }
}

/// Eight-wide BVH node in structure-of-arrays layout.
///
/// Leaves: `child[0] = LEAF_NODE_BIT | first`, `child[1] = count`.
/// Interior: `child[i]` is a wide node index or [`INVALID_INDEX`].
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct WideBvhNode {
    pub bbox_min: [[f32; 8]; 3],
    pub bbox_max: [[f32; 8]; 3],
    pub child: [u32; 8],
}

impl WideBvhNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.child[0] & LEAF_NODE_BIT != 0
    }

    #[inline]
    pub fn first_prim(&self) -> u32 {
        self.child[0] & PRIM_INDEX_BITS
    }

    #[inline]
    pub fn prim_count(&self) -> u32 {
        self.child[1]
    }

    pub fn child_bounds(&self, i: usize) -> Aabb {
        Aabb::from_point_cloud(&[
            Vec3::new(self.bbox_min[0][i], self.bbox_min[1][i], self.bbox_min[2][i]),
            Vec3::new(self.bbox_max[0][i], self.bbox_max[1][i], self.bbox_max[2][i]),
        ])
    }

    fn empty() -> Self {
        Self {
            bbox_min: [[f32::MAX; 8]; 3],
            bbox_max: [[-f32::MAX; 8]; 3],
            child: [INVALID_INDEX; 8],
        }
    }
}

/// Build a binary BVH over `prim_bounds`, appending nodes to `nodes`.
///
/// `order` receives the primitive permutation: leaf ranges index into it
/// starting at `prim_offset`. Sorting is stable so primitives with identical
/// centroids keep their relative order. Returns the root node index, or
/// [`INVALID_INDEX`] when there are no primitives.
pub fn build_bvh(
    prim_bounds: &[Aabb],
    prim_offset: u32,
    nodes: &mut Vec<BvhNode>,
    order: &mut Vec<u32>,
) -> u32 {
    if prim_bounds.is_empty() {
        return INVALID_INDEX;
    }
    let centroids: Vec<Vec3> = prim_bounds.iter().map(Aabb::centroid).collect();
    let mut indices: Vec<u32> = (0..prim_bounds.len() as u32).collect();

    let root = build_recursive(prim_bounds, &centroids, &mut indices, 0, prim_offset, nodes);
    order.extend_from_slice(&indices);
    root
}

fn build_recursive(
    bounds: &[Aabb],
    centroids: &[Vec3],
    indices: &mut [u32],
    first: u32,
    prim_offset: u32,
    nodes: &mut Vec<BvhNode>,
) -> u32 {
    let node_index = nodes.len() as u32;
    let bbox = indices
        .iter()
        .fold(Aabb::EMPTY, |acc, &i| Aabb::surrounding(&acc, &bounds[i as usize]));

    // Create leaf for small sets
    if indices.len() <= LEAF_MAX_SIZE {
        nodes.push(BvhNode::leaf(&bbox, prim_offset + first, indices.len() as u32));
        return node_index;
    }
    nodes.push(BvhNode::zeroed());

    // Choose split axis based on centroid spread
    let centroid_bounds = indices
        .iter()
        .fold(Aabb::EMPTY, |acc, &i| acc.include(centroids[i as usize]));
    let axis = centroid_bounds.longest_axis();

    indices.sort_by(|&a, &b| centroids[a as usize][axis].total_cmp(&centroids[b as usize][axis]));

    // Split at midpoint
    let mid = indices.len() / 2;
    let (left_indices, right_indices) = indices.split_at_mut(mid);
    let left = build_recursive(bounds, centroids, left_indices, first, prim_offset, nodes);
    let right = build_recursive(
        bounds,
        centroids,
        right_indices,
        first + mid as u32,
        prim_offset,
        nodes,
    );

    nodes[node_index as usize] = BvhNode::interior(&bbox, left, right, axis);
    node_index
}

/// Collapse the binary tree under `root` into 8-wide nodes appended to `wide`.
///
/// Returns the wide root index ([`INVALID_INDEX`] for an empty tree).
pub fn convert_to_wide(nodes: &[BvhNode], root: u32, wide: &mut Vec<WideBvhNode>) -> u32 {
    if root == INVALID_INDEX {
        return INVALID_INDEX;
    }
    convert_node(nodes, root, wide)
}

fn convert_node(nodes: &[BvhNode], index: u32, wide: &mut Vec<WideBvhNode>) -> u32 {
    let node = &nodes[index as usize];
    let wide_index = wide.len() as u32;
    wide.push(WideBvhNode::empty());

    if node.is_leaf() {
        let mut leaf = WideBvhNode::empty();
        leaf.child[0] = node.prim_index;
        leaf.child[1] = node.prim_count;
        for axis in 0..3 {
            leaf.bbox_min[axis][0] = node.bbox_min[axis];
            leaf.bbox_max[axis][0] = node.bbox_max[axis];
        }
        wide[wide_index as usize] = leaf;
        return wide_index;
    }

    // Open the largest interior child until eight slots are used
    let mut children = vec![node.left_child(), node.right_child()];
    while children.len() < 8 {
        let area = |i: u32| nodes[i as usize].bounds().surface_area();
        let candidate = children
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, c)| !nodes[c as usize].is_leaf())
            .max_by(|a, b| area(a.1).total_cmp(&area(b.1)))
            .map(|(slot, _)| slot);
        let Some(slot) = candidate else { break };
        let opened = nodes[children[slot] as usize];
        children[slot] = opened.left_child();
        children.insert(slot + 1, opened.right_child());
    }

    let mut out = WideBvhNode::empty();
    for (i, &child) in children.iter().enumerate() {
        let c = &nodes[child as usize];
        for axis in 0..3 {
            out.bbox_min[axis][i] = c.bbox_min[axis];
            out.bbox_max[axis][i] = c.bbox_max[axis];
        }
        out.child[i] = convert_node(nodes, child, wide);
    }
    wide[wide_index as usize] = out;
    wide_index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_boxes(n: usize) -> Vec<Aabb> {
        (0..n)
            .map(|i| {
                let p = Vec3::new(i as f32 * 2.0, (i % 3) as f32, 0.0);
                Aabb::from_points(p, p + Vec3::ONE)
            })
            .collect()
    }

    fn collect_leaf_prims(nodes: &[BvhNode], index: u32, out: &mut Vec<u32>) {
        let node = &nodes[index as usize];
        if node.is_leaf() {
            out.extend(node.first_prim()..node.first_prim() + node.prim_count);
        } else {
            collect_leaf_prims(nodes, node.left_child(), out);
            collect_leaf_prims(nodes, node.right_child(), out);
        }
    }

    #[test]
    fn test_bvh_empty() {
        let mut nodes = Vec::new();
        let mut order = Vec::new();
        assert_eq!(build_bvh(&[], 0, &mut nodes, &mut order), INVALID_INDEX);
        assert!(nodes.is_empty());
    }

    #[test]
    fn test_bvh_single_leaf() {
        let mut nodes = Vec::new();
        let mut order = Vec::new();
        let root = build_bvh(&unit_boxes(3), 10, &mut nodes, &mut order);
        assert_eq!(root, 0);
        assert!(nodes[0].is_leaf());
        assert_eq!(nodes[0].first_prim(), 10);
        assert_eq!(nodes[0].prim_count, 3);
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_bvh_covers_every_primitive_once() {
        let boxes = unit_boxes(37);
        let mut nodes = Vec::new();
        let mut order = Vec::new();
        let root = build_bvh(&boxes, 0, &mut nodes, &mut order);

        let mut prims = Vec::new();
        collect_leaf_prims(&nodes, root, &mut prims);
        prims.sort_unstable();
        assert_eq!(prims, (0..37).collect::<Vec<_>>());

        let mut sorted_order = order.clone();
        sorted_order.sort_unstable();
        assert_eq!(sorted_order, (0..37).collect::<Vec<_>>());

        // Every leaf box contains its primitives
        for node in nodes.iter().filter(|n| n.is_leaf()) {
            let bbox = node.bounds();
            for p in node.first_prim()..node.first_prim() + node.prim_count {
                let prim = boxes[order[p as usize] as usize];
                assert!(bbox.min().cmple(prim.min()).all());
                assert!(bbox.max().cmpge(prim.max()).all());
            }
        }
    }

    #[test]
    fn test_bvh_identical_centroids_keep_order() {
        let b = Aabb::from_points(Vec3::ZERO, Vec3::ONE);
        let boxes = vec![b; 9];
        let mut nodes = Vec::new();
        let mut order = Vec::new();
        build_bvh(&boxes, 0, &mut nodes, &mut order);
        assert_eq!(order, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_wide_bvh_has_same_leaves() {
        let boxes = unit_boxes(64);
        let mut nodes = Vec::new();
        let mut order = Vec::new();
        let root = build_bvh(&boxes, 0, &mut nodes, &mut order);

        let mut wide = Vec::new();
        let wide_root = convert_to_wide(&nodes, root, &mut wide);
        assert_eq!(wide_root, 0);
        assert!(wide.len() < nodes.len());

        let mut prims = Vec::new();
        let mut stack = vec![wide_root];
        while let Some(i) = stack.pop() {
            let node = &wide[i as usize];
            if node.is_leaf() {
                prims.extend(node.first_prim()..node.first_prim() + node.prim_count());
            } else {
                stack.extend(node.child.iter().copied().filter(|&c| c != INVALID_INDEX));
            }
        }
        prims.sort_unstable();
        assert_eq!(prims, (0..64).collect::<Vec<_>>());
    }
}
