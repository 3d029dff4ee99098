//! Ray sorting for incoherent bounces.
//!
//! Secondary rays are grouped by origin cell and direction octant so that
//! consecutive rays walk similar parts of the BVH. Sorting only reorders a
//! batch; every ray keeps its pixel coordinate and traces to the same hit.

use ray_math::{Aabb, Vec3};
use rayon::prelude::*;

use crate::ray::RayData;

/// Batches smaller than this are traced unsorted.
pub const MIN_SORT_RAYS: usize = 1024;

/// Number of cells per axis of the sorting grid.
const GRID_CELLS: f32 = 256.0;

const RADIX_BITS: u32 = 8;
const RADIX_PASSES: u32 = 4;

/// Run of consecutive rays that share one hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RayChunk {
    pub hash: u32,
    pub base: u32,
    pub size: u32,
}

/// Reusable buffers for [`sort_rays`].
#[derive(Debug, Default)]
pub struct SortScratch {
    pub hashes: Vec<u32>,
    pub chunks: Vec<RayChunk>,
    chunks_tmp: Vec<RayChunk>,
    /// Source index of the ray that ends up at each position.
    pub scan_values: Vec<u32>,
    cycle: Vec<u32>,
}

/// Origin grid of the sort hash, spanning the scene bounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SortGrid {
    pub root_min: Vec3,
    pub cell_size: Vec3,
}

impl SortGrid {
    pub fn from_bounds(bounds: &Aabb) -> Self {
        let root_min = bounds.min();
        let extent = (bounds.max() - root_min).max(Vec3::splat(f32::MIN_POSITIVE));
        Self {
            root_min,
            cell_size: extent / GRID_CELLS,
        }
    }
}

/// Spread the low 8 bits of `x` so that two zero bits follow each one.
#[inline]
fn spread_bits(x: u32) -> u32 {
    let mut x = x & 0xff;
    x = (x | (x << 8)) & 0x0000_f00f;
    x = (x | (x << 4)) & 0x0000_c30c3;
    x = (x | (x << 2)) & 0x0024_9249;
    x
}

/// 24-bit Morton code of the origin cell above 3 direction-octant bits.
pub fn ray_hash(ray: &RayData, root_min: Vec3, cell_size: Vec3) -> u32 {
    // The max face and anything beyond it land in the last cell
    let cell = ((ray.o - root_min) / cell_size).clamp(Vec3::ZERO, Vec3::splat(GRID_CELLS - 1.0));
    let (x, y, z) = (cell.x as u32, cell.y as u32, cell.z as u32);
    let morton = (spread_bits(x) << 2) | (spread_bits(y) << 1) | spread_bits(z);

    let octant = u32::from(ray.d.x < 0.0) << 2 | u32::from(ray.d.y < 0.0) << 1 | u32::from(ray.d.z < 0.0);
    (morton << 3) | octant
}

/// Reorder `rays` in place by hash, keeping equal hashes in input order.
///
/// Afterwards `scratch.scan_values[i]` holds the original index of the ray
/// now at position `i`; pass it to [`apply_permutation`] for any buffer that
/// runs parallel to the rays.
pub fn sort_rays(rays: &mut [RayData], grid: &SortGrid, scratch: &mut SortScratch) {
    let n = rays.len();
    scratch.hashes.clear();
    rays.par_iter()
        .map(|r| ray_hash(r, grid.root_min, grid.cell_size))
        .collect_into_vec(&mut scratch.hashes);

    compress_runs(&scratch.hashes, &mut scratch.chunks);
    radix_sort_chunks(&mut scratch.chunks, &mut scratch.chunks_tmp);

    scratch.scan_values.clear();
    scratch.scan_values.reserve(n);
    for chunk in &scratch.chunks {
        scratch.scan_values.extend(chunk.base..chunk.base + chunk.size);
    }

    scratch.cycle.clear();
    scratch.cycle.extend_from_slice(&scratch.scan_values);
    permute_by_cycles(&mut scratch.cycle, rays);
}

fn compress_runs(hashes: &[u32], chunks: &mut Vec<RayChunk>) {
    chunks.clear();
    for (i, &hash) in hashes.iter().enumerate() {
        match chunks.last_mut() {
            Some(last) if last.hash == hash => last.size += 1,
            _ => chunks.push(RayChunk {
                hash,
                base: i as u32,
                size: 1,
            }),
        }
    }
}

/// Stable least-significant-digit radix sort on the chunk hashes.
fn radix_sort_chunks(chunks: &mut Vec<RayChunk>, tmp: &mut Vec<RayChunk>) {
    let buckets = 1usize << RADIX_BITS;
    let mask = (buckets - 1) as u32;
    tmp.clear();
    tmp.resize(chunks.len(), RayChunk::default());

    for pass in 0..RADIX_PASSES {
        let shift = pass * RADIX_BITS;
        let mut counts = vec![0u32; buckets];
        for c in chunks.iter() {
            counts[((c.hash >> shift) & mask) as usize] += 1;
        }
        let mut offset = 0;
        for count in counts.iter_mut() {
            let here = *count;
            *count = offset;
            offset += here;
        }
        for c in chunks.iter() {
            let digit = ((c.hash >> shift) & mask) as usize;
            tmp[counts[digit] as usize] = *c;
            counts[digit] += 1;
        }
        std::mem::swap(chunks, tmp);
    }
}

/// Gather `items[perm[i]]` into position `i` by following cycles.
/// `perm` is consumed (left as the identity).
fn permute_by_cycles<T>(perm: &mut [u32], items: &mut [T]) {
    for start in 0..perm.len() {
        let mut cur = start;
        loop {
            let next = perm[cur] as usize;
            perm[cur] = cur as u32;
            if next == start || next == cur {
                break;
            }
            items.swap(cur, next);
            cur = next;
        }
    }
}

/// Reorder a buffer that runs parallel to a sorted ray batch.
pub fn apply_permutation<T: Copy>(perm: &[u32], items: &mut [T]) {
    let sorted: Vec<T> = perm.iter().map(|&i| items[i as usize]).collect();
    items.copy_from_slice(&sorted);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray::PixelCoord;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_rays(n: usize, seed: u64) -> Vec<RayData> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| RayData {
                o: Vec3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)),
                d: Vec3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
                    .normalize_or_zero(),
                xy: PixelCoord::new(i as u32 % 64, i as u32 / 64),
                ..Default::default()
            })
            .collect()
    }

    fn unit_grid() -> SortGrid {
        SortGrid::from_bounds(&Aabb::from_points(Vec3::splat(-1.0), Vec3::splat(1.0)))
    }

    #[test]
    fn test_hash_encodes_octant_and_cell() {
        let grid = unit_grid();
        let ray = |o: Vec3, d: Vec3| RayData { o, d, ..Default::default() };

        let h = ray_hash(&ray(Vec3::splat(-1.0), Vec3::ONE), grid.root_min, grid.cell_size);
        assert_eq!(h, 0);
        let h = ray_hash(&ray(Vec3::splat(-1.0), -Vec3::ONE), grid.root_min, grid.cell_size);
        assert_eq!(h, 0b111);
        // Far corner sets all 24 morton bits
        let h = ray_hash(&ray(Vec3::splat(1.0), Vec3::ONE), grid.root_min, grid.cell_size);
        assert_eq!(h >> 3, 0x00ff_ffff);
        // Outside the bounds clamps to the border cell
        let h = ray_hash(&ray(Vec3::splat(5.0), Vec3::ONE), grid.root_min, grid.cell_size);
        assert_eq!(h >> 3, 0x00ff_ffff);
        let h = ray_hash(&ray(Vec3::splat(-5.0), Vec3::ONE), grid.root_min, grid.cell_size);
        assert_eq!(h, 0);
    }

    #[test]
    fn test_hash_cells_at_the_max_face() {
        let grid = SortGrid::from_bounds(&Aabb::from_points(Vec3::new(-3.7, 0.1, -1.3), Vec3::new(2.9, 5.3, 0.7)));
        let ray = |o: Vec3| RayData { o, d: Vec3::ONE, ..Default::default() };
        let last = 0x00ff_ffff;

        let max = grid.root_min + grid.cell_size * GRID_CELLS;
        assert_eq!(ray_hash(&ray(max), grid.root_min, grid.cell_size) >> 3, last);
        let inside_last = grid.root_min + grid.cell_size * (GRID_CELLS - 0.5);
        assert_eq!(ray_hash(&ray(inside_last), grid.root_min, grid.cell_size) >> 3, last);
        // One cell back along x
        let below = inside_last - Vec3::new(grid.cell_size.x, 0.0, 0.0);
        assert_ne!(ray_hash(&ray(below), grid.root_min, grid.cell_size) >> 3, last);
    }

    #[test]
    fn test_sorted_batch_is_ordered_permutation() {
        let mut rays = random_rays(3000, 7);
        let original = rays.clone();
        let grid = unit_grid();
        let mut scratch = SortScratch::default();
        sort_rays(&mut rays, &grid, &mut scratch);

        let hashes: Vec<u32> = rays.iter().map(|r| ray_hash(r, grid.root_min, grid.cell_size)).collect();
        assert!(hashes.windows(2).all(|w| w[0] <= w[1]));
        for (i, r) in rays.iter().enumerate() {
            assert_eq!(*r, original[scratch.scan_values[i] as usize]);
        }
    }

    #[test]
    fn test_equal_hashes_keep_input_order() {
        let grid = unit_grid();
        let mut rays: Vec<RayData> = (0..8)
            .map(|i| RayData {
                o: if i % 2 == 0 { Vec3::splat(0.9) } else { Vec3::splat(-0.9) },
                xy: PixelCoord::new(i, 0),
                ..Default::default()
            })
            .collect();
        let mut scratch = SortScratch::default();
        sort_rays(&mut rays, &grid, &mut scratch);

        let xs: Vec<u32> = rays.iter().map(|r| r.xy.x()).collect();
        assert_eq!(xs, vec![1, 3, 5, 7, 0, 2, 4, 6]);
    }

    #[test]
    fn test_apply_permutation_matches_rays() {
        let mut rays = random_rays(500, 3);
        let mut tags: Vec<u32> = (0..500).collect();
        let mut scratch = SortScratch::default();
        sort_rays(&mut rays, &unit_grid(), &mut scratch);
        apply_permutation(&scratch.scan_values, &mut tags);
        for (r, &t) in rays.iter().zip(&tags) {
            assert_eq!(r.xy, PixelCoord::new(t % 64, t / 64));
        }
    }
}
