//! Scrambled Halton sequences.
//!
//! - One digit permutation per prime base, built once per process from a
//!   fixed seed and never mutated afterwards
//! - [`update_sequence`] fills a block of [`HALTON_SEQ_LEN`] iterations
//! - Dimension layout shared by ray generation and shading
//!
//! The sample vector of an iteration depends on nothing but the iteration
//! index, which keeps renders reproducible across threads and backends.

use std::sync::OnceLock;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Number of dimensions (prime bases) per sample vector.
pub const HALTON_COUNT: usize = 228;
/// Iterations per cached sequence block.
pub const HALTON_SEQ_LEN: u32 = 256;

const PERMUTATION_SEED: u64 = 0;
const ONE_MINUS_EPSILON: f32 = 0.999_999_94;

// Camera dimensions
pub const RAND_DIM_FILTER_U: usize = 0;
pub const RAND_DIM_FILTER_V: usize = 1;
pub const RAND_DIM_LENS_U: usize = 2;
pub const RAND_DIM_LENS_V: usize = 3;
pub const RAND_DIM_BASE_COUNT: usize = 4;

// Per-bounce dimensions, relative to `rand_dim(depth)`
pub const RAND_DIM_BSDF_PICK: usize = 0;
pub const RAND_DIM_BSDF_U: usize = 1;
pub const RAND_DIM_BSDF_V: usize = 2;
pub const RAND_DIM_LIGHT_PICK: usize = 3;
pub const RAND_DIM_LIGHT_U: usize = 4;
pub const RAND_DIM_LIGHT_V: usize = 5;
pub const RAND_DIM_TERMINATE: usize = 6;
pub const RAND_DIM_TEX_U: usize = 7;
pub const RAND_DIM_TEX_V: usize = 8;
pub const RAND_DIM_BOUNCE_COUNT: usize = 9;

/// Bounces that get their own dimensions; deeper bounces reuse the last set.
pub const MAX_BOUNCES: usize = 24;

const _: () = assert!(RAND_DIM_BASE_COUNT + MAX_BOUNCES * RAND_DIM_BOUNCE_COUNT <= HALTON_COUNT);

/// First dimension used at total path depth `total_depth`.
#[inline]
pub fn rand_dim(total_depth: u32) -> usize {
    RAND_DIM_BASE_COUNT + (total_depth as usize).min(MAX_BOUNCES - 1) * RAND_DIM_BOUNCE_COUNT
}

/// Prime bases and their digit permutations.
pub struct SequenceTable {
    primes: Vec<u32>,
    /// Permutation of base `primes[i]` lives at `offsets[i]..offsets[i] + primes[i]`.
    offsets: Vec<usize>,
    permutations: Vec<u16>,
}

impl SequenceTable {
    fn build() -> Self {
        let primes = first_primes(HALTON_COUNT);
        let mut rng = StdRng::seed_from_u64(PERMUTATION_SEED);
        let mut offsets = Vec::with_capacity(primes.len());
        let mut permutations = Vec::with_capacity(primes.iter().map(|&p| p as usize).sum());
        for &p in &primes {
            offsets.push(permutations.len());
            let mut perm: Vec<u16> = (0..p as u16).collect();
            perm.shuffle(&mut rng);
            permutations.extend_from_slice(&perm);
        }
        log::debug!(
            "Built Halton permutation table: {} bases, {} digits",
            primes.len(),
            permutations.len()
        );
        Self {
            primes,
            offsets,
            permutations,
        }
    }

    /// The process-wide table.
    pub fn get() -> &'static SequenceTable {
        static TABLE: OnceLock<SequenceTable> = OnceLock::new();
        TABLE.get_or_init(Self::build)
    }

    pub fn prime(&self, dim: usize) -> u32 {
        self.primes[dim]
    }

    pub fn permutation(&self, dim: usize) -> &[u16] {
        let start = self.offsets[dim];
        &self.permutations[start..start + self.primes[dim] as usize]
    }

    /// Scrambled radical inverse of `index` in dimension `dim`.
    #[inline]
    pub fn sample(&self, dim: usize, index: u64) -> f32 {
        scrambled_radical_inverse(self.prime(dim), self.permutation(dim), index)
    }
}

/// Radical inverse of `index` in `base` with every digit run through `perm`.
///
/// The infinite tail of zero digits maps to `perm[0]` and is folded in as a
/// geometric series, so the result is strictly below one.
pub fn scrambled_radical_inverse(base: u32, perm: &[u16], mut index: u64) -> f32 {
    let base64 = base as u64;
    let inv_base = 1.0 / base as f64;
    let mut inv_base_n = 1.0f64;
    let mut reversed = 0u64;
    while index > 0 {
        let next = index / base64;
        let digit = index - next * base64;
        reversed = reversed * base64 + perm[digit as usize] as u64;
        inv_base_n *= inv_base;
        index = next;
    }
    let tail = inv_base * perm[0] as f64 / (1.0 - inv_base);
    ((inv_base_n * (reversed as f64 + tail)) as f32).min(ONE_MINUS_EPSILON)
}

/// Sample vectors of iterations `iteration_base..iteration_base + HALTON_SEQ_LEN`.
///
/// Entry `i * HALTON_COUNT + j` is dimension `j` of iteration `iteration_base + i`.
pub fn update_sequence(iteration_base: u32) -> Vec<f32> {
    let table = SequenceTable::get();
    let mut seq = Vec::with_capacity(HALTON_SEQ_LEN as usize * HALTON_COUNT);
    for i in 0..HALTON_SEQ_LEN {
        let index = iteration_base as u64 + i as u64;
        seq.extend((0..HALTON_COUNT).map(|dim| table.sample(dim, index)));
    }
    seq
}

fn first_primes(count: usize) -> Vec<u32> {
    let mut primes: Vec<u32> = Vec::with_capacity(count);
    let mut candidate = 2u32;
    while primes.len() < count {
        if primes
            .iter()
            .take_while(|&&p| p * p <= candidate)
            .all(|&p| candidate % p != 0)
        {
            primes.push(candidate);
        }
        candidate += 1;
    }
    primes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_primes() {
        let primes = first_primes(10);
        assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
        assert_eq!(SequenceTable::get().prime(HALTON_COUNT - 1), 1439);
    }

    #[test]
    fn test_permutations_are_bijective() {
        let table = SequenceTable::get();
        for dim in [0, 1, 17, HALTON_COUNT - 1] {
            let mut perm = table.permutation(dim).to_vec();
            perm.sort_unstable();
            let expected: Vec<u16> = (0..table.prime(dim) as u16).collect();
            assert_eq!(perm, expected);
        }
    }

    #[test]
    fn test_identity_permutation_is_plain_radical_inverse() {
        let perm = [0u16, 1];
        assert_eq!(scrambled_radical_inverse(2, &perm, 1), 0.5);
        assert_eq!(scrambled_radical_inverse(2, &perm, 2), 0.25);
        assert_eq!(scrambled_radical_inverse(2, &perm, 3), 0.75);
        let perm3 = [0u16, 1, 2];
        assert!((scrambled_radical_inverse(3, &perm3, 5) - 7.0 / 9.0).abs() < 1e-6);
    }

    #[test]
    fn test_samples_in_unit_interval() {
        let seq = update_sequence(0);
        assert_eq!(seq.len(), HALTON_SEQ_LEN as usize * HALTON_COUNT);
        assert!(seq.iter().all(|&x| (0.0..1.0).contains(&x)));
    }

    #[test]
    fn test_sequence_is_deterministic() {
        let a = update_sequence(512);
        let b = update_sequence(512);
        assert_eq!(bytemuck::cast_slice::<f32, u8>(&a), bytemuck::cast_slice::<f32, u8>(&b));

        // Same iteration from another thread and another block alignment
        let from_thread = std::thread::spawn(|| update_sequence(512 + 3)).join().unwrap();
        assert_eq!(&a[3 * HALTON_COUNT..4 * HALTON_COUNT], &from_thread[..HALTON_COUNT]);
    }

    #[test]
    fn test_rand_dim_layout() {
        assert_eq!(rand_dim(0), RAND_DIM_BASE_COUNT);
        assert_eq!(rand_dim(1), RAND_DIM_BASE_COUNT + RAND_DIM_BOUNCE_COUNT);
        assert_eq!(rand_dim(1000), rand_dim(MAX_BOUNCES as u32 - 1));
        assert!(rand_dim(1000) + RAND_DIM_TEX_V < HALTON_COUNT);
    }
}
