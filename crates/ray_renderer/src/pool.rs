//! Pooled per-pass scratch memory.
//!
//! Every render call checks a [`PassData`] out of the renderer's pool and
//! hands it back when the guard drops. An empty pool never blocks, it just
//! allocates another scratch set.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

use crate::framebuffer::RegionBuffers;
use crate::ray::{HitData, RayData, ShadowRay};
use crate::sort::SortScratch;

/// Two ray buffers; one is traced while the other collects the next bounce.
#[derive(Debug, Default)]
pub struct RaySlots {
    slots: [Vec<RayData>; 2],
    current: usize,
}

impl RaySlots {
    /// Rays of the bounce being traced.
    pub fn current(&self) -> &[RayData] {
        &self.slots[self.current]
    }

    pub fn current_mut(&mut self) -> &mut Vec<RayData> {
        &mut self.slots[self.current]
    }

    /// Current rays and the (cleared) buffer for the next bounce.
    pub fn split(&mut self) -> (&mut Vec<RayData>, &mut Vec<RayData>) {
        let [a, b] = &mut self.slots;
        let (cur, next) = if self.current == 0 { (a, b) } else { (b, a) };
        next.clear();
        (cur, next)
    }

    /// Make the next-bounce buffer current.
    pub fn swap(&mut self) {
        self.current ^= 1;
    }

    pub fn clear(&mut self) {
        for s in &mut self.slots {
            s.clear();
        }
        self.current = 0;
    }
}

/// Scratch buffers for one region pass.
#[derive(Debug, Default)]
pub struct PassData {
    pub rays: RaySlots,
    pub shadow_rays: Vec<ShadowRay>,
    pub hits: Vec<HitData>,
    pub sort: SortScratch,
    pub region: RegionBuffers,
    pub required_samples: Vec<u16>,
}

/// Mutex-guarded stack of idle scratch sets.
#[derive(Debug, Default)]
pub struct PassPool {
    idle: Mutex<Vec<PassData>>,
}

impl PassPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a scratch set, allocating one when the pool is empty.
    pub fn checkout(&self) -> PassGuard<'_> {
        let data = self.idle.lock().pop().unwrap_or_else(|| {
            log::debug!("Pass pool empty, allocating scratch");
            PassData::default()
        });
        PassGuard {
            pool: self,
            data: Some(data),
        }
    }

    fn checkin(&self, data: PassData) {
        self.idle.lock().push(data);
    }

    /// Number of idle scratch sets.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Drop all idle scratch sets.
    pub fn clear(&self) {
        self.idle.lock().clear();
    }
}

/// Exclusive access to one scratch set; returns it to the pool on drop.
pub struct PassGuard<'a> {
    pool: &'a PassPool,
    data: Option<PassData>,
}

impl Deref for PassGuard<'_> {
    type Target = PassData;

    fn deref(&self) -> &PassData {
        // Only `drop` takes the data out
        self.data.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PassGuard<'_> {
    fn deref_mut(&mut self) -> &mut PassData {
        self.data.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.checkin(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray::PixelCoord;

    #[test]
    fn test_checkout_returns_on_drop() {
        let pool = PassPool::new();
        {
            let mut a = pool.checkout();
            let b = pool.checkout();
            a.hits.reserve(16);
            assert_eq!(pool.idle_count(), 0);
            drop(b);
            assert_eq!(pool.idle_count(), 1);
        }
        assert_eq!(pool.idle_count(), 2);

        // Reused sets keep their allocations
        let c = pool.checkout();
        let d = pool.checkout();
        assert!(c.hits.capacity() >= 16 || d.hits.capacity() >= 16);
    }

    #[test]
    fn test_concurrent_checkout_never_blocks() {
        let pool = PassPool::new();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        let mut g = pool.checkout();
                        g.shadow_rays.clear();
                    }
                });
            }
        });
        assert!(pool.idle_count() >= 1 && pool.idle_count() <= 8);
    }

    #[test]
    fn test_ray_slots_swap() {
        let mut slots = RaySlots::default();
        slots.current_mut().push(RayData {
            xy: PixelCoord::new(1, 2),
            ..Default::default()
        });
        {
            let (cur, next) = slots.split();
            assert_eq!(cur.len(), 1);
            next.push(RayData::default());
            next.push(RayData::default());
        }
        slots.swap();
        assert_eq!(slots.current().len(), 2);
        let (_, next) = slots.split();
        assert!(next.is_empty());
    }
}
