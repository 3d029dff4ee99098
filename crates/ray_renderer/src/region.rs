//! Image regions and their per-region render state.

use serde::{Deserialize, Serialize};

use crate::sequence::{update_sequence, HALTON_COUNT, HALTON_SEQ_LEN};

/// Pixel rectangle. An empty rect (`w == 0 || h == 0`) stands for the whole frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub fn area(&self) -> usize {
        self.w as usize * self.h as usize
    }

    #[inline]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.w && y < self.y + self.h
    }

    /// Overlap of two rects, empty when they are disjoint.
    pub fn intersect(&self, other: &Rect) -> Rect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.w).min(other.x + other.w);
        let y1 = (self.y + self.h).min(other.y + other.h);
        if x1 <= x0 || y1 <= y0 {
            return Rect::default();
        }
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// The rect clipped to a `w x h` frame, with empty meaning the full frame.
    pub fn resolve(&self, w: u32, h: u32) -> Rect {
        let frame = Rect::new(0, 0, w, h);
        if self.is_empty() {
            return frame;
        }
        self.intersect(&frame)
    }

    /// Index of global pixel `(x, y)` in a buffer covering this rect.
    #[inline]
    pub fn local_index(&self, x: u32, y: u32) -> usize {
        (y - self.y) as usize * self.w as usize + (x - self.x) as usize
    }
}

/// One tile being refined over many passes.
///
/// Owned by the caller and handed to every render call for that tile.
/// Clear it whenever the camera or the scene changes.
#[derive(Clone, Debug, Default)]
pub struct RegionContext {
    pub rect: Rect,
    iteration: u32,
    halton_seq: Vec<f32>,
    halton_block: Option<u32>,
}

impl RegionContext {
    pub fn new(rect: Rect) -> Self {
        Self {
            rect,
            ..Default::default()
        }
    }

    /// Number of started passes.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Restart accumulation from scratch.
    pub fn clear(&mut self) {
        self.iteration = 0;
        self.halton_seq.clear();
        self.halton_block = None;
    }

    /// Start the next pass, refreshing the cached sequence on a block change.
    pub fn advance(&mut self) -> u32 {
        self.iteration += 1;
        let block = self.iteration - self.iteration % HALTON_SEQ_LEN;
        if self.halton_block != Some(block) {
            self.halton_seq = update_sequence(block);
            self.halton_block = Some(block);
        }
        self.iteration
    }

    /// Sample vector of the current iteration.
    pub fn sample(&self) -> &[f32] {
        let row = match self.halton_block {
            Some(block) if self.iteration >= block => (self.iteration - block) as usize,
            _ => return &[],
        };
        let start = row * HALTON_COUNT;
        self.halton_seq.get(start..start + HALTON_COUNT).unwrap_or(&[])
    }
}
