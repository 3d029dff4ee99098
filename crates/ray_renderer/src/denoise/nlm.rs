//! Joint non-local-means filter.
//!
//! Each output pixel is a weighted mean over a square search window. A
//! neighbour's weight falls off with the variance-normalized distance between
//! the two pixels' patches, and optionally with the distance between their
//! feature values (base color, depth-normals) so edges in the features are
//! preserved.

use ray_math::Vec4;
use rayon::prelude::*;

use crate::framebuffer::Framebuffer;
use crate::region::Rect;

/// Supported search-window / patch size pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NlmKernel {
    W21N5,
    W21N3,
    W7N3,
    W3N1,
}

impl NlmKernel {
    /// `(window, neighbourhood)` side lengths.
    pub fn sizes(self) -> (i32, i32) {
        match self {
            NlmKernel::W21N5 => (21, 5),
            NlmKernel::W21N3 => (21, 3),
            NlmKernel::W7N3 => (7, 3),
            NlmKernel::W3N1 => (3, 1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NlmParams {
    pub kernel: NlmKernel,
    /// Variance cancellation strength.
    pub alpha: f32,
    /// Scales the variance normalization; larger values blur more.
    pub damping: f32,
    pub feature0_weight: f32,
    pub feature1_weight: f32,
}

impl Default for NlmParams {
    fn default() -> Self {
        Self {
            kernel: NlmKernel::W21N5,
            alpha: 1.0,
            damping: 0.45,
            feature0_weight: 64.0,
            feature1_weight: 32.0,
        }
    }
}

/// Clamped reads from a full-frame buffer.
struct Src<'a> {
    w: i32,
    h: i32,
    pixels: &'a [Vec4],
}

impl<'a> Src<'a> {
    fn new(fb: &'a Framebuffer) -> Self {
        Self {
            w: fb.w() as i32,
            h: fb.h() as i32,
            pixels: fb.pixels(),
        }
    }

    #[inline]
    fn index(&self, x: i32, y: i32) -> usize {
        (y.clamp(0, self.h - 1) * self.w + x.clamp(0, self.w - 1)) as usize
    }

    #[inline]
    fn get(&self, x: i32, y: i32) -> Vec4 {
        self.pixels[self.index(x, y)]
    }
}

/// Filter `rect` of `input` into the same pixels of `out`.
///
/// `variance` is per pixel over the whole frame; features must match the
/// frame size. All buffers are full-frame.
pub fn joint_nlm_filter(
    params: &NlmParams,
    input: &Framebuffer,
    variance: &[f32],
    feature0: Option<&Framebuffer>,
    feature1: Option<&Framebuffer>,
    rect: &Rect,
    out: &mut Framebuffer,
) {
    if rect.is_empty() || input.w() == 0 || input.h() == 0 {
        return;
    }
    let src = Src::new(input);
    let f0 = feature0.map(Src::new);
    let f1 = feature1.map(Src::new);
    let (window, neighbourhood) = params.kernel.sizes();
    let wr = (window - 1) / 2;
    let nr = (neighbourhood - 1) / 2;
    let patch_norm = 1.0 / (neighbourhood * neighbourhood) as f32;
    let damping2 = params.damping * params.damping;

    let filter_pixel = |ix: i32, iy: i32| -> Vec4 {
        let mut sum = Vec4::ZERO;
        let mut sum_weight = 0.0;
        for k in -wr..=wr {
            let jy = iy + k;
            for l in -wr..=wr {
                let jx = ix + l;

                let mut distance = 0.0;
                for q in -nr..=nr {
                    for p in -nr..=nr {
                        let i = src.index(ix + p, iy + q);
                        let j = src.index(jx + p, jy + q);
                        let (ivar, jvar) = (variance[i], variance[j]);
                        let d = src.pixels[i] - src.pixels[j];
                        let d2 = (d * d).truncate();
                        let num = d2 - params.alpha * (ivar + ivar.min(jvar));
                        distance += num.element_sum() / (3.0 * (1e-4 + damping2 * (ivar + jvar)));
                    }
                }
                let mut weight = (-(distance * patch_norm).max(0.0)).exp();

                if f0.is_some() || f1.is_some() {
                    let feature_distance = |f: &Option<Src<'_>>, fw: f32| {
                        f.as_ref().map_or(0.0, |f| {
                            let d = (f.get(ix, iy) - f.get(jx, jy)).truncate();
                            fw * (d * d).element_sum() / 3.0
                        })
                    };
                    let fd = feature_distance(&f0, params.feature0_weight)
                        .max(feature_distance(&f1, params.feature1_weight));
                    weight = weight.min((-fd.clamp(0.0, 10_000.0)).exp());
                }

                sum += src.get(jx, jy) * weight;
                sum_weight += weight;
            }
        }
        if sum_weight > 0.0 {
            sum / sum_weight
        } else {
            src.get(ix, iy)
        }
    };

    let rows: Vec<Vec<Vec4>> = (rect.y..rect.y + rect.h)
        .into_par_iter()
        .map(|y| {
            (rect.x..rect.x + rect.w)
                .map(|x| filter_pixel(x as i32, y as i32))
                .collect()
        })
        .collect();

    for (row, y) in rows.into_iter().zip(rect.y..) {
        for (p, x) in row.into_iter().zip(rect.x..) {
            out.set_pixel(x, y, p);
        }
    }
}
