//! Denoising of the accumulated image.
//!
//! Both filters read the running mean and the aux buffers and write the
//! `filtered` and display buffers of a [`Frame`]. The running mean itself is
//! never touched, so denoising the same frame twice gives the same result.

pub mod graph;
pub mod nlm;
pub mod unet;

pub use graph::{PassAccess, Task, TaskGraph};
pub use nlm::{joint_nlm_filter, NlmKernel, NlmParams};
pub use unet::{ConvLayer, UNet, UNetWeights};

use crate::framebuffer::Frame;
use crate::region::Rect;

/// Joint NLM over `rect`, guided by whatever aux buffers the frame has.
pub fn nlm_denoise(frame: &mut Frame, params: &NlmParams, rect: &Rect) {
    let rect = rect.resolve(frame.w(), frame.h());
    if rect.is_empty() {
        return;
    }
    joint_nlm_filter(
        params,
        &frame.clean,
        &frame.variance,
        frame.base_color.as_ref(),
        frame.depth_normals.as_ref(),
        &rect,
        &mut frame.filtered,
    );
    refresh_display(frame, &rect);
}

/// Tonemap `filtered` into the display buffer over `rect`.
pub(crate) fn refresh_display(frame: &mut Frame, rect: &Rect) {
    let tonemap = frame.tonemap;
    frame.final_buf.copy_from(&frame.filtered, rect, |p| tonemap.apply(p));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::TonemapParams;
    use ray_math::Vec4;

    #[test]
    fn test_nlm_denoise_is_idempotent() {
        let mut frame = Frame::new(6, 6);
        for (i, p) in frame.clean.pixels_mut().iter_mut().enumerate() {
            let v = if i % 3 == 0 { 0.8 } else { 0.2 };
            *p = Vec4::new(v, v, v, 1.0);
        }
        frame.variance.fill(0.05);
        frame.tonemap = TonemapParams {
            srgb: false,
            ..Default::default()
        };
        let clean = frame.clean.clone();
        let params = NlmParams {
            kernel: NlmKernel::W7N3,
            ..Default::default()
        };

        nlm_denoise(&mut frame, &params, &Rect::default());
        let first = frame.final_buf.clone();
        nlm_denoise(&mut frame, &params, &Rect::default());

        assert_eq!(frame.clean, clean);
        assert_eq!(frame.final_buf, first);
        assert_eq!(frame.final_buf.pixel(2, 2), frame.filtered.pixel(2, 2));
    }
}
