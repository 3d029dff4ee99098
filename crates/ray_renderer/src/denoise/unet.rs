//! Small U-Net-shaped convolutional filter.
//!
//! Six 3x3 convolution passes over tiled feature maps:
//!
//! | pass | reads           | writes | resolution |
//! |------|-----------------|--------|------------|
//! | 0    | input           | enc    | full       |
//! | 1    | enc             | down   | half (2x2 max pool) |
//! | 2    | down            | bott   | half       |
//! | 3    | bott            | down   | half       |
//! | 4    | down (up), enc  | up     | full       |
//! | 5    | up              | output | full       |
//!
//! Pass 3 reuses the `down` buffer, so its tiles must wait until pass 2 is
//! done reading their neighbourhood. The tiled schedule comes from
//! [`TaskGraph`]. Weights are supplied by the caller.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use ray_math::Vec3;

use super::graph::{PassAccess, Slot, TaskGraph};
use crate::error::{RenderError, RenderResult};
use crate::framebuffer::{reversible_tonemap, reversible_tonemap_invert, Frame};
use crate::region::Rect;

/// Color, base color and normal, three channels each.
pub const INPUT_CHANNELS: usize = 9;
pub const OUTPUT_CHANNELS: usize = 3;
pub const PASS_COUNT: usize = 6;

const SLOT_INPUT: Slot = 0;
const SLOT_ENC: Slot = 1;
const SLOT_DOWN: Slot = 2;
const SLOT_BOTT: Slot = 3;
const SLOT_UP: Slot = 4;
const SLOT_OUTPUT: Slot = 5;
const SLOT_COUNT: usize = 6;

/// One 3x3 convolution. `weights` is laid out `[out][in][ky][kx]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvLayer {
    pub in_channels: usize,
    pub out_channels: usize,
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
}

impl ConvLayer {
    #[inline]
    fn weight(&self, oc: usize, ic: usize, ky: usize, kx: usize) -> f32 {
        self.weights[((oc * self.in_channels + ic) * 3 + ky) * 3 + kx]
    }
}

/// Weights of all six passes, in pass order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UNetWeights {
    pub layers: Vec<ConvLayer>,
}

impl UNetWeights {
    pub fn from_json(json: &str) -> RenderResult<Self> {
        let weights: Self = serde_json::from_str(json).map_err(|e| RenderError::InvalidWeights(e.to_string()))?;
        weights.validate()?;
        Ok(weights)
    }

    /// Encoder channel count.
    pub fn enc_channels(&self) -> usize {
        self.layers.first().map_or(0, |l| l.out_channels)
    }

    /// Bottleneck channel count.
    pub fn bottleneck_channels(&self) -> usize {
        self.layers.get(1).map_or(0, |l| l.out_channels)
    }

    /// Check that the layers chain together and every buffer has the right length.
    pub fn validate(&self) -> RenderResult<()> {
        if self.layers.len() != PASS_COUNT {
            return Err(RenderError::InvalidWeights(format!(
                "expected {PASS_COUNT} layers, got {}",
                self.layers.len()
            )));
        }
        let c1 = self.enc_channels();
        let c2 = self.bottleneck_channels();
        if c1 == 0 || c2 == 0 {
            return Err(RenderError::InvalidWeights("zero channel count".into()));
        }
        let expected = [
            (INPUT_CHANNELS, c1),
            (c1, c2),
            (c2, c2),
            (c2, c2),
            (c2 + c1, c1),
            (c1, OUTPUT_CHANNELS),
        ];
        for (i, (layer, (cin, cout))) in self.layers.iter().zip(expected).enumerate() {
            if layer.in_channels != cin || layer.out_channels != cout {
                return Err(RenderError::InvalidWeights(format!(
                    "layer {i}: expected {cin} -> {cout} channels, got {} -> {}",
                    layer.in_channels, layer.out_channels
                )));
            }
            if layer.weights.len() != cin * cout * 9 || layer.biases.len() != cout {
                return Err(RenderError::InvalidWeights(format!(
                    "layer {i}: {} weights and {} biases for {cin} -> {cout}",
                    layer.weights.len(),
                    layer.biases.len()
                )));
            }
        }
        Ok(())
    }
}

/// Interleaved feature map.
#[derive(Clone, Debug, Default)]
struct Tensor {
    w: u32,
    h: u32,
    c: usize,
    data: Vec<f32>,
}

impl Tensor {
    fn new(w: u32, h: u32, c: usize) -> Self {
        Self {
            w,
            h,
            c,
            data: vec![0.0; w as usize * h as usize * c],
        }
    }

    /// Zero outside the map.
    #[inline]
    fn get(&self, x: i64, y: i64, ch: usize) -> f32 {
        if x < 0 || y < 0 || x >= i64::from(self.w) || y >= i64::from(self.h) {
            return 0.0;
        }
        self.data[(y as usize * self.w as usize + x as usize) * self.c + ch]
    }

    /// Store `values` (rect-sized, interleaved) into `rect`.
    fn store(&mut self, rect: &Rect, values: &[f32]) {
        let c = self.c;
        for (row, y) in values.chunks_exact(rect.w as usize * c).zip(rect.y..) {
            let start = (y as usize * self.w as usize + rect.x as usize) * c;
            self.data[start..start + row.len()].copy_from_slice(row);
        }
    }
}

/// What a convolution reads from.
enum Source<'a> {
    Plain(&'a Tensor),
    /// Nearest-upsampled `up` followed by the channels of `skip`.
    Concat { up: &'a Tensor, skip: &'a Tensor },
}

impl Source<'_> {
    #[inline]
    fn fetch(&self, x: i64, y: i64, ch: usize) -> f32 {
        match self {
            Source::Plain(t) => t.get(x, y, ch),
            Source::Concat { up, skip } => {
                if x < 0 || y < 0 || x >= i64::from(skip.w) || y >= i64::from(skip.h) {
                    0.0
                } else if ch < up.c {
                    up.get(x / 2, y / 2, ch)
                } else {
                    skip.get(x, y, ch - up.c)
                }
            }
        }
    }
}

fn conv_at(layer: &ConvLayer, src: &Source<'_>, x: i64, y: i64, relu: bool, out: &mut [f32]) {
    for (oc, o) in out.iter_mut().enumerate() {
        let mut sum = layer.biases[oc];
        for ic in 0..layer.in_channels {
            for ky in 0..3 {
                for kx in 0..3 {
                    sum += layer.weight(oc, ic, ky, kx) * src.fetch(x + kx as i64 - 1, y + ky as i64 - 1, ic);
                }
            }
        }
        *o = if relu { sum.max(0.0) } else { sum };
    }
}

/// The half-resolution rect covering a full-resolution one.
fn half_rect(rect: &Rect) -> Rect {
    let x0 = rect.x / 2;
    let y0 = rect.y / 2;
    let x1 = (rect.x + rect.w).div_ceil(2);
    let y1 = (rect.y + rect.h).div_ceil(2);
    Rect::new(x0, y0, x1 - x0, y1 - y0)
}

/// Learned filter with its intermediate buffers.
#[derive(Clone, Debug)]
pub struct UNet {
    weights: UNetWeights,
    w: u32,
    h: u32,
    tensors: Vec<Tensor>,
}

impl UNet {
    pub fn new(weights: UNetWeights) -> RenderResult<Self> {
        weights.validate()?;
        Ok(Self {
            weights,
            w: 0,
            h: 0,
            tensors: vec![Tensor::default(); SLOT_COUNT],
        })
    }

    pub fn weights(&self) -> &UNetWeights {
        &self.weights
    }

    /// Read and write slots of every pass.
    pub fn pass_access() -> [PassAccess; PASS_COUNT] {
        let pass = |reads: &[Slot], writes| PassAccess {
            reads: reads.to_vec(),
            writes,
        };
        [
            pass(&[SLOT_INPUT], SLOT_ENC),
            pass(&[SLOT_ENC], SLOT_DOWN),
            pass(&[SLOT_DOWN], SLOT_BOTT),
            pass(&[SLOT_BOTT], SLOT_DOWN),
            pass(&[SLOT_DOWN, SLOT_ENC], SLOT_UP),
            pass(&[SLOT_UP], SLOT_OUTPUT),
        ]
    }

    /// Reallocate the feature maps for a `w x h` frame.
    pub fn resize(&mut self, w: u32, h: u32) {
        if (self.w, self.h) == (w, h) {
            return;
        }
        let (hw, hh) = (w.div_ceil(2), h.div_ceil(2));
        let c1 = self.weights.enc_channels();
        let c2 = self.weights.bottleneck_channels();
        self.w = w;
        self.h = h;
        self.tensors = vec![
            Tensor::new(w, h, INPUT_CHANNELS),
            Tensor::new(w, h, c1),
            Tensor::new(hw, hh, c2),
            Tensor::new(hw, hh, c2),
            Tensor::new(w, h, c1),
            Tensor::new(w, h, OUTPUT_CHANNELS),
        ];
    }

    /// Fill the input features of `rect` from the accumulated frame.
    pub fn prepare_input(&mut self, frame: &Frame, rect: &Rect) {
        self.resize(frame.w(), frame.h());
        let rect = rect.resolve(frame.w(), frame.h());
        let input = &mut self.tensors[SLOT_INPUT as usize];
        let w = frame.w() as usize;
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                let i = y as usize * w + x as usize;
                let color = reversible_tonemap(frame.clean.pixels()[i].truncate());
                let base = frame.base_color.as_ref().map_or(Vec3::ZERO, |fb| fb.pixels()[i].truncate());
                let normal = frame.depth_normals.as_ref().map_or(Vec3::ZERO, |fb| fb.pixels()[i].truncate());
                let o = i * INPUT_CHANNELS;
                input.data[o..o + 3].copy_from_slice(&color.to_array());
                input.data[o + 3..o + 6].copy_from_slice(&base.to_array());
                input.data[o + 6..o + 9].copy_from_slice(&normal.to_array());
            }
        }
    }

    /// Output rect of `pass` for the full-resolution tile `tile`.
    fn output_rect(pass: usize, tile: &Rect) -> Rect {
        match pass {
            1..=3 => half_rect(tile),
            _ => *tile,
        }
    }

    /// Evaluate `pass` over `tile` without writing anything.
    fn compute(&self, pass: usize, tile: &Rect) -> Vec<f32> {
        let layer = &self.weights.layers[pass];
        let t = |slot: Slot| &self.tensors[slot as usize];
        let out_rect = Self::output_rect(pass, tile);
        let c = layer.out_channels;
        let mut values = vec![0.0; out_rect.area() * c];
        let relu = pass + 1 < PASS_COUNT;

        let src = match pass {
            0 => Source::Plain(t(SLOT_INPUT)),
            1 => Source::Plain(t(SLOT_ENC)),
            2 => Source::Plain(t(SLOT_DOWN)),
            3 => Source::Plain(t(SLOT_BOTT)),
            4 => Source::Concat {
                up: t(SLOT_DOWN),
                skip: t(SLOT_ENC),
            },
            _ => Source::Plain(t(SLOT_UP)),
        };

        let mut scratch = vec![0.0; c];
        for (i, out) in values.chunks_exact_mut(c).enumerate() {
            let x = i64::from(out_rect.x) + (i % out_rect.w as usize) as i64;
            let y = i64::from(out_rect.y) + (i / out_rect.w as usize) as i64;
            if pass == 1 {
                // Max pool over the full-resolution 2x2 block
                out.fill(f32::MIN);
                for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                    let (fx, fy) = (x * 2 + dx, y * 2 + dy);
                    if fx >= i64::from(self.w) || fy >= i64::from(self.h) {
                        continue;
                    }
                    conv_at(layer, &src, fx, fy, relu, &mut scratch);
                    for (o, s) in out.iter_mut().zip(&scratch) {
                        *o = o.max(*s);
                    }
                }
            } else {
                conv_at(layer, &src, x, y, relu, out);
            }
        }
        values
    }

    fn store(&mut self, pass: usize, tile: &Rect, values: &[f32]) {
        let slot = Self::pass_access()[pass].writes;
        self.tensors[slot as usize].store(&Self::output_rect(pass, tile), values);
    }

    /// Run a single pass over one tile. The caller orders the calls.
    pub fn run_pass(&mut self, pass: usize, tile: &Rect) {
        if pass >= PASS_COUNT || self.w == 0 {
            return;
        }
        let tile = tile.resolve(self.w, self.h);
        let values = self.compute(pass, &tile);
        self.store(pass, &tile, &values);
    }

    /// Run every pass over `tiles` in dependency order, one level at a time.
    pub fn run_all(&mut self, frame: &Frame, tiles: &[Rect]) {
        let full = Rect::new(0, 0, frame.w(), frame.h());
        self.prepare_input(frame, &full);
        let tiles: Vec<Rect> = if tiles.is_empty() {
            vec![full]
        } else {
            tiles.iter().map(|t| t.resolve(frame.w(), frame.h())).collect()
        };

        let graph = TaskGraph::for_tiled_passes(&Self::pass_access(), &tiles);
        let Some(levels) = graph.levels() else {
            log::error!("Denoise task graph has a cycle");
            return;
        };
        log::debug!("Running {} denoise tasks in {} levels", graph.len(), levels.len());

        for level in levels {
            let results: Vec<(usize, Rect, Vec<f32>)> = level
                .par_iter()
                .map(|&id| {
                    let task = graph.task(id);
                    let tile = tiles[task.tile];
                    (task.pass, tile, self.compute(task.pass, &tile))
                })
                .collect();
            for (pass, tile, values) in results {
                self.store(pass, &tile, &values);
            }
        }
    }

    /// Linear output color of pixel `(x, y)`.
    pub fn output(&self, x: u32, y: u32) -> Vec3 {
        let t = &self.tensors[SLOT_OUTPUT as usize];
        let c = |ch| t.get(i64::from(x), i64::from(y), ch);
        reversible_tonemap_invert(Vec3::new(c(0), c(1), c(2)).max(Vec3::ZERO))
    }

    /// Write the output of `rect` into the frame's filtered and display buffers.
    pub fn write_output(&self, frame: &mut Frame, rect: &Rect) {
        let rect = rect.resolve(frame.w(), frame.h());
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                let alpha = frame.clean.pixel(x, y).w;
                frame.filtered.set_pixel(x, y, self.output(x, y).extend(alpha));
            }
        }
        super::refresh_display(frame, &rect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ray_math::Vec4;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn layer(cin: usize, cout: usize, f: impl Fn(usize, usize, usize, usize) -> f32) -> ConvLayer {
        let mut weights = Vec::with_capacity(cin * cout * 9);
        for oc in 0..cout {
            for ic in 0..cin {
                for ky in 0..3 {
                    for kx in 0..3 {
                        weights.push(f(oc, ic, ky, kx));
                    }
                }
            }
        }
        ConvLayer {
            in_channels: cin,
            out_channels: cout,
            weights,
            biases: vec![0.0; cout],
        }
    }

    /// Centre tap copying input channel `offset + oc` to output `oc`.
    fn pick(offset: usize) -> impl Fn(usize, usize, usize, usize) -> f32 {
        move |oc, ic, ky, kx| if ic == offset + oc && ky == 1 && kx == 1 { 1.0 } else { 0.0 }
    }

    /// Color flows through the skip connection; the bottleneck contributes nothing.
    fn passthrough_weights() -> UNetWeights {
        UNetWeights {
            layers: vec![
                layer(9, 3, pick(0)),
                layer(3, 4, |_, _, _, _| 0.0),
                layer(4, 4, |_, _, _, _| 0.0),
                layer(4, 4, |_, _, _, _| 0.0),
                layer(7, 3, pick(4)),
                layer(3, 3, pick(0)),
            ],
        }
    }

    fn random_weights(seed: u64) -> UNetWeights {
        let mut rng = StdRng::seed_from_u64(seed);
        let shapes = [(9, 4), (4, 5), (5, 5), (5, 5), (9, 4), (4, 3)];
        UNetWeights {
            layers: shapes
                .iter()
                .map(|&(cin, cout)| {
                    let mut l = layer(cin, cout, |_, _, _, _| 0.0);
                    l.weights.iter_mut().for_each(|w| *w = rng.gen_range(-0.3..0.3));
                    l.biases.iter_mut().for_each(|b| *b = rng.gen_range(0.0..0.1));
                    l
                })
                .collect(),
        }
    }

    fn test_frame(w: u32, h: u32, seed: u64) -> Frame {
        let mut frame = Frame::new(w, h);
        let mut rng = StdRng::seed_from_u64(seed);
        for p in frame.clean.pixels_mut() {
            *p = Vec4::new(rng.gen_range(0.0..3.0), rng.gen_range(0.0..3.0), rng.gen_range(0.0..3.0), 1.0);
        }
        frame
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        assert!(passthrough_weights().validate().is_ok());

        let mut w = passthrough_weights();
        w.layers.pop();
        assert!(matches!(w.validate(), Err(RenderError::InvalidWeights(_))));

        let mut w = passthrough_weights();
        w.layers[2].biases.push(0.0);
        assert!(matches!(w.validate(), Err(RenderError::InvalidWeights(_))));

        let mut w = passthrough_weights();
        w.layers[4].in_channels = 6;
        assert!(UNet::new(w).is_err());
    }

    #[test]
    fn test_passthrough_reproduces_input() {
        let frame = test_frame(6, 5, 3);
        let mut unet = UNet::new(passthrough_weights()).unwrap();
        unet.run_all(&frame, &[]);
        for y in 0..5 {
            for x in 0..6 {
                let expected = frame.clean.pixel(x, y).truncate();
                assert!((unet.output(x, y) - expected).length() < 1e-3, "pixel {x},{y}");
            }
        }
    }

    #[test]
    fn test_tiled_schedule_matches_single_tile() {
        let frame = test_frame(8, 8, 9);
        let tiles: Vec<Rect> = (0..2)
            .flat_map(|y| (0..2).map(move |x| Rect::new(x * 4, y * 4, 4, 4)))
            .collect();

        let mut whole = UNet::new(random_weights(1)).unwrap();
        whole.run_all(&frame, &[]);
        let mut tiled = UNet::new(random_weights(1)).unwrap();
        tiled.run_all(&frame, &tiles);

        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(whole.output(x, y), tiled.output(x, y), "pixel {x},{y}");
            }
        }
    }

    #[test]
    fn test_manual_pass_order_matches_graph() {
        let frame = test_frame(4, 4, 2);
        let mut graph_run = UNet::new(random_weights(5)).unwrap();
        graph_run.run_all(&frame, &[]);

        let mut manual = UNet::new(random_weights(5)).unwrap();
        let full = Rect::new(0, 0, 4, 4);
        manual.prepare_input(&frame, &full);
        for pass in 0..PASS_COUNT {
            manual.run_pass(pass, &full);
        }
        assert_eq!(graph_run.output(1, 2), manual.output(1, 2));
    }

    #[test]
    fn test_write_output_leaves_clean_untouched() {
        let mut frame = test_frame(4, 4, 7);
        let clean = frame.clean.clone();
        let mut unet = UNet::new(passthrough_weights()).unwrap();
        unet.run_all(&frame, &[]);
        unet.write_output(&mut frame, &Rect::default());
        assert_eq!(frame.clean, clean);
        let d = frame.filtered.pixel(2, 1) - clean.pixel(2, 1);
        assert!(d.truncate().length() < 1e-3);
    }
}
