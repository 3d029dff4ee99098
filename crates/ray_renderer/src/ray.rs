//! Ray, shadow ray and hit records flowing between pipeline stages.

use bytemuck::{Pod, Zeroable};
use ray_math::Vec3;

/// Pixel position packed as `(x << 16) | y`.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct PixelCoord(u32);

impl PixelCoord {
    #[inline]
    pub fn new(x: u32, y: u32) -> Self {
        Self(((x & 0xffff) << 16) | (y & 0xffff))
    }

    #[inline]
    pub fn x(self) -> u32 {
        self.0 >> 16
    }

    #[inline]
    pub fn y(self) -> u32 {
        self.0 & 0xffff
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Four 8-bit bounce counters packed into one word.
///
/// Diffuse in bits 0..8, specular 8..16, refraction 16..24 and
/// transparency 24..32. Counters saturate at 255.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct RayDepth(u32);

const DIFF_SHIFT: u32 = 0;
const SPEC_SHIFT: u32 = 8;
const REFR_SHIFT: u32 = 16;
const TRANSP_SHIFT: u32 = 24;

impl RayDepth {
    pub const PRIMARY: RayDepth = RayDepth(0);

    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    fn get(self, shift: u32) -> u8 {
        ((self.0 >> shift) & 0xff) as u8
    }

    #[inline]
    fn bumped(self, shift: u32) -> Self {
        if self.get(shift) == u8::MAX {
            return self;
        }
        Self(self.0 + (1 << shift))
    }

    #[inline]
    pub fn diffuse(self) -> u8 {
        self.get(DIFF_SHIFT)
    }

    #[inline]
    pub fn specular(self) -> u8 {
        self.get(SPEC_SHIFT)
    }

    #[inline]
    pub fn refraction(self) -> u8 {
        self.get(REFR_SHIFT)
    }

    #[inline]
    pub fn transparency(self) -> u8 {
        self.get(TRANSP_SHIFT)
    }

    /// Sum of all four counters.
    #[inline]
    pub fn total(self) -> u32 {
        self.diffuse() as u32 + self.specular() as u32 + self.refraction() as u32 + self.transparency() as u32
    }

    /// Diffuse, specular and refraction bounces. Transparency hops are free.
    #[inline]
    pub fn bounce_depth(self) -> u32 {
        self.diffuse() as u32 + self.specular() as u32 + self.refraction() as u32
    }

    /// True once the path scattered off a surface (transparency excluded).
    #[inline]
    pub fn is_bounced(self) -> bool {
        self.0 & 0x00ff_ffff != 0
    }

    pub fn add_diffuse(self) -> Self {
        self.bumped(DIFF_SHIFT)
    }

    pub fn add_specular(self) -> Self {
        self.bumped(SPEC_SHIFT)
    }

    pub fn add_refraction(self) -> Self {
        self.bumped(REFR_SHIFT)
    }

    pub fn add_transparency(self) -> Self {
        self.bumped(TRANSP_SHIFT)
    }
}

/// Stack of the indices of refraction the ray is currently inside.
///
/// Empty slots hold `-1`. Pushing onto a full stack drops the oldest entry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IorStack([f32; 4]);

impl Default for IorStack {
    fn default() -> Self {
        Self([-1.0; 4])
    }
}

impl IorStack {
    pub fn push(&mut self, ior: f32) {
        if let Some(slot) = self.0.iter_mut().find(|s| **s < 0.0) {
            *slot = ior;
            return;
        }
        self.0.rotate_left(1);
        self.0[3] = ior;
    }

    /// Remove the innermost medium and return its IOR, `1` when empty.
    pub fn pop(&mut self) -> f32 {
        match self.0.iter_mut().rev().find(|s| **s > 0.0) {
            Some(slot) => std::mem::replace(slot, -1.0),
            None => 1.0,
        }
    }

    /// IOR of the innermost medium; `skip_first` looks one level further out.
    pub fn peek(&self, skip_first: bool) -> f32 {
        self.0
            .iter()
            .rev()
            .filter(|s| **s > 0.0)
            .nth(skip_first as usize)
            .copied()
            .unwrap_or(1.0)
    }

    pub fn as_array(&self) -> [f32; 4] {
        self.0
    }
}

/// A camera or continuation ray.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayData {
    pub o: Vec3,
    pub d: Vec3,
    /// Path throughput.
    pub c: Vec3,
    /// Pdf of the sampled direction, `1e6` for delta events and camera rays.
    pub pdf: f32,
    pub ior: IorStack,
    pub cone_width: f32,
    pub cone_spread: f32,
    pub xy: PixelCoord,
    pub depth: RayDepth,
}

impl Default for RayData {
    fn default() -> Self {
        Self {
            o: Vec3::ZERO,
            d: Vec3::Z,
            c: Vec3::ONE,
            pdf: 1e6,
            ior: IorStack::default(),
            cone_width: 0.0,
            cone_spread: 0.0,
            xy: PixelCoord::default(),
            depth: RayDepth::PRIMARY,
        }
    }
}

/// Deferred visibility query created by light sampling.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShadowRay {
    pub o: Vec3,
    pub d: Vec3,
    /// Distance to the light sample, [`ray_math::MAX_DIST`] for lights at infinity.
    pub dist: f32,
    /// Contribution if the light turns out to be unoccluded.
    pub c: Vec3,
    pub xy: PixelCoord,
    pub depth: RayDepth,
    /// Sampled from the environment; sky portals let it through.
    pub from_env: bool,
}

/// Closest-hit result for one ray.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HitData {
    pub mask: bool,
    /// Mesh instance index, or `-light - 1` for a directly hit light.
    pub obj_index: i32,
    pub prim_index: u32,
    pub backfacing: bool,
    pub t: f32,
    pub u: f32,
    pub v: f32,
    pub xy: PixelCoord,
}

impl HitData {
    pub fn miss(t_max: f32, xy: PixelCoord) -> Self {
        Self {
            mask: false,
            obj_index: -1,
            prim_index: u32::MAX,
            backfacing: false,
            t: t_max,
            u: 0.0,
            v: 0.0,
            xy,
        }
    }

    /// Index of the light this hit landed on.
    #[inline]
    pub fn light_index(&self) -> Option<u32> {
        (self.mask && self.obj_index < 0).then(|| (-(self.obj_index + 1)) as u32)
    }

    pub fn set_light(&mut self, light: u32, t: f32) {
        self.mask = true;
        self.obj_index = -(light as i32) - 1;
        self.prim_index = u32::MAX;
        self.backfacing = false;
        self.t = t;
        self.u = 0.0;
        self.v = 0.0;
    }

    /// Closest-hit ordering: smaller `t`, then lower primitive index.
    #[inline]
    pub fn is_closer_than(&self, t: f32, prim_index: u32) -> bool {
        self.t < t || (self.t == t && self.prim_index < prim_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_coord_packing() {
        let xy = PixelCoord::new(1234, 567);
        assert_eq!(xy.x(), 1234);
        assert_eq!(xy.y(), 567);
        assert_eq!(xy.raw(), (1234 << 16) | 567);
    }

    #[test]
    fn test_ray_depth_counters() {
        let depth = RayDepth::PRIMARY.add_diffuse().add_diffuse().add_specular().add_transparency();
        assert_eq!(depth.diffuse(), 2);
        assert_eq!(depth.specular(), 1);
        assert_eq!(depth.refraction(), 0);
        assert_eq!(depth.transparency(), 1);
        assert_eq!(depth.total(), 4);
        assert!(depth.is_bounced());
        assert!(!RayDepth::PRIMARY.add_transparency().is_bounced());
        assert_eq!(depth.bounce_depth(), 3);
        assert_eq!(RayDepth::PRIMARY.add_transparency().bounce_depth(), 0);
    }

    #[test]
    fn test_ray_depth_saturates() {
        let mut depth = RayDepth::PRIMARY;
        for _ in 0..300 {
            depth = depth.add_refraction();
        }
        assert_eq!(depth.refraction(), 255);
        assert_eq!(depth.transparency(), 0);
    }

    #[test]
    fn test_ior_stack() {
        let mut stack = IorStack::default();
        assert_eq!(stack.peek(false), 1.0);
        stack.push(1.5);
        stack.push(1.33);
        assert_eq!(stack.peek(false), 1.33);
        assert_eq!(stack.peek(true), 1.5);
        assert_eq!(stack.pop(), 1.33);
        assert_eq!(stack.pop(), 1.5);
        assert_eq!(stack.pop(), 1.0);

        for ior in [1.1, 1.2, 1.3, 1.4, 1.5] {
            stack.push(ior);
        }
        assert_eq!(stack.as_array(), [1.2, 1.3, 1.4, 1.5]);
    }

    #[test]
    fn test_hit_light_encoding() {
        let mut hit = HitData::miss(10.0, PixelCoord::new(1, 2));
        assert_eq!(hit.light_index(), None);
        hit.set_light(3, 2.5);
        assert_eq!(hit.light_index(), Some(3));
        assert_eq!(hit.t, 2.5);
    }
}
