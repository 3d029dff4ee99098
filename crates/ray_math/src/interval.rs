/// Closed parameter range `[min, max]`.
///
/// Ranges with `min > max` are empty. [`Interval::EMPTY`] is the identity
/// for [`Interval::union`] and [`Interval::grow`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub min: f32,
    pub max: f32,
}

impl Interval {
    pub const EMPTY: Interval = Interval {
        min: f32::INFINITY,
        max: f32::NEG_INFINITY,
    };

    #[inline]
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Width of the range, negative when empty.
    #[inline]
    pub fn size(&self) -> f32 {
        self.max - self.min
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    #[inline]
    pub fn contains(&self, x: f32) -> bool {
        (self.min..=self.max).contains(&x)
    }

    /// Smallest range holding both `self` and `x`.
    #[inline]
    pub fn grow(self, x: f32) -> Self {
        Self::new(self.min.min(x), self.max.max(x))
    }

    /// Smallest range holding both ranges.
    #[inline]
    pub fn union(self, other: Self) -> Self {
        Self::new(self.min.min(other.min), self.max.max(other.max))
    }

    /// Intersection of the two ranges, `None` when they are disjoint.
    #[inline]
    pub fn overlap(self, other: Self) -> Option<Self> {
        let r = Self::new(self.min.max(other.min), self.max.min(other.max));
        (!r.is_empty()).then_some(r)
    }

    /// Widen a range narrower than `width` symmetrically up to `width`.
    pub fn pad_to(self, width: f32) -> Self {
        let missing = width - self.size();
        if self.is_empty() || missing <= 0.0 {
            return self;
        }
        Self::new(self.min - missing * 0.5, self.max + missing * 0.5)
    }
}
