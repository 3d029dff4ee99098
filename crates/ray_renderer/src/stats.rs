//! Cumulative per-stage timings.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Microseconds spent in each pipeline stage since the last reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderStats {
    pub time_primary_ray_gen_us: u64,
    pub time_primary_trace_us: u64,
    pub time_primary_shade_us: u64,
    pub time_primary_shadow_us: u64,
    pub time_secondary_sort_us: u64,
    pub time_secondary_trace_us: u64,
    pub time_secondary_shade_us: u64,
    pub time_secondary_shadow_us: u64,
    pub time_denoise_us: u64,
    /// Render calls that produced a pass.
    pub passes: u64,
}

impl RenderStats {
    /// Add another set of timings.
    pub fn merge(&mut self, o: &RenderStats) {
        self.time_primary_ray_gen_us += o.time_primary_ray_gen_us;
        self.time_primary_trace_us += o.time_primary_trace_us;
        self.time_primary_shade_us += o.time_primary_shade_us;
        self.time_primary_shadow_us += o.time_primary_shadow_us;
        self.time_secondary_sort_us += o.time_secondary_sort_us;
        self.time_secondary_trace_us += o.time_secondary_trace_us;
        self.time_secondary_shade_us += o.time_secondary_shade_us;
        self.time_secondary_shadow_us += o.time_secondary_shadow_us;
        self.time_denoise_us += o.time_denoise_us;
        self.passes += o.passes;
    }

    pub fn total_us(&self) -> u64 {
        self.time_primary_ray_gen_us
            + self.time_primary_trace_us
            + self.time_primary_shade_us
            + self.time_primary_shadow_us
            + self.time_secondary_sort_us
            + self.time_secondary_trace_us
            + self.time_secondary_shade_us
            + self.time_secondary_shadow_us
            + self.time_denoise_us
    }
}

/// Measures consecutive stages of one call.
pub struct StageTimer {
    last: Instant,
}

impl StageTimer {
    pub fn start() -> Self {
        Self { last: Instant::now() }
    }

    /// Microseconds since the previous lap (or the start).
    pub fn lap(&mut self) -> u64 {
        let now = Instant::now();
        let us = micros(now - self.last);
        self.last = now;
        us
    }
}

#[inline]
fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_and_total() {
        let mut a = RenderStats {
            time_primary_trace_us: 10,
            passes: 1,
            ..Default::default()
        };
        let b = RenderStats {
            time_primary_trace_us: 5,
            time_denoise_us: 7,
            passes: 2,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.time_primary_trace_us, 15);
        assert_eq!(a.passes, 3);
        assert_eq!(a.total_us(), 22);
    }

    #[test]
    fn test_stage_timer_laps_are_monotonic() {
        let mut t = StageTimer::start();
        std::thread::sleep(Duration::from_millis(2));
        assert!(t.lap() >= 1000);
        assert!(t.lap() < 1_000_000);
    }
}
