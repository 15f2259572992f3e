pub use burn::config::Config;

/// Iterations `start <= i < end` stepping by `step` from `start`.
#[derive(Config, Copy, Debug, PartialEq)]
pub struct RangeOptions {
    pub start: u64,
    pub end: u64,
    pub step: u64,
}

impl RangeOptions {
    #[inline]
    pub fn default_with_step(step: u64) -> Self {
        Self {
            step,
            ..Default::default()
        }
    }

    /// An empty range.
    #[inline]
    pub fn never() -> Self {
        Self::new(0, 0, 1)
    }

    pub fn has(
        &self,
        iteration: u64,
    ) -> bool {
        iteration >= self.start
            && iteration < self.end
            && (iteration - self.start) % self.step.max(1) == 0
    }
}

impl Default for RangeOptions {
    #[inline]
    fn default() -> Self {
        RangeOptions {
            start: 0,
            end: u64::MAX,
            step: 1,
        }
    }
}
