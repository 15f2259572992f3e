pub use burn::{config::Config, record::Record};

use std::ops::Deref;

/// A learning rate decayed log-linearly from `start` to `end` over `count` updates.
#[derive(Clone, Debug, PartialEq)]
pub struct LearningRate {
    pub config: LearningRateConfig,
    pub record: LearningRateRecord,
}

#[derive(Config, Copy, Debug, PartialEq)]
pub struct LearningRateConfig {
    /// The count of updates to reach `end`, or `0` to stay constant.
    #[config(default = "0")]
    pub count: u64,

    /// The final value, or `0.0` to stay constant.
    #[config(default = "0.0")]
    pub end: f64,

    pub start: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Record)]
pub struct LearningRateRecord {
    pub current: f64,
    pub step: u64,
}

impl LearningRateConfig {
    pub fn init(&self) -> LearningRate {
        LearningRate {
            config: *self,
            record: LearningRateRecord {
                current: self.start,
                step: 0,
            },
        }
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        self.count == 0 || self.end <= 0.0 || self.start <= 0.0
    }

    /// The value after `step` updates.
    ///
    /// `exp((1 - r) * ln(start) + r * ln(end))`, `r = min(step / count, 1)`
    pub fn at(
        &self,
        step: u64,
    ) -> f64 {
        if self.is_constant() {
            return self.start;
        }

        let ratio = (step as f64 / self.count as f64).min(1.0);
        (self.start.ln() * (1.0 - ratio) + self.end.ln() * ratio).exp()
    }
}

impl LearningRate {
    pub fn update(&mut self) -> &mut Self {
        self.record.step += 1;
        self.record.current = self.config.at(self.record.step);
        self
    }

    #[inline]
    pub fn load_record(
        &mut self,
        record: LearningRateRecord,
    ) -> &mut Self {
        self.record = record;
        self
    }

    #[inline]
    pub fn into_record(self) -> LearningRateRecord {
        self.record
    }
}

impl Default for LearningRate {
    #[inline]
    fn default() -> Self {
        LearningRateConfig::default().init()
    }
}

impl Default for LearningRateConfig {
    #[inline]
    fn default() -> Self {
        Self::new(1e-3)
    }
}

impl Deref for LearningRate {
    type Target = f64;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.record.current
    }
}

impl From<f64> for LearningRateConfig {
    #[inline]
    fn from(start: f64) -> Self {
        Self::new(start)
    }
}
