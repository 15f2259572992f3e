//! Adam with one moment pair and one time step per slot.
//!
//! ## Notice
//!
//! The update rule was adapted from the [source code of Burn v0.14.0](
//! https://github.com/tracel-ai/burn/blob/v0.14.0/crates/burn-core/src/optim/adam.rs).
//!
//! ## License
//!
//! MIT License
//!
//! Copyright (c) 2022 Nathaniel Simard & Burn Framework Contributors

pub use burn::{config::Config, record::Record};

use rayon::{
    iter::{IndexedParallelIterator, IntoParallelRefMutIterator, ParallelIterator},
    slice::{ParallelSlice, ParallelSliceMut},
};
use std::fmt;

/// Adam optimizer as described in the paper:
/// ["Adam: A Method for Stochastic Optimization"](https://arxiv.org/pdf/1412.6980.pdf).
///
/// The parameters of a slot are `stride` consecutive values. Each slot owns
/// its moments and time step, so that a new or removed slot can be reset
/// without disturbing the others.
#[derive(Clone, PartialEq)]
pub struct Adam {
    pub config: AdamConfig,
    pub record: AdamRecord,
}

#[derive(Config, Copy, Debug, PartialEq)]
pub struct AdamConfig {
    /// The coefficient used for computing running average of gradient.
    #[config(default = "0.9")]
    pub beta_1: f64,

    /// The coefficient used for computing running average of squared gradient.
    #[config(default = "0.999")]
    pub beta_2: f64,

    /// A value added to the denominator to improve numerical stability.
    #[config(default = "1e-15")]
    pub epsilon: f64,

    /// L2 penalty.
    pub weight_decay: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Record)]
pub struct AdamRecord {
    /// `[S * stride]`
    pub moment_1: Vec<f32>,
    /// `[S * stride]`
    pub moment_2: Vec<f32>,
    pub stride: u32,
    /// `[S]`
    pub time: Vec<u32>,
}

impl AdamConfig {
    pub fn init(
        self,
        stride: usize,
    ) -> Adam {
        Adam {
            config: self,
            record: AdamRecord {
                stride: stride as u32,
                ..Default::default()
            },
        }
    }
}

impl Adam {
    #[inline]
    pub fn stride(&self) -> usize {
        self.record.stride as usize
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.record.time.len()
    }

    /// Growing the state with zeroed slots, never shrinking it.
    pub fn resize(
        &mut self,
        slot_count: usize,
    ) -> &mut Self {
        if slot_count > self.slot_count() {
            let stride = self.stride();
            self.record.moment_1.resize(slot_count * stride, 0.0);
            self.record.moment_2.resize(slot_count * stride, 0.0);
            self.record.time.resize(slot_count, 0);
        }
        self
    }

    /// Discarding the state of the slots, e.g. after densification or pruning.
    pub fn reset_slots(
        &mut self,
        slots: impl IntoIterator<Item = usize>,
    ) -> &mut Self {
        let stride = self.stride();
        slots.into_iter().for_each(|slot| {
            if slot < self.slot_count() {
                self.record.moment_1[slot * stride..(slot + 1) * stride].fill(0.0);
                self.record.moment_2[slot * stride..(slot + 1) * stride].fill(0.0);
                self.record.time[slot] = 0;
            }
        });
        self
    }

    /// Updating the values of the selected slots in place.
    ///
    /// ## Arguments
    ///
    /// * `learning_rate` - The number to multiply the gradient by.
    /// * `values` - `[S * stride]`
    /// * `grads` - `[S * stride]`
    /// * `is_selected` - `[S]`, other slots are left untouched.
    pub fn update(
        &mut self,
        learning_rate: f64,
        values: &mut [f32],
        grads: &[f32],
        is_selected: &[bool],
    ) -> &mut Self {
        let stride = self.stride();
        let slot_count = values.len() / stride.max(1);
        self.resize(slot_count);

        let AdamConfig {
            beta_1,
            beta_2,
            epsilon,
            weight_decay,
        } = self.config;

        values
            .par_chunks_mut(stride)
            .zip(grads.par_chunks(stride))
            .zip(self.record.moment_1.par_chunks_mut(stride))
            .zip(self.record.moment_2.par_chunks_mut(stride))
            .zip(self.record.time.par_iter_mut())
            .enumerate()
            .filter(|(slot, _)| is_selected.get(*slot).copied().unwrap_or(false))
            .for_each(|(_, ((((values, grads), moment_1), moment_2), time))| {
                *time += 1;
                let time = *time as i32;
                let correction_1 = 1.0 - beta_1.powi(time);
                let correction_2 = 1.0 - beta_2.powi(time);

                (0..stride).for_each(|i| {
                    let value = values[i] as f64;
                    let mut grad = grads[i] as f64;
                    if let Some(weight_decay) = weight_decay {
                        grad += value * weight_decay;
                    }

                    let m_1 = grad * (1.0 - beta_1) + moment_1[i] as f64 * beta_1;
                    let m_2 = grad * grad * (1.0 - beta_2) + moment_2[i] as f64 * beta_2;
                    moment_1[i] = m_1 as f32;
                    moment_2[i] = m_2 as f32;

                    let m_1_corrected = m_1 / correction_1;
                    let m_2_corrected = m_2 / correction_2;
                    let step = m_1_corrected / (m_2_corrected.sqrt() + epsilon);
                    values[i] = (value - step * learning_rate) as f32;
                });
            });

        self
    }

    #[inline]
    pub fn load_record(
        &mut self,
        record: AdamRecord,
    ) -> &mut Self {
        self.record = record;
        self
    }

    #[inline]
    pub fn into_record(self) -> AdamRecord {
        self.record
    }
}

impl fmt::Debug for Adam {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Adam")
            .field("config", &self.config)
            .field("record.stride", &self.record.stride)
            .field("record.time.len()", &self.record.time.len())
            .finish()
    }
}

impl Default for AdamConfig {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn first_step_moves_by_learning_rate() {
        use super::*;

        let mut optimizer = AdamConfig::new().init(2);
        let mut values = vec![1.0, -1.0, 0.5, 0.5];
        let grads = vec![3.0, -0.2, 0.0, 0.0];

        optimizer.update(0.1, &mut values, &grads, &[true, true]);

        // The bias-corrected step is the sign of the gradient.
        assert!((values[0] - 0.9).abs() < 1e-6, "{}", values[0]);
        assert!((values[1] - -0.9).abs() < 1e-6, "{}", values[1]);
        assert_eq!(&values[2..], &[0.5, 0.5]);
        assert_eq!(optimizer.record.time, vec![1, 1]);
    }

    #[test]
    fn with_numbers() {
        use super::*;

        let config = AdamConfig::new()
            .with_epsilon(1e-8)
            .with_weight_decay(Some(0.5));
        let mut optimizer = config.init(1);
        let mut values = vec![-0.3206_f32];

        // Two steps computed by hand with the same formula in f64
        let mut target = -0.3206_f64;
        let (mut m_1, mut m_2) = (0.0_f64, 0.0_f64);
        for (time, grad) in [(1, 0.6294_f64), (2, 0.8491)] {
            let grad_decayed = grad + target * 0.5;
            m_1 = grad_decayed * 0.1 + m_1 * 0.9;
            m_2 = grad_decayed * grad_decayed * 0.001 + m_2 * 0.999;
            let step = (m_1 / (1.0 - 0.9_f64.powi(time)))
                / ((m_2 / (1.0 - 0.999_f64.powi(time))).sqrt() + 1e-8);
            target -= step * 0.01;

            optimizer.update(0.01, &mut values, &[grad as f32], &[true]);
        }

        assert!((values[0] as f64 - target).abs() < 1e-5, "{} != {target}", values[0]);
    }

    #[test]
    fn unselected_slots_are_untouched() {
        use super::*;

        let mut optimizer = AdamConfig::new().init(3);
        let mut values = vec![1.0; 6];
        let grads = vec![1.0; 6];

        optimizer.update(0.5, &mut values, &grads, &[false, true]);

        assert_eq!(&values[..3], &[1.0, 1.0, 1.0]);
        assert!(values[3..].iter().all(|v| *v < 1.0));
        assert_eq!(optimizer.record.time, vec![0, 1]);
        assert_eq!(&optimizer.record.moment_1[..3], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn reset_slots() {
        use super::*;

        let mut optimizer = AdamConfig::new().init(1);
        let mut values = vec![0.0; 3];
        optimizer.update(1e-2, &mut values, &[1.0, 1.0, 1.0], &[true; 3]);
        optimizer.update(1e-2, &mut values, &[1.0, 1.0, 1.0], &[true; 3]);
        optimizer.reset_slots([1]);

        assert_eq!(optimizer.record.time, vec![2, 0, 2]);
        assert_eq!(optimizer.record.moment_1[1], 0.0);
        assert_eq!(optimizer.record.moment_2[1], 0.0);
        assert!(optimizer.record.moment_1[0] > 0.0);

        optimizer.resize(5);
        assert_eq!(optimizer.slot_count(), 5);
        assert_eq!(optimizer.record.moment_1.len(), 5);

        optimizer.resize(2);
        assert_eq!(optimizer.slot_count(), 5);
    }

    #[test]
    fn without_nans() {
        use super::*;

        let mut optimizer = AdamConfig::new().init(4);
        let mut values = vec![0.25; 8];
        let grads = vec![0.0, 1e-20, -1e20, 1.0, 0.0, 0.0, 0.0, 0.0];

        (0..10).for_each(|_| {
            optimizer.update(1e-3, &mut values, &grads, &[true, true]);
        });

        assert!(values.iter().all(|v| v.is_finite()), "{values:?}");
    }
}
