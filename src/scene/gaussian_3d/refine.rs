pub use super::*;

use rand::Rng;
use rand_distr::StandardNormal;

/// The factor dividing the scaling of split splats.
pub const SPLIT_SCALING_DIVISOR: f32 = 1.6;

#[derive(Config, Copy, Debug, PartialEq)]
pub struct DensifyOptions {
    /// No splat is added beyond this count.
    #[config(default = "1_000_000")]
    pub point_count_max: u64,

    /// The count of samples a large splat is split into.
    #[config(default = "2")]
    pub split_count: u32,

    /// The threshold of the mean 2D positional gradient norm.
    #[config(default = "2e-4")]
    pub threshold_position_2d_grad_norm: f32,

    /// Splats with a larger scaling are split, others are cloned.
    #[config(default = "1e-2")]
    pub threshold_scaling: f32,
}

#[derive(Config, Copy, Debug, PartialEq)]
pub struct PruneOptions {
    #[config(default = "1.4 / 255.0")]
    pub threshold_opacity: f32,

    /// The world-size bound of the largest scaling.
    #[config(default = "Some(10.0)")]
    pub threshold_scaling: Option<f32>,
}

/// The slots touched by a refinement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RefineReport {
    pub inserted: Vec<usize>,
    pub overwritten: Vec<usize>,
    pub removed: Vec<usize>,
}

/// The running sum of the 2D positional gradient norm per slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PositionGradStatistics {
    /// `[S]`
    pub counts: Vec<u32>,
    /// `[S]`
    pub sums: Vec<f32>,
}

impl Gaussian3dScene {
    /// Splitting or cloning splats with a large mean 2D positional gradient.
    ///
    /// The highest-gradient candidates are densified first. A candidate that
    /// would exceed [`DensifyOptions::point_count_max`] is passed over.
    pub fn densify(
        &mut self,
        statistics: &PositionGradStatistics,
        options: &DensifyOptions,
        rng: &mut impl Rng,
    ) -> RefineReport {
        let mut report = RefineReport::default();

        let mut candidates = self
            .slots()
            .filter_map(|slot| {
                let mean = statistics.mean(slot)?;
                (mean > options.threshold_position_2d_grad_norm).then_some((slot, mean))
            })
            .collect::<Vec<_>>();
        candidates.sort_by(|(slot_a, a), (slot_b, b)| b.total_cmp(a).then(slot_a.cmp(slot_b)));

        let mut budget = (options.point_count_max as usize).saturating_sub(self.point_count());
        let split_count = options.split_count.max(2) as usize;

        for (slot, _) in candidates {
            let scaling = self.scaling(slot);
            let is_large = scaling.max_element() > options.threshold_scaling;
            let cost = if is_large { split_count - 1 } else { 1 };
            if cost > budget {
                continue;
            }
            budget -= cost;

            let source = self.get(slot);

            if is_large {
                let rotation = self.rotation(slot);
                let log_divisor = SPLIT_SCALING_DIVISOR.ln();
                let mut samples = (0..split_count)
                    .map(|_| {
                        let offset = Vec3::new(
                            rng.sample(StandardNormal),
                            rng.sample(StandardNormal),
                            rng.sample(StandardNormal),
                        ) * scaling;
                        Gaussian3dPoint {
                            log_scaling: source.log_scaling.map(|s| s - log_divisor),
                            position: (Vec3::from(source.position) + rotation * offset)
                                .to_array(),
                            ..source.to_owned()
                        }
                    })
                    .collect::<Vec<_>>();
                let first = samples.remove(0);
                self.overwrite(slot, &first);
                report.overwritten.push(slot);
                samples
                    .iter()
                    .for_each(|point| report.inserted.push(self.insert(point)));
            } else {
                // An exact copy, separated later by its gradients
                report.inserted.push(self.insert(&source));
            }
        }

        #[cfg(all(debug_assertions, not(test)))]
        log::debug!(
            target: "aquasplat::trainer::scene::gaussian_3d::refine",
            "densify > point_count ({}) = ({}I + {}O)",
            self.point_count(),
            report.inserted.len(),
            report.overwritten.len(),
        );

        report
    }

    /// Removing transparent, oversized or non-finite splats.
    pub fn prune(
        &mut self,
        options: &PruneOptions,
    ) -> RefineReport {
        let removed = self
            .slots()
            .filter(|slot| {
                !self.is_finite(*slot)
                    || self.opacity(*slot) < options.threshold_opacity
                    || options
                        .threshold_scaling
                        .is_some_and(|t| self.scaling(*slot).max_element() > t)
            })
            .collect::<Vec<_>>();
        removed.iter().for_each(|slot| {
            self.remove(*slot);
        });

        #[cfg(all(debug_assertions, not(test)))]
        log::debug!(
            target: "aquasplat::trainer::scene::gaussian_3d::refine",
            "prune > point_count ({}) = -{}",
            self.point_count(),
            removed.len(),
        );

        RefineReport {
            removed,
            ..Default::default()
        }
    }

    /// Clamping the opacities to `opacity_max`.
    ///
    /// ## Returns
    ///
    /// The slots whose opacity changed.
    pub fn reset_opacities(
        &mut self,
        opacity_max: f32,
    ) -> Vec<usize> {
        let logit_max = logit(opacity_max);
        let slots = self
            .slots()
            .filter(|slot| self.opacity_logits[*slot] > logit_max)
            .collect::<Vec<_>>();
        slots
            .iter()
            .for_each(|slot| self.opacity_logits[*slot] = logit_max);
        slots
    }
}

impl PositionGradStatistics {
    #[inline]
    pub fn resize(
        &mut self,
        slot_count: usize,
    ) -> &mut Self {
        self.counts.resize(slot_count, 0);
        self.sums.resize(slot_count, 0.0);
        self
    }

    #[inline]
    pub fn accumulate(
        &mut self,
        slot: usize,
        norm: f32,
    ) {
        if slot >= self.counts.len() {
            self.resize(slot + 1);
        }
        self.counts[slot] += 1;
        self.sums[slot] += norm;
    }

    /// `None` if the slot has never been visible.
    #[inline]
    pub fn mean(
        &self,
        slot: usize,
    ) -> Option<f32> {
        let count = *self.counts.get(slot)?;
        (count > 0).then(|| self.sums[slot] / count as f32)
    }

    pub fn reset_slots(
        &mut self,
        slots: &[usize],
    ) {
        slots.iter().for_each(|slot| {
            if *slot < self.counts.len() {
                self.counts[*slot] = 0;
                self.sums[*slot] = 0.0;
            }
        });
    }

    pub fn reset(&mut self) {
        self.counts.fill(0);
        self.sums.fill(0.0);
    }
}

impl RefineReport {
    /// The slots whose optimizer state must be reset.
    pub fn slots_to_reset(&self) -> impl Iterator<Item = usize> + '_ {
        self.inserted
            .iter()
            .chain(&self.overwritten)
            .chain(&self.removed)
            .copied()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.overwritten.is_empty() && self.removed.is_empty()
    }

    pub fn merge(
        &mut self,
        other: Self,
    ) -> &mut Self {
        self.inserted.extend(other.inserted);
        self.overwritten.extend(other.overwritten);
        self.removed.extend(other.removed);
        self
    }
}

impl Default for DensifyOptions {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Default for PruneOptions {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
