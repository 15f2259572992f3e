pub use super::*;

#[derive(Config, Copy, Debug, PartialEq)]
pub struct RefinerConfig {
    /// The statistics sum the per-pixel absolute gradients instead of
    /// the gradient of the whole view.
    #[config(default = "true")]
    pub abs_grad_densification: bool,

    #[config(default = "DensifyOptions::new().with_threshold_position_2d_grad_norm(8e-4)")]
    pub densify: DensifyOptions,

    /// Densifying and resetting opacities stop at this iteration.
    /// Pruning continues with [`RefinerConfig::threshold_opacity_post`].
    #[config(default = "10000")]
    pub densify_until: u64,

    /// The opacity bound of the periodic opacity reset.
    #[config(default = "0.01")]
    pub opacity_reset_max: f32,

    #[config(default = "PruneOptions::new()")]
    pub prune: PruneOptions,

    #[config(default = "RangeOptions::new(500, 15000, 100)")]
    pub range_refinement: RangeOptions,

    #[config(default = "RangeOptions::new(3000, 15000, 3000)")]
    pub range_resetting_opacity: RangeOptions,

    /// The opacity threshold of pruning after densification.
    #[config(default = "0.1")]
    pub threshold_opacity_post: f32,
}

impl Gaussian3dTrainer {
    /// Accumulating the 2D positional gradient norms of the visible splats.
    pub fn accumulate(
        &mut self,
        positions_2d_grad_norm: &[(usize, f32)],
    ) -> &mut Self {
        positions_2d_grad_norm.iter().for_each(|(slot, norm)| {
            self.statistics.accumulate(*slot, *norm);
        });
        self
    }

    /// Densifying, pruning and resetting opacities on their schedules.
    ///
    /// From [`RefinerConfig::densify_until`] on, only pruning runs.
    /// The optimizer state and statistics of every touched slot are reset.
    pub fn refine(
        &mut self,
        scene: &mut Gaussian3dScene,
    ) -> RefineReport {
        let config = self.config.refiner;
        let is_densifying = self.iteration < config.densify_until;
        let mut report = RefineReport::default();

        if config.range_refinement.has(self.iteration) {
            let prune = if is_densifying {
                report.merge(scene.densify(&self.statistics, &config.densify, &mut self.rng));
                config.prune
            } else {
                config.prune.with_threshold_opacity(config.threshold_opacity_post)
            };
            report.merge(scene.prune(&prune));
            self.statistics.reset();

            #[cfg(all(debug_assertions, not(test)))]
            log::debug!(
                target: "aquasplat::trainer::train::refine",
                "Gaussian3dTrainer::refine > point_count ({}) +{} ~{} -{}",
                scene.point_count(),
                report.inserted.len(),
                report.overwritten.len(),
                report.removed.len(),
            );
        }

        let slots = report.slots_to_reset().collect::<Vec<_>>();
        let slot_count = scene.slot_count();
        self.statistics.resize(slot_count).reset_slots(&slots);
        [
            &mut self.optimizer.adam_colors_sh,
            &mut self.optimizer.adam_log_scalings,
            &mut self.optimizer.adam_opacity_logits,
            &mut self.optimizer.adam_positions,
            &mut self.optimizer.adam_rotations,
        ]
        .into_iter()
        .for_each(|adam| {
            adam.resize(slot_count);
        });
        self.optimizer.reset_slots(&slots);

        if is_densifying && config.range_resetting_opacity.has(self.iteration) {
            let slots = scene.reset_opacities(config.opacity_reset_max);
            self.optimizer
                .adam_opacity_logits
                .reset_slots(slots.iter().copied());

            #[cfg(all(debug_assertions, not(test)))]
            log::debug!(
                target: "aquasplat::trainer::train::refine",
                "Gaussian3dTrainer::refine > reset_opacities ({})",
                slots.len(),
            );
        }

        report
    }
}

impl Default for RefinerConfig {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{Camera, Frame},
        scene::Gaussian3dPoint,
    };
    use glam::{Mat3, Vec3};

    fn trainer_of(refiner: RefinerConfig) -> Gaussian3dTrainer {
        let camera = Camera::new_centered(0, 0, 8, 8, 8.0, Mat3::IDENTITY, Vec3::ZERO);
        let frame = Frame {
            frame_id: 0,
            image: Image::filled(8, 8, [0.5; 3]),
            timestamp: 0.0,
        };
        let points = vec![Point {
            color_rgb: [0.5; 3],
            position: [0.0, 0.0, 2.0],
        }];
        let dataset = SparseViewDataset::init([camera], [frame], points).unwrap();
        Gaussian3dTrainerConfig::new()
            .with_mask_disabled(true)
            .with_refiner(refiner)
            .init(&dataset)
            .unwrap()
    }

    /// A small splat, a huge splat and a faint splat, all with large gradients.
    fn scene() -> Gaussian3dScene {
        let mut scene = Gaussian3dScene::new(0);
        [(0.001, 0.5), (12.0, 0.5), (0.001, 0.05)]
            .into_iter()
            .enumerate()
            .for_each(|(index, (scaling, opacity))| {
                scene.insert(&Gaussian3dPoint::new(
                    0,
                    [index as f32, 0.0, 2.0],
                    scaling,
                    opacity,
                    [0.5; 3],
                ));
            });
        scene
    }

    #[test]
    fn default_prunes_huge_splats() {
        let mut trainer = trainer_of(RefinerConfig::default());
        assert_eq!(trainer.config.refiner.prune.threshold_scaling, Some(10.0));

        let mut scene = scene();
        trainer.iteration = 500;
        let report = trainer.refine(&mut scene);
        assert_eq!(report.removed, [1]);
        assert!(!scene.is_alive(1));
    }

    #[test]
    fn densifies_before_switch() {
        let mut trainer = trainer_of(RefinerConfig::default());
        let mut scene = scene();
        trainer.accumulate(&[(0, 1.0), (2, 1.0)]);
        trainer.iteration = 3000;

        let report = trainer.refine(&mut scene);
        // Slot 0 is cloned, the faint slot 2 survives the low threshold.
        assert_eq!(report.inserted.len(), 2);
        assert_eq!(report.removed, [1]);
        assert!(scene.is_alive(2));
        // The opacity reset is on the same iteration.
        assert!((scene.opacity(0) - 0.01).abs() < 1e-5, "{}", scene.opacity(0));
    }

    #[test]
    fn only_prunes_after_switch() {
        let refiner = RefinerConfig::default().with_range_refinement(RangeOptions::new(500, 20000, 100));
        let mut trainer = trainer_of(refiner);
        let mut scene = scene();
        trainer.accumulate(&[(0, 1.0), (2, 1.0)]);
        trainer.iteration = 12000;

        let report = trainer.refine(&mut scene);
        assert!(report.inserted.is_empty());
        assert!(report.overwritten.is_empty());
        // The faint splat is below the threshold after densification.
        assert_eq!(report.removed, [1, 2]);
        assert_eq!(scene.point_count(), 1);
        assert!((scene.opacity(0) - 0.5).abs() < 1e-5, "{}", scene.opacity(0));
        assert_eq!(trainer.statistics.mean(0), None);
    }
}
