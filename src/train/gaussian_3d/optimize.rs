pub use super::*;

/// The Adam state and learning rate of every parameter group.
#[derive(Clone, Debug, PartialEq)]
pub struct Gaussian3dOptimizer {
    pub adam_colors_sh: Adam,
    pub adam_log_scalings: Adam,
    pub adam_medium: Adam,
    pub adam_opacity_logits: Adam,
    pub adam_positions: Adam,
    pub adam_rotations: Adam,
    pub learning_rate_colors_sh: LearningRate,
    pub learning_rate_log_scalings: LearningRate,
    pub learning_rate_medium: LearningRate,
    pub learning_rate_opacity_logits: LearningRate,
    pub learning_rate_positions: LearningRate,
    pub learning_rate_rotations: LearningRate,
}

#[derive(Config, Copy, Debug, PartialEq)]
pub struct Gaussian3dOptimizerConfig {
    #[config(default = "AdamConfig::new().with_epsilon(1e-15)")]
    pub adam: AdamConfig,

    #[config(default = "2.5e-3.into()")]
    pub learning_rate_colors_sh: LearningRateConfig,

    #[config(default = "5e-3.into()")]
    pub learning_rate_log_scalings: LearningRateConfig,

    #[config(default = "5e-3.into()")]
    pub learning_rate_medium: LearningRateConfig,

    #[config(default = "5e-2.into()")]
    pub learning_rate_opacity_logits: LearningRateConfig,

    #[config(
        default = "LearningRateConfig::new(1.6e-4).with_end(1.6e-6).with_count(30000)"
    )]
    pub learning_rate_positions: LearningRateConfig,

    #[config(default = "1e-3.into()")]
    pub learning_rate_rotations: LearningRateConfig,
}

#[derive(Clone, Debug, Record)]
pub struct Gaussian3dOptimizerRecord {
    pub adam_colors_sh: AdamRecord,
    pub adam_log_scalings: AdamRecord,
    pub adam_medium: AdamRecord,
    pub adam_opacity_logits: AdamRecord,
    pub adam_positions: AdamRecord,
    pub adam_rotations: AdamRecord,
    pub learning_rate_colors_sh: LearningRateRecord,
    pub learning_rate_log_scalings: LearningRateRecord,
    pub learning_rate_medium: LearningRateRecord,
    pub learning_rate_opacity_logits: LearningRateRecord,
    pub learning_rate_positions: LearningRateRecord,
    pub learning_rate_rotations: LearningRateRecord,
}

/// The medium parameters are optimized as three slots of three channels.
const MEDIUM_SLOTS: [bool; 3] = [true; 3];

impl Gaussian3dOptimizerConfig {
    pub fn init(
        &self,
        colors_sh_stride: usize,
    ) -> Gaussian3dOptimizer {
        Gaussian3dOptimizer {
            adam_colors_sh: self.adam.init(colors_sh_stride),
            adam_log_scalings: self.adam.init(3),
            adam_medium: self.adam.init(3),
            adam_opacity_logits: self.adam.init(1),
            adam_positions: self.adam.init(3),
            adam_rotations: self.adam.init(4),
            learning_rate_colors_sh: self.learning_rate_colors_sh.init(),
            learning_rate_log_scalings: self.learning_rate_log_scalings.init(),
            learning_rate_medium: self.learning_rate_medium.init(),
            learning_rate_opacity_logits: self.learning_rate_opacity_logits.init(),
            learning_rate_positions: self.learning_rate_positions.init(),
            learning_rate_rotations: self.learning_rate_rotations.init(),
        }
    }
}

impl Gaussian3dOptimizer {
    /// Committing the gradients of one step to every parameter of the scene.
    pub fn update(
        &mut self,
        scene: &mut UnderwaterScene,
        grads: &Gaussian3dSceneGrads,
        grads_medium: &MediumParameters,
    ) -> &mut Self {
        let gaussians = &mut scene.gaussians;
        let is_alive = gaussians.alive().to_vec();

        self.adam_colors_sh.update(
            *self.learning_rate_colors_sh,
            &mut gaussians.colors_sh,
            &grads.colors_sh,
            &is_alive,
        );
        self.adam_log_scalings.update(
            *self.learning_rate_log_scalings,
            &mut gaussians.log_scalings,
            &grads.log_scalings,
            &is_alive,
        );
        self.adam_opacity_logits.update(
            *self.learning_rate_opacity_logits,
            &mut gaussians.opacity_logits,
            &grads.opacity_logits,
            &is_alive,
        );
        self.adam_positions.update(
            *self.learning_rate_positions,
            &mut gaussians.positions,
            &grads.positions,
            &is_alive,
        );
        self.adam_rotations.update(
            *self.learning_rate_rotations,
            &mut gaussians.rotations,
            &grads.rotations,
            &is_alive,
        );

        let parameters = &mut scene.medium.parameters;
        let mut values = [
            parameters.attenuation,
            parameters.backscatter,
            parameters.backscatter_color,
        ]
        .concat();
        let grads_medium = [
            grads_medium.attenuation,
            grads_medium.backscatter,
            grads_medium.backscatter_color,
        ]
        .concat();
        self.adam_medium.update(
            *self.learning_rate_medium,
            &mut values,
            &grads_medium,
            &MEDIUM_SLOTS,
        );
        parameters.attenuation = [values[0], values[1], values[2]];
        parameters.backscatter = [values[3], values[4], values[5]];
        parameters.backscatter_color = [values[6], values[7], values[8]];

        // Updating the learning rates

        self.learning_rate_positions.update();

        #[cfg(all(debug_assertions, not(test)))]
        log::debug!(
            target: "aquasplat::trainer::train::optimize",
            "Gaussian3dOptimizer::update > learning_rate_positions ({:.4e})",
            *self.learning_rate_positions,
        );

        self
    }

    /// Discarding the per-slot state of new, overwritten or removed splats.
    pub fn reset_slots(
        &mut self,
        slots: &[usize],
    ) -> &mut Self {
        [
            &mut self.adam_colors_sh,
            &mut self.adam_log_scalings,
            &mut self.adam_opacity_logits,
            &mut self.adam_positions,
            &mut self.adam_rotations,
        ]
        .into_iter()
        .for_each(|adam| {
            adam.reset_slots(slots.iter().copied());
        });
        self
    }

    pub fn load_record(
        &mut self,
        record: Gaussian3dOptimizerRecord,
    ) -> &mut Self {
        self.adam_colors_sh.load_record(record.adam_colors_sh);
        self.adam_log_scalings.load_record(record.adam_log_scalings);
        self.adam_medium.load_record(record.adam_medium);
        self.adam_opacity_logits.load_record(record.adam_opacity_logits);
        self.adam_positions.load_record(record.adam_positions);
        self.adam_rotations.load_record(record.adam_rotations);
        self.learning_rate_colors_sh.load_record(record.learning_rate_colors_sh);
        self.learning_rate_log_scalings
            .load_record(record.learning_rate_log_scalings);
        self.learning_rate_medium.load_record(record.learning_rate_medium);
        self.learning_rate_opacity_logits
            .load_record(record.learning_rate_opacity_logits);
        self.learning_rate_positions.load_record(record.learning_rate_positions);
        self.learning_rate_rotations.load_record(record.learning_rate_rotations);
        self
    }

    pub fn into_record(self) -> Gaussian3dOptimizerRecord {
        Gaussian3dOptimizerRecord {
            adam_colors_sh: self.adam_colors_sh.into_record(),
            adam_log_scalings: self.adam_log_scalings.into_record(),
            adam_medium: self.adam_medium.into_record(),
            adam_opacity_logits: self.adam_opacity_logits.into_record(),
            adam_positions: self.adam_positions.into_record(),
            adam_rotations: self.adam_rotations.into_record(),
            learning_rate_colors_sh: self.learning_rate_colors_sh.into_record(),
            learning_rate_log_scalings: self.learning_rate_log_scalings.into_record(),
            learning_rate_medium: self.learning_rate_medium.into_record(),
            learning_rate_opacity_logits: self.learning_rate_opacity_logits.into_record(),
            learning_rate_positions: self.learning_rate_positions.into_record(),
            learning_rate_rotations: self.learning_rate_rotations.into_record(),
        }
    }
}

impl Default for Gaussian3dOptimizerConfig {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn update_moves_alive_slots_only() {
        use super::*;

        let mut scene = UnderwaterScene {
            gaussians: Gaussian3dSceneConfig::new()
                .with_colors_sh_degree_max(0)
                .init(&[Point::default(), Point::default()])
                .unwrap(),
            medium: MediumConfig::new().init(),
        };
        scene.gaussians.remove(1);
        let target = scene.to_owned();

        let mut optimizer = Gaussian3dOptimizerConfig::new().init(3);
        let mut grads = Gaussian3dSceneGrads::zeros(2, scene.gaussians.colors_sh_stride());
        grads.positions.fill(1.0);
        let grads_medium = MediumParameters {
            attenuation: [1.0, 0.0, -1.0],
            ..Default::default()
        };

        optimizer.update(&mut scene, &grads, &grads_medium);

        let position = scene.gaussians.position(0);
        let position_target = target.gaussians.position(0);
        assert!(position.cmplt(position_target).all());
        assert_eq!(
            scene.gaussians.positions[3..],
            target.gaussians.positions[3..]
        );
        assert_eq!(scene.gaussians.colors_sh, target.gaussians.colors_sh);

        let attenuation = scene.medium.parameters.attenuation;
        let attenuation_target = target.medium.parameters.attenuation;
        assert!(attenuation[0] < attenuation_target[0]);
        assert_eq!(attenuation[1], attenuation_target[1]);
        assert!(attenuation[2] > attenuation_target[2]);
        assert_eq!(
            scene.medium.parameters.backscatter,
            target.medium.parameters.backscatter
        );

        assert!(*optimizer.learning_rate_positions < 1.6e-4);
    }

    #[test]
    fn record_round_trip() {
        use super::*;

        let mut optimizer = Gaussian3dOptimizerConfig::new().init(3);
        let mut values = vec![0.0; 6];
        optimizer
            .adam_positions
            .update(1e-2, &mut values, &[1.0; 6], &[true, true]);
        optimizer.learning_rate_positions.update();

        let mut output = Gaussian3dOptimizerConfig::new().init(3);
        output.load_record(optimizer.to_owned().into_record());
        assert_eq!(output, optimizer);
    }
}
