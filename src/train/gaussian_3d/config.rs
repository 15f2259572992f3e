pub use super::*;

/// The order in which the training views are visited.
#[derive(Config, Copy, Debug, Eq, PartialEq)]
pub enum ViewOrder {
    /// A new random permutation per epoch.
    Random,
    /// Camera id order.
    RoundRobin,
}

/// The photometric error between the composite `ŷ` and the observation `y`.
#[derive(Config, Copy, Debug, Eq, PartialEq)]
pub enum LossKind {
    /// `|y - ŷ|`
    L1,
    /// `|y - ŷ| / (sg(ŷ) + ε)`
    RegularizedL1,
    /// `((y - ŷ) / (sg(ŷ) + ε)) ^ 2`
    RegularizedL2,
}

#[derive(Config, Debug, PartialEq)]
pub struct Gaussian3dTrainerConfig {
    /// Disabled by setting `start` beyond the iteration count.
    #[config(default = "RangeOptions::default_with_step(7000)")]
    pub range_checkpoint: RangeOptions,

    /// Each hit raises the rendered degree of spherical harmonics by one.
    #[config(default = "RangeOptions::new(1000, 4000, 1000)")]
    pub range_increasing_colors_sh_degree: RangeOptions,

    #[config(default = "2")]
    pub downscale_count: u32,

    /// The resolution doubles every interval until it is full.
    #[config(default = "3000")]
    pub downscale_interval: u64,

    /// More consecutive skipped steps are fatal.
    #[config(default = "100")]
    pub instability_count_max: u64,

    #[config(default = "30000")]
    pub iteration_count: u64,

    #[config(default = "LossKind::RegularizedL1")]
    pub loss: LossKind,

    #[config(default = "Gaussian3dOptimizerConfig::new()")]
    pub optimizer: Gaussian3dOptimizerConfig,

    #[config(default = "Gaussian3dRenderOptions::new()")]
    pub options_renderer: Gaussian3dRenderOptions,

    #[config(default = "FlowMaskConfig::new()")]
    pub mask: FlowMaskConfig,

    /// Skipping the transient masks, i.e. every weight is one.
    #[config(default = "false")]
    pub mask_disabled: bool,

    /// The temporal distance of the frames paired for the masks.
    #[config(default = "1")]
    pub mask_frame_offset: u32,

    #[config(default = "MediumConfig::new()")]
    pub medium: MediumConfig,

    #[config(default = "RefinerConfig::new()")]
    pub refiner: RefinerConfig,

    /// The weight of the mean opacity penalty.
    #[config(default = "0.0")]
    pub regularization_opacity: f32,

    /// The weight of the mean scaling penalty.
    #[config(default = "0.0")]
    pub regularization_scaling: f32,

    #[config(default = "Gaussian3dSceneConfig::new()")]
    pub scene: Gaussian3dSceneConfig,

    #[config(default = "0")]
    pub seed: u64,

    /// The weight `λ` of the structural term in
    /// `(1 - λ) * photometric + λ * (1 - SSIM)`.
    #[config(default = "0.2")]
    pub ssim_lambda: f32,

    #[config(default = "ViewOrder::Random")]
    pub view_order: ViewOrder,
}

impl Gaussian3dTrainerConfig {
    /// Initializing the scene from the sparse points.
    pub fn init_scene(
        &self,
        dataset: &SparseViewDataset,
    ) -> Result<UnderwaterScene, Error> {
        Ok(UnderwaterScene {
            gaussians: self.scene.init(&dataset.points)?,
            medium: self.medium.init(),
        })
    }

    /// Initializing a trainer with the transient masks of the dataset.
    pub fn init(
        &self,
        dataset: &SparseViewDataset,
    ) -> Result<Gaussian3dTrainer, Error> {
        self.validate()?;

        let masks = if self.mask_disabled {
            TransientMaskCache::default()
        } else {
            TransientMaskCache::precompute(
                dataset,
                &self.mask.init(),
                self.mask_frame_offset,
            )?
        };

        #[cfg(all(debug_assertions, not(test)))]
        log::debug!(
            target: "aquasplat::trainer::train",
            "Gaussian3dTrainerConfig::init > masks ({})",
            masks.len(),
        );

        Ok(Gaussian3dTrainer {
            colors_sh_degree: 0,
            config: self.to_owned(),
            instability_count: 0,
            iteration: 0,
            masks,
            optimizer: self
                .optimizer
                .init(sh_count(self.scene.colors_sh_degree_max) * 3),
            rng: StdRng::seed_from_u64(self.seed),
            state: TrainerState::Init,
            statistics: PositionGradStatistics::default(),
            view_queue: Vec::new(),
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.instability_count_max == 0 {
            return Err(Error::InvalidConfig(
                "instability_count_max should be positive".into(),
            ));
        }
        if self.downscale_count > 0 && self.downscale_interval == 0 {
            return Err(Error::InvalidConfig(
                "downscale_interval should be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ssim_lambda) {
            return Err(Error::InvalidConfig(
                "ssim_lambda should be within 0 and 1".into(),
            ));
        }
        [
            ("regularization_opacity", self.regularization_opacity),
            ("regularization_scaling", self.regularization_scaling),
        ]
        .into_iter()
        .try_for_each(|(name, weight)| {
            if !(weight.is_finite() && weight >= 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "{name} should be finite and non-negative"
                )));
            }
            Ok(())
        })
    }
}

impl Default for Gaussian3dTrainerConfig {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
