//! The training loop of [`UnderwaterScene`].
//!
//! Each step renders one view, composites the medium, weights the
//! photometric error by the transient mask of the frame, back-propagates
//! exactly through both stages and only then commits the parameters.

pub mod checkpoint;
pub mod config;
pub mod loss;
pub mod optimize;
pub mod refine;

pub use crate::{
    dataset::{Point, SparseViewDataset, TrainingView},
    error::Error,
    function::{sh_count, Image},
    mask::{FlowMaskConfig, TransientMask, TransientMaskCache},
    optimize::{
        Adam, AdamConfig, AdamRecord, LearningRate, LearningRateConfig, LearningRateRecord,
    },
    range::RangeOptions,
    render::{Gaussian3dRenderOptions, Gaussian3dSceneGrads, RenderOutputGrads},
    scene::{
        DensifyOptions, Gaussian3dScene, Gaussian3dSceneConfig, Gaussian3dSceneRecord,
        MediumConfig, MediumParameters, PositionGradStatistics, PruneOptions, RefineReport,
        UnderwaterScene,
    },
};
pub use burn::{config::Config, record::Record};
pub use checkpoint::*;
pub use config::*;
pub use loss::*;
pub use optimize::*;
pub use rand::{rngs::StdRng, SeedableRng};
pub use refine::*;

use rand::seq::SliceRandom;
use std::{
    fmt,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

#[derive(Clone)]
pub struct Gaussian3dTrainer {
    /// The degree of spherical harmonics currently rendered.
    pub colors_sh_degree: u32,
    pub config: Gaussian3dTrainerConfig,
    /// The count of consecutive skipped steps.
    pub instability_count: u64,
    pub iteration: u64,
    pub masks: TransientMaskCache,
    pub optimizer: Gaussian3dOptimizer,
    pub rng: StdRng,
    pub state: TrainerState,
    pub statistics: PositionGradStatistics,
    view_queue: Vec<usize>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrainerState {
    Init,
    Step,
    /// The iteration count is reached.
    Converged,
    /// The stop flag was raised.
    Stopped,
}

/// The gradients of one step, computed without touching the scene.
#[derive(Clone, Debug, PartialEq)]
pub struct StepGradients {
    pub grads: Gaussian3dSceneGrads,
    pub grads_medium: MediumParameters,
    pub loss: f32,
    pub positions_2d_grad_norm: Vec<(usize, f32)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    /// The iteration of the step.
    pub iteration: u64,
    /// Whether the parameters were left unchanged.
    pub is_skipped: bool,
    pub loss: f32,
    pub point_count: usize,
    pub refine: RefineReport,
}

impl Gaussian3dTrainer {
    /// The integer factor of the current training resolution.
    pub fn downscale_factor(&self) -> u32 {
        let count = self.config.downscale_count;
        if count == 0 {
            return 1;
        }

        let doubled = (self.iteration / self.config.downscale_interval.max(1))
            .min(count as u64) as u32;
        1 << (count - doubled)
    }

    /// The transient mask of the view, or all ones if it is unknown.
    pub fn mask_of(
        &self,
        view: &TrainingView,
        factor: u32,
    ) -> TransientMask {
        let (width, height) = (view.image.width, view.image.height);
        match self.masks.get(view.camera.frame_id, factor) {
            Some(mask) if mask.width == width && mask.height == height => mask,
            Some(mask) => {
                log::warn!(
                    target: "aquasplat::trainer::train",
                    "The mask of frame {} is {}x{} against a {width}x{height} view, unmasked",
                    view.camera.frame_id,
                    mask.width,
                    mask.height,
                );
                TransientMask::filled(width, height, 1.0)
            },
            None => TransientMask::filled(width, height, 1.0),
        }
    }

    /// Rendering, compositing and back-propagating a view that has already
    /// been scaled to the training resolution.
    pub fn backward(
        &self,
        scene: &UnderwaterScene,
        view: &TrainingView,
        factor: u32,
    ) -> StepGradients {
        let options = self
            .config
            .options_renderer
            .with_colors_sh_degree(self.colors_sh_degree);

        let output = scene.gaussians.render(&view.camera, &options);
        let composited =
            scene
                .medium
                .composite(&output.direct, &output.depth, &output.transmittance);

        let mask = self.mask_of(view, factor);
        let loss = self.config.loss.evaluate_with_structure(
            &composited,
            &view.image,
            &mask,
            self.config.ssim_lambda,
        );

        #[cfg(all(debug_assertions, not(test)))]
        log::debug!(
            target: "aquasplat::trainer::train",
            "Gaussian3dTrainer::backward > loss ({:.6})",
            loss.value,
        );

        let (grads_composite, grads_medium) = scene.medium.backward(
            &output.direct,
            &output.depth,
            &output.transmittance,
            &loss.grad,
        );
        let backward = output.state.backward(&RenderOutputGrads {
            depth: grads_composite.depth,
            direct: grads_composite.direct,
            transmittance: grads_composite.transmittance,
        });

        let mut grads = backward.grads;
        let regularization = self.regularize(&scene.gaussians, &mut grads);

        StepGradients {
            grads,
            grads_medium,
            loss: loss.value + regularization,
            positions_2d_grad_norm: if self.config.refiner.abs_grad_densification {
                backward.positions_2d_grad_abs_norm
            } else {
                backward.positions_2d_grad_norm
            },
        }
    }

    /// Performing one atomic training step on the view.
    ///
    /// A step with a non-finite loss or gradient is skipped and leaves every
    /// parameter untouched.
    pub fn train(
        &mut self,
        scene: &mut UnderwaterScene,
        view: &TrainingView,
    ) -> Result<StepReport, Error> {
        if self.state == TrainerState::Init {
            self.state = TrainerState::Step;
        }

        let factor = self.downscale_factor();
        let step = if factor > 1 {
            self.backward(scene, &view.downscale(factor), factor)
        } else {
            self.backward(scene, view, factor)
        };

        if !step.is_finite() {
            self.instability_count += 1;
            log::warn!(
                target: "aquasplat::trainer::train",
                "Skipping the step at iteration {} for a non-finite loss ({}) or gradient, \
                {} consecutive",
                self.iteration,
                step.loss,
                self.instability_count,
            );

            if self.instability_count > self.config.instability_count_max {
                return Err(Error::PersistentInstability(
                    self.instability_count,
                    self.iteration,
                ));
            }

            return Ok(StepReport {
                iteration: self.iteration,
                is_skipped: true,
                loss: step.loss,
                point_count: scene.gaussians.point_count(),
                refine: RefineReport::default(),
            });
        }
        self.instability_count = 0;

        self.optimizer
            .update(scene, &step.grads, &step.grads_medium);
        self.accumulate(&step.positions_2d_grad_norm);
        let refine = self.refine(&mut scene.gaussians);

        let iteration = self.iteration;
        self.iteration += 1;

        if self
            .config
            .range_increasing_colors_sh_degree
            .has(self.iteration)
            && self.colors_sh_degree < scene.gaussians.colors_sh_degree_max
        {
            self.colors_sh_degree += 1;
        }
        if self.iteration >= self.config.iteration_count {
            self.state = TrainerState::Converged;
        }

        Ok(StepReport {
            iteration,
            is_skipped: false,
            loss: step.loss,
            point_count: scene.gaussians.point_count(),
            refine,
        })
    }

    /// Training until the iteration count is reached or `stop` is raised.
    ///
    /// A checkpoint is written to `directory` on [`Gaussian3dTrainerConfig::range_checkpoint`]
    /// and once more at the end.
    pub fn run<B: burn::tensor::backend::Backend>(
        &mut self,
        scene: &mut UnderwaterScene,
        dataset: &SparseViewDataset,
        stop: &AtomicBool,
        directory: Option<&Path>,
    ) -> Result<TrainerState, Error> {
        let views = dataset.training_views();
        if views.is_empty() {
            return Err(Error::EmptyCameras);
        }

        while self.iteration < self.config.iteration_count {
            if stop.load(Ordering::Relaxed) {
                self.state = TrainerState::Stopped;
                log::info!(
                    target: "aquasplat::trainer::train",
                    "Stopped at iteration {}",
                    self.iteration,
                );
                break;
            }

            let index = self.next_view(views.len());
            let report = self.train(scene, &views[index])?;

            if let Some(directory) = directory {
                if !report.is_skipped && self.config.range_checkpoint.has(report.iteration) {
                    self.save_checkpoint::<B>(scene, directory)?;
                }
            }
        }

        if self.iteration >= self.config.iteration_count {
            self.state = TrainerState::Converged;
        }
        if let Some(directory) = directory {
            self.save_checkpoint::<B>(scene, directory)?;
        }

        Ok(self.state)
    }

    /// The index of the next view in [`Gaussian3dTrainerConfig::view_order`].
    pub fn next_view(
        &mut self,
        view_count: usize,
    ) -> usize {
        match self.config.view_order {
            ViewOrder::RoundRobin => (self.iteration % view_count as u64) as usize,
            ViewOrder::Random => {
                if self.view_queue.is_empty() {
                    self.view_queue = (0..view_count).collect();
                    self.view_queue.shuffle(&mut self.rng);
                }
                self.view_queue.pop().unwrap_or_default()
            },
        }
    }
}

impl StepGradients {
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.loss.is_finite() && self.grads.is_finite() && self.grads_medium.is_finite()
    }
}

impl fmt::Debug for Gaussian3dTrainer {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Gaussian3dTrainer")
            .field("colors_sh_degree", &self.colors_sh_degree)
            .field("config", &self.config)
            .field("instability_count", &self.instability_count)
            .field("iteration", &self.iteration)
            .field("masks", &self.masks)
            .field("optimizer", &self.optimizer)
            .field("state", &self.state)
            .field("statistics.counts.len()", &self.statistics.counts.len())
            .finish()
    }
}
