pub use super::*;

use burn::{
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// The layout version of [`Gaussian3dCheckpoint`].
pub const CHECKPOINT_VERSION: u32 = 1;

/// The file superseded by every checkpoint of a run.
pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.bin";

/// A durable snapshot of the scene, the medium and the optimizer.
#[derive(Clone, Debug, Record)]
pub struct Gaussian3dCheckpoint {
    pub colors_sh_degree: u32,
    pub instability_count: u64,
    pub iteration: u64,
    pub medium: MediumParameters,
    pub optimizer: Gaussian3dOptimizerRecord,
    pub scene: Gaussian3dSceneRecord,
    pub seed: u64,
    /// `[S]`
    pub statistics_counts: Vec<u32>,
    /// `[S]`
    pub statistics_sums: Vec<f32>,
    pub version: u32,
}

type CheckpointRecorder = BinBytesRecorder<FullPrecisionSettings>;

impl Gaussian3dCheckpoint {
    pub fn to_bytes<B: Backend>(self) -> Result<Vec<u8>, Error> {
        Recorder::<B>::record(&CheckpointRecorder::default(), self, ())
            .map_err(|e| Error::Record(format!("{e:?}")))
    }

    /// Decoding a checkpoint of [`CHECKPOINT_VERSION`].
    pub fn from_bytes<B: Backend>(
        bytes: Vec<u8>,
        device: &B::Device,
    ) -> Result<Self, Error> {
        let checkpoint: Self = Recorder::<B>::load(&CheckpointRecorder::default(), bytes, device)
            .map_err(|e| Error::Record(format!("{e:?}")))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(Error::UnsupportedCheckpointVersion(checkpoint.version));
        }
        Ok(checkpoint)
    }

    /// Writing to a temporary file first, then replacing `path`.
    pub fn save<B: Backend>(
        self,
        path: &Path,
    ) -> Result<(), Error> {
        let bytes = self.to_bytes::<B>()?;
        let path_temporary = path.with_extension("tmp");
        fs::write(&path_temporary, bytes)?;
        fs::rename(&path_temporary, path)?;
        Ok(())
    }

    pub fn load<B: Backend>(
        path: &Path,
        device: &B::Device,
    ) -> Result<Self, Error> {
        if !path.is_file() {
            return Err(Error::MissingCheckpoint(path.to_owned()));
        }
        Self::from_bytes::<B>(fs::read(path)?, device)
    }

    /// Restoring the scene for evaluation only.
    pub fn into_scene(
        self,
        medium: &MediumConfig,
    ) -> Result<UnderwaterScene, Error> {
        let mut medium = medium.init();
        medium.parameters = self.medium;
        Ok(UnderwaterScene {
            gaussians: Gaussian3dScene::from_record(self.scene)?,
            medium,
        })
    }
}

impl Gaussian3dTrainer {
    pub fn checkpoint(
        &self,
        scene: &UnderwaterScene,
    ) -> Gaussian3dCheckpoint {
        Gaussian3dCheckpoint {
            colors_sh_degree: self.colors_sh_degree,
            instability_count: self.instability_count,
            iteration: self.iteration,
            medium: scene.medium.parameters,
            optimizer: self.optimizer.to_owned().into_record(),
            scene: scene.gaussians.to_owned().into_record(),
            seed: self.config.seed,
            statistics_counts: self.statistics.counts.to_owned(),
            statistics_sums: self.statistics.sums.to_owned(),
            version: CHECKPOINT_VERSION,
        }
    }

    /// Superseding the checkpoint in `directory`.
    ///
    /// ## Returns
    ///
    /// The path of the checkpoint file.
    pub fn save_checkpoint<B: Backend>(
        &self,
        scene: &UnderwaterScene,
        directory: &Path,
    ) -> Result<PathBuf, Error> {
        fs::create_dir_all(directory)?;
        let path = directory.join(CHECKPOINT_FILE_NAME);
        self.checkpoint(scene).save::<B>(&path)?;

        log::info!(
            target: "aquasplat::trainer::train::checkpoint",
            "Saved the checkpoint of iteration {} to {path:?}",
            self.iteration,
        );

        Ok(path)
    }

    /// Resuming the trainer and the scene from a checkpoint.
    ///
    /// The random state is reseeded from the seed and the iteration.
    pub fn restore(
        &mut self,
        scene: &mut UnderwaterScene,
        checkpoint: Gaussian3dCheckpoint,
    ) -> Result<&mut Self, Error> {
        if checkpoint.statistics_counts.len() != checkpoint.statistics_sums.len() {
            return Err(Error::Record(format!(
                "statistics have {} counts and {} sums",
                checkpoint.statistics_counts.len(),
                checkpoint.statistics_sums.len(),
            )));
        }

        scene.gaussians = Gaussian3dScene::from_record(checkpoint.scene)?;
        scene.medium.parameters = checkpoint.medium;

        self.colors_sh_degree = checkpoint.colors_sh_degree;
        self.instability_count = checkpoint.instability_count;
        self.iteration = checkpoint.iteration;
        self.optimizer.load_record(checkpoint.optimizer);
        self.rng = StdRng::seed_from_u64(checkpoint.seed.wrapping_add(checkpoint.iteration));
        self.state = if self.iteration >= self.config.iteration_count {
            TrainerState::Converged
        } else {
            TrainerState::Step
        };
        self.statistics = PositionGradStatistics {
            counts: checkpoint.statistics_counts,
            sums: checkpoint.statistics_sums,
        };
        self.view_queue.clear();

        Ok(self)
    }

    pub fn load_checkpoint<B: Backend>(
        &mut self,
        scene: &mut UnderwaterScene,
        path: &Path,
        device: &B::Device,
    ) -> Result<&mut Self, Error> {
        let checkpoint = Gaussian3dCheckpoint::load::<B>(path, device)?;
        self.restore(scene, checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Camera, Frame};
    use burn::backend::NdArray;
    use glam::{Mat3, Vec3};

    fn dataset() -> SparseViewDataset {
        let camera = Camera::new_centered(0, 7, 16, 16, 16.0, Mat3::IDENTITY, Vec3::ZERO);
        let frame = Frame {
            frame_id: 7,
            image: Image::filled(16, 16, [0.1, 0.5, 0.6]),
            timestamp: 0.0,
        };
        let points = (0..6)
            .map(|i| Point {
                color_rgb: [0.8, 0.2, 0.1 * i as f32],
                position: [i as f32 * 0.3 - 0.75, 0.2, 2.0 + i as f32 * 0.1],
            })
            .collect();
        SparseViewDataset::init([camera], [frame], points).unwrap()
    }

    fn trained() -> (SparseViewDataset, Gaussian3dTrainer, UnderwaterScene) {
        let dataset = dataset();
        let config = Gaussian3dTrainerConfig::new()
            .with_downscale_count(0)
            .with_iteration_count(20)
            .with_mask_disabled(true)
            .with_refiner(
                RefinerConfig::new()
                    .with_range_refinement(RangeOptions::new(5, 20, 5))
                    .with_densify(DensifyOptions::new().with_threshold_position_2d_grad_norm(0.0)),
            );
        let mut scene = config.init_scene(&dataset).unwrap();
        let mut trainer = config.init(&dataset).unwrap();
        let view = &dataset.training_views()[0];
        (0..8).for_each(|_| {
            trainer.train(&mut scene, view).unwrap();
        });
        (dataset, trainer, scene)
    }

    #[test]
    fn round_trip_renders_identically() {
        let device = Default::default();
        let (dataset, trainer, scene) = trained();

        let bytes = trainer.checkpoint(&scene).to_bytes::<NdArray>().unwrap();
        let checkpoint = Gaussian3dCheckpoint::from_bytes::<NdArray>(bytes, &device).unwrap();

        let mut scene_output = trainer.config.init_scene(&dataset).unwrap();
        let mut trainer_output = trainer.config.init(&dataset).unwrap();
        trainer_output.restore(&mut scene_output, checkpoint).unwrap();

        assert_eq!(scene_output, scene);
        assert_eq!(trainer_output.iteration, trainer.iteration);
        assert_eq!(trainer_output.optimizer, trainer.optimizer);
        assert_eq!(trainer_output.statistics, trainer.statistics);

        let camera = &dataset.training_views()[0].camera;
        let options = Gaussian3dRenderOptions::new();
        let target = scene.gaussians.render(camera, &options);
        let output = scene_output.gaussians.render(camera, &options);
        assert_eq!(output.direct, target.direct);
        assert_eq!(output.depth, target.depth);
        assert_eq!(
            scene_output.medium.composite(&output.direct, &output.depth, &output.transmittance),
            scene.medium.composite(&target.direct, &target.depth, &target.transmittance),
        );
    }

    #[test]
    fn save_and_load_file() {
        let device = Default::default();
        let (dataset, trainer, scene) = trained();

        let directory = std::env::temp_dir()
            .join(format!("aquasplat-checkpoint-{}", std::process::id()));
        let path = trainer.save_checkpoint::<NdArray>(&scene, &directory).unwrap();
        assert!(path.ends_with(CHECKPOINT_FILE_NAME));

        // Superseded, not merged
        let path = trainer.save_checkpoint::<NdArray>(&scene, &directory).unwrap();

        let output = Gaussian3dCheckpoint::load::<NdArray>(&path, &device)
            .unwrap()
            .into_scene(&trainer.config.medium)
            .unwrap();
        assert_eq!(output, scene);

        let mut scene_output = trainer.config.init_scene(&dataset).unwrap();
        let mut trainer_output = trainer.config.init(&dataset).unwrap();
        trainer_output
            .load_checkpoint::<NdArray>(&mut scene_output, &path, &device)
            .unwrap();
        assert_eq!(scene_output, scene);

        fs::remove_dir_all(&directory).unwrap();
    }

    #[test]
    fn unsupported_version() {
        let device = Default::default();
        let (_, trainer, scene) = trained();

        let mut checkpoint = trainer.checkpoint(&scene);
        checkpoint.version = CHECKPOINT_VERSION + 1;
        let bytes = checkpoint.to_bytes::<NdArray>().unwrap();

        let output = Gaussian3dCheckpoint::from_bytes::<NdArray>(bytes, &device);
        assert!(matches!(
            output,
            Err(Error::UnsupportedCheckpointVersion(v)) if v == CHECKPOINT_VERSION + 1
        ));
    }

    #[test]
    fn missing_file() {
        let output = Gaussian3dCheckpoint::load::<NdArray>(
            Path::new("/nonexistent/aquasplat/checkpoint.bin"),
            &Default::default(),
        );
        assert!(matches!(output, Err(Error::MissingCheckpoint(_))));
    }
}
