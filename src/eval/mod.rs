//! Rendering fitted scenes for metrics and image export.

pub use crate::{
    dataset::{Camera, TrainingView},
    error::Error,
    function::{
        get_gray_image_from_map, get_rgb_image_from_image, get_tensor_from_image, Image, ScalarMap,
    },
    mask::TransientMask,
    metric::{MeanAbsoluteError, MeanStructuralSimilarity, Metric, Psnr},
    render::Gaussian3dRenderOptions,
    scene::UnderwaterScene,
};
pub use burn::tensor::{backend::Backend, ElementConversion};

use rayon::iter::{
    IndexedParallelIterator, IntoParallelRefIterator, IntoParallelRefMutIterator, ParallelIterator,
};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Every image of an evaluation render.
#[derive(Clone, Debug, PartialEq)]
pub struct EvalRender {
    /// `1 - T_final`
    pub alpha: ScalarMap,
    /// The direct radiance tone-mapped by `J / (J + 1)`.
    pub clear: Image,
    /// `object + medium`
    pub composited: Image,
    pub depth: ScalarMap,
    /// The backscatter, including the open water behind all splats.
    pub medium: Image,
    /// The attenuated direct radiance.
    pub object: Image,
}

/// The image quality of a render against its observation.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EvalMetrics {
    pub mae: f32,
    pub mssim: f32,
    pub psnr: f32,
    /// The PSNR over the pixels weighted by the transient mask.
    pub psnr_masked: Option<f32>,
}

pub struct Evaluator<B: Backend> {
    pub device: B::Device,
    pub mae: MeanAbsoluteError,
    pub mssim: MeanStructuralSimilarity<B, 3>,
    pub psnr: Psnr<B>,
}

impl UnderwaterScene {
    /// Rendering the camera without touching any training state.
    pub fn render_eval(
        &self,
        camera: &Camera,
        options: &Gaussian3dRenderOptions,
    ) -> EvalRender {
        let output = self.gaussians.render(camera, options);
        let coefficients = self.medium.coefficients();
        let background = self.medium.config.background;
        let (width, height) = (camera.image_width, camera.image_height);

        let mut object = Image::new(width, height);
        let mut medium = Image::new(width, height);
        object
            .pixels
            .par_iter_mut()
            .zip(medium.pixels.par_iter_mut())
            .enumerate()
            .for_each(|(index, (object, medium))| {
                let direct = output.direct.pixels[index];
                let depth = output.depth.values[index];
                let transmittance = output.transmittance.values[index];
                (0..3).for_each(|c| {
                    let color = coefficients.backscatter_color[c];
                    object[c] = direct[c] * (-coefficients.attenuation[c] * depth).exp();
                    medium[c] = color * (1.0 - (-coefficients.backscatter[c] * depth).exp());
                    if background {
                        medium[c] += color * transmittance;
                    }
                });
            });

        let mut composited = object.to_owned();
        composited
            .pixels
            .par_iter_mut()
            .zip(medium.pixels.par_iter())
            .for_each(|(composited, medium)| {
                (0..3).for_each(|c| composited[c] += medium[c]);
            });

        let mut clear = output.direct;
        clear.pixels.par_iter_mut().for_each(|pixel| {
            *pixel = pixel.map(|v| v / (v + 1.0));
        });

        EvalRender {
            alpha: output.alpha,
            clear,
            composited,
            depth: output.depth,
            medium,
            object,
        }
    }
}

impl EvalRender {
    /// Writing `eval_rgb_*`, `eval_rgb_object_*`, `eval_rgb_medium_*`,
    /// `eval_rgb_clear_*` and `eval_depth_*` as PNG files.
    ///
    /// ## Returns
    ///
    /// The paths of the written files.
    pub fn export(
        &self,
        directory: &Path,
        frame_id: u32,
    ) -> Result<Vec<PathBuf>, Error> {
        std::fs::create_dir_all(directory)?;

        let images = [
            ("eval_rgb", &self.composited),
            ("eval_rgb_object", &self.object),
            ("eval_rgb_medium", &self.medium),
            ("eval_rgb_clear", &self.clear),
        ];
        let mut paths = images
            .into_iter()
            .map(|(name, image)| {
                let path = directory.join(format!("{name}_{frame_id}.png"));
                get_rgb_image_from_image(image).save(&path)?;
                Ok::<_, Error>(path)
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let path = directory.join(format!("eval_depth_{frame_id}.png"));
        get_gray_image_from_map(&self.depth).save(&path)?;
        paths.push(path);

        log::info!(
            target: "aquasplat::trainer::eval",
            "Exported frame {frame_id} to {directory:?}",
        );

        Ok(paths)
    }
}

impl EvalMetrics {
    /// The mean of every metric, `None` if there is nothing to average.
    pub fn mean(metrics: &[Self]) -> Option<Self> {
        if metrics.is_empty() {
            return None;
        }

        let count = metrics.len() as f32;
        let masked = metrics
            .iter()
            .filter_map(|m| m.psnr_masked)
            .collect::<Vec<_>>();
        Some(Self {
            mae: metrics.iter().map(|m| m.mae).sum::<f32>() / count,
            mssim: metrics.iter().map(|m| m.mssim).sum::<f32>() / count,
            psnr: metrics.iter().map(|m| m.psnr).sum::<f32>() / count,
            psnr_masked: (!masked.is_empty())
                .then(|| masked.iter().sum::<f32>() / masked.len() as f32),
        })
    }
}

impl<B: Backend> Evaluator<B> {
    pub fn init(device: &B::Device) -> Self {
        Self {
            device: device.to_owned(),
            mae: MeanAbsoluteError::init(),
            mssim: MeanStructuralSimilarity::init(device),
            psnr: Psnr::init(device),
        }
    }

    /// Evaluating the composite against the observation.
    pub fn evaluate(
        &self,
        value: &Image,
        target: &Image,
        mask: Option<&TransientMask>,
    ) -> Result<EvalMetrics, Error> {
        if !value.has_same_size(target) {
            return Err(Error::MismatchedFrameSize(
                value.width,
                value.height,
                target.width,
                target.height,
            ));
        }

        let value = get_tensor_from_image::<B>(&value.clamped(), &self.device);
        let target = get_tensor_from_image::<B>(target, &self.device);

        let psnr_masked = mask
            .map(|mask| {
                if mask.width != target.dims()[3] as u32 || mask.height != target.dims()[2] as u32 {
                    return Err(Error::MismatchedFrameSize(
                        mask.width,
                        mask.height,
                        target.dims()[3] as u32,
                        target.dims()[2] as u32,
                    ));
                }
                let weight = Image {
                    height: mask.height,
                    pixels: mask.values.iter().map(|w| [*w; 3]).collect(),
                    width: mask.width,
                };
                let weight = get_tensor_from_image::<B>(&weight, &self.device);
                Ok(self
                    .psnr
                    .evaluate_weighted(value.to_owned(), target.to_owned(), weight)
                    .into_scalar()
                    .elem::<f32>())
            })
            .transpose()?;

        Ok(EvalMetrics {
            mae: self
                .mae
                .evaluate(value.to_owned(), target.to_owned())
                .into_scalar()
                .elem::<f32>(),
            mssim: self
                .mssim
                .evaluate(value.to_owned(), target.to_owned())
                .into_scalar()
                .elem::<f32>(),
            psnr: self.psnr.evaluate(value, target).into_scalar().elem::<f32>(),
            psnr_masked,
        })
    }

    /// Rendering and evaluating every view.
    pub fn evaluate_views(
        &self,
        scene: &UnderwaterScene,
        views: &[TrainingView],
        options: &Gaussian3dRenderOptions,
    ) -> Result<Vec<EvalMetrics>, Error> {
        views
            .iter()
            .map(|view| {
                let render = scene.render_eval(&view.camera, options);
                self.evaluate(&render.composited, &view.image, None)
            })
            .collect()
    }
}

impl<B: Backend> fmt::Debug for Evaluator<B> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("device", &self.device)
            .field("mae", &self.mae)
            .finish()
    }
}
