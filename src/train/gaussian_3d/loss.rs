pub use super::*;

use crate::metric::{WINDOW_SIZE, WINDOW_STD};
use rayon::{
    iter::{
        IndexedParallelIterator, IntoParallelIterator, IntoParallelRefMutIterator,
        ParallelIterator,
    },
    slice::ParallelSliceMut,
};

/// The stabilizer of the regularized losses.
pub const LOSS_EPSILON: f32 = 1e-3;

const SSIM_C1: f32 = 0.01 * 0.01;
const SSIM_C2: f32 = 0.03 * 0.03;

/// A loss value with its gradient w.r.t. the composite.
#[derive(Clone, Debug, PartialEq)]
pub struct LossOutput {
    pub grad: Image,
    pub value: f32,
}

impl LossKind {
    /// The masked photometric loss, averaged over every channel of every pixel.
    ///
    /// Both images are multiplied by the mask before the error, so a pixel
    /// of zero weight contributes neither loss nor gradient.
    pub fn evaluate(
        &self,
        value: &Image,
        target: &Image,
        mask: &TransientMask,
    ) -> LossOutput {
        let count = (value.pixel_count() * 3).max(1) as f32;
        let mut grad = Image::new(value.width, value.height);

        let sum = grad
            .pixels
            .par_iter_mut()
            .enumerate()
            .map(|(index, grad)| {
                let w = mask.values[index];
                let v = value.pixels[index];
                let t = target.pixels[index];
                (0..3)
                    .map(|c| {
                        let difference = w * (v[c] - t[c]);
                        let scale = self.scale(v[c]);
                        let (loss, grad_difference) = match self {
                            LossKind::RegularizedL2 => {
                                let r = difference * scale;
                                (r * r, 2.0 * r * scale)
                            },
                            _ => ((difference * scale).abs(), difference.signum() * scale),
                        };
                        // d(w * (v - t)) / dv = w
                        grad[c] = if difference == 0.0 {
                            0.0
                        } else {
                            grad_difference * w / count
                        };
                        loss as f64
                    })
                    .sum::<f64>()
            })
            .sum::<f64>();

        LossOutput {
            grad,
            value: (sum / count as f64) as f32,
        }
    }

    /// `1 - SSIM` between the masked images, each scaled as in
    /// [`LossKind::evaluate`] with the composite held constant in the scale.
    pub fn evaluate_structural(
        &self,
        value: &Image,
        target: &Image,
        mask: &TransientMask,
    ) -> LossOutput {
        // d(w * v * s) / dv = w * s
        let scales = value
            .pixels
            .iter()
            .zip(&mask.values)
            .map(|(v, w)| v.map(|v| w * self.scale(v)))
            .collect::<Vec<_>>();
        let scaled = |image: &Image| Image {
            height: image.height,
            pixels: image
                .pixels
                .iter()
                .zip(&scales)
                .map(|(p, s)| [p[0] * s[0], p[1] * s[1], p[2] * s[2]])
                .collect(),
            width: image.width,
        };

        let (similarity, mut grad) = structural_similarity(&scaled(target), &scaled(value));
        grad.pixels.iter_mut().zip(&scales).for_each(|(g, s)| {
            (0..3).for_each(|c| g[c] *= -s[c]);
        });

        LossOutput {
            grad,
            value: 1.0 - similarity,
        }
    }

    /// `(1 - λ) * photometric + λ * (1 - SSIM)`
    pub fn evaluate_with_structure(
        &self,
        value: &Image,
        target: &Image,
        mask: &TransientMask,
        ssim_lambda: f32,
    ) -> LossOutput {
        let mut output = self.evaluate(value, target, mask);
        if ssim_lambda == 0.0 {
            return output;
        }

        let structural = self.evaluate_structural(value, target, mask);
        output
            .grad
            .pixels
            .iter_mut()
            .zip(&structural.grad.pixels)
            .for_each(|(g, s)| {
                (0..3).for_each(|c| g[c] = (1.0 - ssim_lambda) * g[c] + ssim_lambda * s[c]);
            });
        output.value = (1.0 - ssim_lambda) * output.value + ssim_lambda * structural.value;
        output
    }

    /// `1` or `1 / (sg(v) + ε)`
    #[inline]
    fn scale(
        &self,
        value: f32,
    ) -> f32 {
        match self {
            LossKind::L1 => 1.0,
            _ => 1.0 / (value + LOSS_EPSILON),
        }
    }
}

/// The mean SSIM of `x` and `y` under a zero-padded Gaussian window,
/// with its gradient w.r.t. `y`.
///
/// With `A1 = 2 μx μy + C1`, `A2 = 2 σxy + C2`, `B1 = μx² + μy² + C1`
/// and `B2 = σx² + σy² + C2`, each index is `S = A1 A2 / (B1 B2)`.
/// The gradient chains `∂S/∂μy`, `∂S/∂E[y²]` and `∂S/∂E[xy]` back through
/// the window, which is symmetric and therefore its own transpose.
pub fn structural_similarity(
    x: &Image,
    y: &Image,
) -> (f32, Image) {
    let (width, height) = (y.width as usize, y.height as usize);
    let count = width * height;
    let mut grad = Image::new(y.width, y.height);
    if count == 0 {
        return (1.0, grad);
    }

    let filter = GaussianFilter::new();
    let channels = (0..3)
        .into_par_iter()
        .map(|c| {
            let x = x.pixels.iter().map(|p| p[c]).collect::<Vec<_>>();
            let y = y.pixels.iter().map(|p| p[c]).collect::<Vec<_>>();
            let product = |a: &[f32], b: &[f32]| {
                a.iter().zip(b).map(|(a, b)| a * b).collect::<Vec<_>>()
            };
            let mean_x = filter.apply(&x, width, height);
            let mean_y = filter.apply(&y, width, height);
            let mean_xx = filter.apply(&product(&x, &x), width, height);
            let mean_yy = filter.apply(&product(&y, &y), width, height);
            let mean_xy = filter.apply(&product(&x, &y), width, height);

            let mut sum = 0.0_f64;
            let mut partial_mean_y = vec![0.0; count];
            let mut partial_mean_yy = vec![0.0; count];
            let mut partial_mean_xy = vec![0.0; count];
            (0..count).for_each(|i| {
                let (mx, my) = (mean_x[i], mean_y[i]);
                let a1 = 2.0 * mx * my + SSIM_C1;
                let a2 = 2.0 * (mean_xy[i] - mx * my) + SSIM_C2;
                let b1 = mx * mx + my * my + SSIM_C1;
                let b2 = (mean_xx[i] - mx * mx) + (mean_yy[i] - my * my) + SSIM_C2;
                let b = b1 * b2;
                let index = a1 * a2 / b;
                sum += index as f64;

                partial_mean_y[i] =
                    2.0 * mx * (a2 - a1) / b + 2.0 * my * index * (1.0 / b2 - 1.0 / b1);
                partial_mean_yy[i] = -index / b2;
                partial_mean_xy[i] = 2.0 * a1 / b;
            });

            let grad_mean_y = filter.apply(&partial_mean_y, width, height);
            let grad_mean_yy = filter.apply(&partial_mean_yy, width, height);
            let grad_mean_xy = filter.apply(&partial_mean_xy, width, height);
            let grad = (0..count)
                .map(|i| grad_mean_y[i] + 2.0 * y[i] * grad_mean_yy[i] + x[i] * grad_mean_xy[i])
                .collect::<Vec<_>>();
            (sum, grad)
        })
        .collect::<Vec<_>>();

    let total = (count * 3) as f32;
    channels.iter().enumerate().for_each(|(c, (_, channel))| {
        grad.pixels
            .iter_mut()
            .zip(channel)
            .for_each(|(g, v)| g[c] = v / total);
    });
    let sum = channels.iter().map(|(sum, _)| sum).sum::<f64>();

    ((sum / total as f64) as f32, grad)
}

/// A normalized Gaussian window applied separably with zero padding.
#[derive(Clone, Debug)]
struct GaussianFilter {
    weights: [f32; WINDOW_SIZE],
}

impl GaussianFilter {
    fn new() -> Self {
        let size_half = (WINDOW_SIZE / 2) as i32;
        let mut weights = [0.0; WINDOW_SIZE];
        weights
            .iter_mut()
            .zip(-size_half..=size_half)
            .for_each(|(w, x)| *w = (-(x * x) as f64 / (2.0 * WINDOW_STD * WINDOW_STD)).exp() as f32);
        let sum = weights.iter().sum::<f32>();
        weights.iter_mut().for_each(|w| *w /= sum);
        Self { weights }
    }

    /// `F(x)` of a `[H, W]` plane.
    fn apply(
        &self,
        plane: &[f32],
        width: usize,
        height: usize,
    ) -> Vec<f32> {
        let radius = (WINDOW_SIZE / 2) as isize;
        let tap = |position: usize, k: usize, bound: usize| {
            let position = position as isize + k as isize - radius;
            (0..bound as isize).contains(&position).then_some(position as usize)
        };

        let mut rows = vec![0.0; plane.len()];
        rows.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            row.iter_mut().enumerate().for_each(|(x, value)| {
                *value = self
                    .weights
                    .iter()
                    .enumerate()
                    .filter_map(|(k, w)| Some(w * plane[y * width + tap(x, k, width)?]))
                    .sum();
            });
        });

        let mut output = vec![0.0; plane.len()];
        output.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            row.iter_mut().enumerate().for_each(|(x, value)| {
                *value = self
                    .weights
                    .iter()
                    .enumerate()
                    .filter_map(|(k, w)| Some(w * rows[tap(y, k, height)? * width + x]))
                    .sum();
            });
        });
        output
    }
}

impl Gaussian3dTrainer {
    /// Adding the opacity and scaling penalties of the alive splats.
    ///
    /// ## Returns
    ///
    /// The weighted penalty.
    pub fn regularize(
        &self,
        scene: &Gaussian3dScene,
        grads: &mut Gaussian3dSceneGrads,
    ) -> f32 {
        let weight_opacity = self.config.regularization_opacity;
        let weight_scaling = self.config.regularization_scaling;
        let count = scene.point_count();
        if count == 0 || (weight_opacity == 0.0 && weight_scaling == 0.0) {
            return 0.0;
        }

        let mut value = 0.0;
        scene.slots().for_each(|slot| {
            if weight_opacity > 0.0 {
                let opacity = scene.opacity(slot);
                value += weight_opacity * opacity / count as f32;
                grads.opacity_logits[slot] +=
                    weight_opacity * opacity * (1.0 - opacity) / count as f32;
            }
            if weight_scaling > 0.0 {
                let scaling = scene.scaling(slot);
                value += weight_scaling * scaling.element_sum() / (3 * count) as f32;
                (0..3).for_each(|i| {
                    grads.log_scalings[slot * 3 + i] +=
                        weight_scaling * scaling[i] / (3 * count) as f32;
                });
            }
        });
        value
    }
}
