//! Transient masks from optical flow.
//!
//! Pixels whose motion is not explained by the camera are down-weighted, so
//! moving fish and particles do not leak into the static scene.

pub mod cache;
pub mod flow;
pub mod motion;

pub use crate::{
    error::Error,
    function::{Image, ScalarMap},
};
pub use burn::config::Config;
pub use cache::*;
pub use flow::*;
pub use glam::Vec2;
pub use motion::*;

use rayon::{
    iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator},
    slice::ParallelSliceMut,
};

/// The fraction of `sigma_photo` by which the flow must beat the camera motion.
const ERROR_MARGIN: f32 = 0.25;

/// Per-pixel loss weights in `[0, 1]`.
pub type TransientMask = ScalarMap;

/// Estimating a transient mask of a frame against a temporal neighbour.
pub trait TransientMaskEstimator {
    fn compute_mask(
        &self,
        frame_t: &Image,
        frame_t_plus_delta: &Image,
    ) -> Result<TransientMask, Error>;

    /// Falling back to no masking if the estimation fails.
    fn compute_mask_or_unmasked(
        &self,
        frame_t: &Image,
        frame_t_plus_delta: &Image,
    ) -> TransientMask {
        self.compute_mask(frame_t, frame_t_plus_delta)
            .unwrap_or_else(|error| {
                log::warn!(
                    target: "aquasplat::trainer::mask",
                    "compute_mask > fallback to unmasked: {error}",
                );
                TransientMask::filled(frame_t.width, frame_t.height, 1.0)
            })
    }
}

#[derive(Config, Copy, Debug, PartialEq)]
pub struct FlowMaskConfig {
    /// Pixels with a smaller structure-tensor eigenvalue are not tracked.
    #[config(default = "1e-5")]
    pub eigen_threshold: f32,

    /// The radius of the min-filter applied to the mask.
    #[config(default = "1")]
    pub erosion_radius: u32,

    /// Lucas–Kanade iterations per pyramid level.
    #[config(default = "10")]
    pub iteration_count: u32,

    #[config(default = "3")]
    pub pyramid_levels: u32,

    /// The falloff of the residual motion, in pixels.
    #[config(default = "1.0")]
    pub sigma_motion: f32,

    /// The falloff of the photometric warp error.
    #[config(default = "0.1")]
    pub sigma_photo: f32,

    /// `0` disables the masking, `1` applies it fully.
    #[config(default = "1.0")]
    pub strength: f32,

    /// The flow is degenerate below this fraction of trackable pixels.
    #[config(default = "0.1")]
    pub valid_fraction_min: f32,

    /// The half side length of the Lucas–Kanade window.
    #[config(default = "2")]
    pub window_radius: u32,
}

/// The default estimator from dense flow and global affine motion.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FlowMaskEstimator {
    pub config: FlowMaskConfig,
}

impl FlowMaskConfig {
    #[inline]
    pub fn init(&self) -> FlowMaskEstimator {
        FlowMaskEstimator { config: *self }
    }
}

impl TransientMaskEstimator for FlowMaskEstimator {
    fn compute_mask(
        &self,
        frame_t: &Image,
        frame_t_plus_delta: &Image,
    ) -> Result<TransientMask, Error> {
        let config = &self.config;
        if !frame_t.has_same_size(frame_t_plus_delta) {
            return Err(Error::MismatchedFrameSize(
                frame_t.width,
                frame_t.height,
                frame_t_plus_delta.width,
                frame_t_plus_delta.height,
            ));
        }
        let (width, height) = (frame_t.width, frame_t.height);

        let flow = DenseFlow::compute(
            &frame_t.luminance(),
            &frame_t_plus_delta.luminance(),
            config,
        );

        // Pixels the flow does not explain are not tracked.
        let errors_flow = (0..width * height)
            .into_par_iter()
            .map(|index| {
                let (x, y) = (index % width, index / width);
                warp_error(frame_t, frame_t_plus_delta, x, y, flow.get(x, y))
            })
            .collect::<Vec<_>>();
        let valid = flow
            .eigen_min
            .values
            .iter()
            .zip(&errors_flow)
            .zip(flow.flow_x.values.iter().zip(&flow.flow_y.values))
            .map(|((eigen, error), (u, v))| {
                *eigen >= config.eigen_threshold
                    && *error <= config.sigma_photo
                    && u.is_finite()
                    && v.is_finite()
            })
            .collect::<Vec<_>>();
        let valid_fraction =
            valid.iter().filter(|v| **v).count() as f32 / valid.len().max(1) as f32;
        if valid_fraction < config.valid_fraction_min {
            return Err(Error::DegenerateFlow(valid_fraction));
        }

        let motion = AffineMotion::fit_robust(&flow, &valid)
            .ok_or(Error::DegenerateFlow(valid_fraction))?;

        let mut weights = TransientMask::new(width, height);
        weights
            .values
            .par_chunks_mut(width as usize)
            .enumerate()
            .for_each(|(y, row)| {
                let y = y as u32;
                row.iter_mut().enumerate().for_each(|(x, weight)| {
                    let x = x as u32;
                    let index = (y * width + x) as usize;
                    let affine = motion.flow_at(x, y);
                    let error_affine = warp_error(frame_t, frame_t_plus_delta, x, y, affine);
                    *weight = (-(error_affine / config.sigma_photo).powi(2)).exp();

                    // Residual motion counts where the flow explains the pixel
                    // clearly better than the camera does.
                    let error_flow = errors_flow[index];
                    if valid[index]
                        && error_flow + ERROR_MARGIN * config.sigma_photo < error_affine
                    {
                        let residual = (flow.get(x, y) - affine).length();
                        *weight *= (-(residual / config.sigma_motion).powi(2)).exp();
                    }
                });
            });

        let mut mask = erode(&weights, config.erosion_radius);
        let strength = config.strength.clamp(0.0, 1.0);
        mask.values
            .iter_mut()
            .for_each(|w| *w = 1.0 - strength * (1.0 - *w));

        if !mask.values.iter().all(|w| w.is_finite()) {
            return Err(Error::NonFiniteMask);
        }

        #[cfg(all(debug_assertions, not(test)))]
        log::debug!(
            target: "aquasplat::trainer::mask",
            "compute_mask > valid_fraction ({valid_fraction:.4}), mean ({:.4})",
            mask.mean(),
        );

        Ok(mask)
    }
}

/// `max_c |I_t(x) - I_{t+δ}(x + flow)|`
#[inline]
fn warp_error(
    frame_t: &Image,
    frame_t_plus_delta: &Image,
    x: u32,
    y: u32,
    flow: Vec2,
) -> f32 {
    let source = frame_t.get(x, y);
    let warped = frame_t_plus_delta.sample_bilinear(x as f32 + flow.x, y as f32 + flow.y);
    (0..3)
        .map(|c| (source[c] - warped[c]).abs())
        .fold(0.0, f32::max)
}

/// The minimum over a square window.
pub fn erode(
    map: &ScalarMap,
    radius: u32,
) -> ScalarMap {
    if radius == 0 {
        return map.to_owned();
    }

    let (width, height) = (map.width, map.height);
    let mut output = ScalarMap::new(width, height);
    output
        .values
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as u32;
            let y_range = y.saturating_sub(radius)..(y + radius + 1).min(height);
            row.iter_mut().enumerate().for_each(|(x, value)| {
                let x = x as u32;
                let x_range = x.saturating_sub(radius)..(x + radius + 1).min(width);
                *value = y_range
                    .clone()
                    .flat_map(|y| x_range.clone().map(move |x| (x, y)))
                    .map(|(x, y)| map.get(x, y))
                    .fold(f32::INFINITY, f32::min);
            });
        });
    output
}

/// Combining masks element-wise by the minimum.
pub fn combine_masks(masks: &[TransientMask]) -> Option<TransientMask> {
    let (first, others) = masks.split_first()?;
    let mut output = first.to_owned();
    others.iter().for_each(|mask| {
        output
            .values
            .iter_mut()
            .zip(&mask.values)
            .for_each(|(o, m)| *o = o.min(*m));
    });
    Some(output)
}

impl Default for FlowMaskConfig {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(map: &ScalarMap) -> Image {
        Image {
            height: map.height,
            pixels: map.values.iter().map(|v| [*v, *v * 0.9, *v * 0.8]).collect(),
            width: map.width,
        }
    }

    /// Frames `t - 1`, `t` and `t + 1` with a bright patch only at `t`.
    fn frames_with_patch() -> ([Image; 3], [u32; 4]) {
        let (width, height) = (64, 64);
        let patch = [24, 24, 34, 34];
        let frames = [false, true, false].map(|has_patch| {
            let mut frame = frame_of(&smooth_texture(width, height, Vec2::ZERO));
            if has_patch {
                (patch[1]..patch[3]).for_each(|y| {
                    (patch[0]..patch[2]).for_each(|x| frame.set(x, y, [1.0; 3]));
                });
            }
            frame
        });
        (frames, patch)
    }

    fn distance_to_rect(
        x: u32,
        y: u32,
        rect: [u32; 4],
    ) -> u32 {
        let dx = rect[0].saturating_sub(x).max(x.saturating_sub(rect[2] - 1));
        let dy = rect[1].saturating_sub(y).max(y.saturating_sub(rect[3] - 1));
        dx.max(dy)
    }

    #[test]
    fn moving_patch_is_masked() {
        let ([previous, current, next], patch) = frames_with_patch();
        let config = FlowMaskConfig::default();
        let estimator = config.init();

        let masks = [&previous, &next]
            .map(|other| estimator.compute_mask(&current, other).unwrap());
        let mask = combine_masks(&masks).unwrap();
        assert!(mask.values.iter().all(|w| (0.0..=1.0).contains(w)));

        (0..64).for_each(|y| {
            (0..64).for_each(|x| {
                let w = mask.get(x, y);
                match distance_to_rect(x, y, patch) {
                    0 => assert!(w < 0.3, "patch ({x}, {y}): {w}"),
                    // The erosion spreads the patch by its radius
                    d if d <= config.erosion_radius => {},
                    _ => assert!(w > 0.8, "background ({x}, {y}): {w}"),
                }
            });
        });
    }

    #[test]
    fn moving_patch_without_erosion() {
        let ([_, current, next], patch) = frames_with_patch();
        let mask = FlowMaskConfig::default()
            .with_erosion_radius(0)
            .init()
            .compute_mask(&current, &next)
            .unwrap();

        (0..64).for_each(|y| {
            (0..64).for_each(|x| {
                let w = mask.get(x, y);
                if distance_to_rect(x, y, patch) == 0 {
                    assert!(w < 0.3, "patch ({x}, {y}): {w}");
                } else {
                    assert!(w > 0.8, "background ({x}, {y}): {w}");
                }
            });
        });
    }

    #[test]
    fn camera_motion_is_not_masked() {
        let current = frame_of(&smooth_texture(64, 64, Vec2::ZERO));
        let next = frame_of(&smooth_texture(64, 64, Vec2::new(1.0, 0.5)));

        let mask = FlowMaskConfig::default()
            .init()
            .compute_mask(&current, &next)
            .unwrap();
        (8..56).for_each(|y| {
            (8..56).for_each(|x| {
                let w = mask.get(x, y);
                assert!(w > 0.8, "({x}, {y}): {w}");
            });
        });
    }

    #[test]
    fn textureless_water_falls_back_to_unmasked() {
        let frame = Image::filled(32, 32, [0.1, 0.3, 0.4]);
        let estimator = FlowMaskConfig::default().init();

        let output = estimator.compute_mask(&frame, &frame);
        assert!(matches!(output, Err(Error::DegenerateFlow(_))), "{output:?}");

        let output = estimator.compute_mask_or_unmasked(&frame, &frame);
        assert!(output.values.iter().all(|w| *w == 1.0));
    }

    #[test]
    fn mismatched_frame_size() {
        let estimator = FlowMaskEstimator::default();
        let output = estimator.compute_mask(&Image::new(8, 8), &Image::new(8, 9));
        assert!(
            matches!(output, Err(Error::MismatchedFrameSize(8, 8, 8, 9))),
            "{output:?}"
        );
    }

    #[test]
    fn strength_softens_the_mask() {
        let ([_, current, next], patch) = frames_with_patch();
        let full = FlowMaskConfig::default().init().compute_mask(&current, &next).unwrap();
        let none = FlowMaskConfig::default()
            .with_strength(0.0)
            .init()
            .compute_mask(&current, &next)
            .unwrap();
        let half = FlowMaskConfig::default()
            .with_strength(0.5)
            .init()
            .compute_mask(&current, &next)
            .unwrap();

        assert!(none.values.iter().all(|w| *w == 1.0));
        let (x, y) = (patch[0] + 2, patch[1] + 2);
        let target = 1.0 - 0.5 * (1.0 - full.get(x, y));
        assert!((half.get(x, y) - target).abs() < 1e-6);
    }

    #[test]
    fn erode_takes_the_minimum() {
        let mut map = ScalarMap::filled(5, 5, 1.0);
        map.set(2, 2, 0.0);

        let output = erode(&map, 1);
        assert_eq!(output.get(1, 1), 0.0);
        assert_eq!(output.get(3, 3), 0.0);
        assert_eq!(output.get(0, 0), 1.0);
        assert_eq!(erode(&map, 0), map);
    }
}
