//! Dense pyramidal Lucas–Kanade optical flow.

pub use super::*;

use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::{ParallelSlice, ParallelSliceMut},
};

/// The smallest side length of a pyramid level.
const LEVEL_SIDE_MIN: u32 = 8;

/// Windows with a flatter structure tensor are left untouched.
const DETERMINANT_MIN: f32 = 1e-12;

/// The update length in pixels below which a pixel has converged.
const STEP_EPSILON: f32 = 1e-3;

/// A dense flow field from a source to a target image, in pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct DenseFlow {
    /// The minimum eigenvalue of the mean structure tensor.
    pub eigen_min: ScalarMap,
    pub flow_x: ScalarMap,
    pub flow_y: ScalarMap,
}

impl DenseFlow {
    /// Estimating the flow of `source` towards `target` coarse-to-fine.
    pub fn compute(
        source: &ScalarMap,
        target: &ScalarMap,
        config: &FlowMaskConfig,
    ) -> Self {
        let mut pyramid = vec![(source.to_owned(), target.to_owned())];
        while pyramid.len() < config.pyramid_levels.max(1) as usize {
            let (source, target) = &pyramid[pyramid.len() - 1];
            if source.width / 2 < LEVEL_SIDE_MIN || source.height / 2 < LEVEL_SIDE_MIN {
                break;
            }
            let level = (source.downscale(2), target.downscale(2));
            pyramid.push(level);
        }

        let mut output: Option<Self> = None;
        for (source, target) in pyramid.iter().rev() {
            let (flow_x, flow_y) = match &output {
                Some(coarse) => (
                    upsample_flow(&coarse.flow_x, source.width, source.height),
                    upsample_flow(&coarse.flow_y, source.width, source.height),
                ),
                None => (
                    ScalarMap::new(source.width, source.height),
                    ScalarMap::new(source.width, source.height),
                ),
            };
            output = Some(refine_level(source, target, flow_x, flow_y, config));
        }

        output.unwrap_or_else(|| Self {
            eigen_min: ScalarMap::new(source.width, source.height),
            flow_x: ScalarMap::new(source.width, source.height),
            flow_y: ScalarMap::new(source.width, source.height),
        })
    }

    #[inline]
    pub fn get(
        &self,
        x: u32,
        y: u32,
    ) -> Vec2 {
        Vec2::new(self.flow_x.get(x, y), self.flow_y.get(x, y))
    }
}

/// Iterating Lucas–Kanade steps at one pyramid level.
///
/// Every pixel solves its own window, warped by the flow of the pixel itself,
/// starting from the flow of the coarser level.
fn refine_level(
    source: &ScalarMap,
    target: &ScalarMap,
    mut flow_x: ScalarMap,
    mut flow_y: ScalarMap,
    config: &FlowMaskConfig,
) -> DenseFlow {
    let (width, height) = (source.width as usize, source.height as usize);
    let radius = config.window_radius as usize;
    let step_max = config.window_radius.max(1) as f32;

    let (grad_x, grad_y) = gradients(source);
    let product = |a: &[f32], b: &[f32]| {
        a.iter().zip(b).map(|(a, b)| a * b).collect::<Vec<_>>()
    };
    let xx = box_mean(&product(&grad_x, &grad_x), source.width, source.height, config.window_radius);
    let xy = box_mean(&product(&grad_x, &grad_y), source.width, source.height, config.window_radius);
    let yy = box_mean(&product(&grad_y, &grad_y), source.width, source.height, config.window_radius);

    flow_x
        .values
        .par_chunks_mut(width)
        .zip(flow_y.values.par_chunks_mut(width))
        .enumerate()
        .for_each(|(y, (row_u, row_v))| {
            let y_range = y.saturating_sub(radius)..(y + radius + 1).min(height);
            (0..width).for_each(|x| {
                let index = y * width + x;
                let determinant = xx[index] * yy[index] - xy[index] * xy[index];
                if !(determinant > DETERMINANT_MIN) {
                    return;
                }

                let x_range = x.saturating_sub(radius)..(x + radius + 1).min(width);
                let count = (x_range.len() * y_range.len()) as f32;
                let mut flow = Vec2::new(row_u[x], row_v[x]);
                for _ in 0..config.iteration_count {
                    // Σ ∇I · (J(q + flow) - I(q))
                    let mut b = Vec2::ZERO;
                    for q_y in y_range.clone() {
                        for q_x in x_range.clone() {
                            let q = q_y * width + q_x;
                            let residual = target.sample_bilinear(
                                q_x as f32 + flow.x,
                                q_y as f32 + flow.y,
                            ) - source.values[q];
                            b += Vec2::new(grad_x[q], grad_y[q]) * residual;
                        }
                    }
                    b /= count;

                    let delta = Vec2::new(
                        -(yy[index] * b.x - xy[index] * b.y) / determinant,
                        -(xx[index] * b.y - xy[index] * b.x) / determinant,
                    )
                    .clamp_length_max(step_max);
                    flow += delta;

                    if delta.length_squared() < STEP_EPSILON * STEP_EPSILON {
                        break;
                    }
                }
                row_u[x] = flow.x;
                row_v[x] = flow.y;
            });
        });

    let eigen_min = ScalarMap {
        height: source.height,
        values: (0..width * height)
            .map(|i| {
                let half_trace = 0.5 * (xx[i] + yy[i]);
                let root = (0.25 * (xx[i] - yy[i]).powi(2) + xy[i] * xy[i]).sqrt();
                (half_trace - root).max(0.0)
            })
            .collect(),
        width: source.width,
    };

    DenseFlow {
        eigen_min,
        flow_x,
        flow_y,
    }
}

/// Central differences with clamping at the border.
fn gradients(map: &ScalarMap) -> (Vec<f32>, Vec<f32>) {
    let (width, height) = (map.width, map.height);
    let mut grad_x = vec![0.0; (width * height) as usize];
    let mut grad_y = vec![0.0; (width * height) as usize];
    grad_x
        .par_chunks_mut(width as usize)
        .zip(grad_y.par_chunks_mut(width as usize))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| {
            let y = y as u32;
            (0..width).for_each(|x| {
                let left = map.get(x.saturating_sub(1), y);
                let right = map.get((x + 1).min(width - 1), y);
                let up = map.get(x, y.saturating_sub(1));
                let down = map.get(x, (y + 1).min(height - 1));
                row_x[x as usize] = 0.5 * (right - left);
                row_y[x as usize] = 0.5 * (down - up);
            });
        });
    (grad_x, grad_y)
}

/// The mean over a square window, shrunk at the border.
pub(crate) fn box_mean(
    values: &[f32],
    width: u32,
    height: u32,
    radius: u32,
) -> Vec<f32> {
    let (width, height, radius) = (width as usize, height as usize, radius as usize);

    let mut horizontal = vec![0.0; width * height];
    horizontal
        .par_chunks_mut(width)
        .zip(values.par_chunks(width))
        .for_each(|(output, row)| {
            (0..width).for_each(|x| {
                let window = &row[x.saturating_sub(radius)..(x + radius + 1).min(width)];
                output[x] = window.iter().sum::<f32>() / window.len() as f32;
            });
        });

    let mut output = vec![0.0; width * height];
    output
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let y_range = y.saturating_sub(radius)..(y + radius + 1).min(height);
            let count = y_range.len() as f32;
            (0..width).for_each(|x| {
                row[x] = y_range
                    .clone()
                    .map(|y| horizontal[y * width + x])
                    .sum::<f32>()
                    / count;
            });
        });
    output
}

/// Doubling the resolution and magnitude of a flow component.
fn upsample_flow(
    coarse: &ScalarMap,
    width: u32,
    height: u32,
) -> ScalarMap {
    let scale_x = coarse.width as f32 / width as f32;
    let scale_y = coarse.height as f32 / height as f32;
    let mut output = ScalarMap::new(width, height);
    output
        .values
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            row.iter_mut().enumerate().for_each(|(x, value)| {
                let x_coarse = (x as f32 + 0.5) * scale_x - 0.5;
                let y_coarse = (y as f32 + 0.5) * scale_y - 0.5;
                *value = coarse.sample_bilinear(x_coarse, y_coarse) / scale_x.min(scale_y);
            });
        });
    output
}

/// A smooth texture in `[0.25, 0.75]` moved by `shift`.
#[cfg(test)]
pub(crate) fn smooth_texture(
    width: u32,
    height: u32,
    shift: Vec2,
) -> ScalarMap {
    let mut map = ScalarMap::new(width, height);
    (0..height).for_each(|y| {
        (0..width).for_each(|x| {
            let p = Vec2::new(x as f32, y as f32) - shift;
            let value = 0.5
                + 0.12 * (p.x * 0.31).sin()
                + 0.08 * (p.y * 0.23).cos()
                + 0.05 * ((p.x + p.y) * 0.17).sin();
            map.set(x, y, value);
        });
    });
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_mean_shrinks_at_border() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let output = box_mean(&values, 3, 2, 1);
        assert_eq!(output[0], (1.0 + 2.0 + 4.0 + 5.0) / 4.0);
        assert_eq!(output[1], 21.0 / 6.0);
    }

    #[test]
    fn zero_motion() {
        let source = smooth_texture(48, 40, Vec2::ZERO);
        let flow = DenseFlow::compute(&source, &source, &FlowMaskConfig::default());

        assert!(flow.flow_x.values.iter().all(|u| *u == 0.0));
        assert!(flow.flow_y.values.iter().all(|v| *v == 0.0));
        assert!(flow.eigen_min.mean() > 0.0);
    }

    #[test]
    fn translation() {
        let shift = Vec2::new(1.5, -0.5);
        let source = smooth_texture(64, 48, Vec2::ZERO);
        let target = smooth_texture(64, 48, shift);

        [(1, 5), (3, 10), (3, 30), (1, 30)]
            .into_iter()
            .for_each(|(pyramid_levels, iteration_count)| {
                let config = FlowMaskConfig::default()
                    .with_pyramid_levels(pyramid_levels)
                    .with_iteration_count(iteration_count);
                let flow = DenseFlow::compute(&source, &target, &config);
                let mut errors = (8..40)
                    .flat_map(|y| (8..56).map(move |x| (x, y)))
                    .map(|(x, y)| (flow.get(x, y) - shift).length())
                    .collect::<Vec<_>>();
                errors.sort_by(f32::total_cmp);

                let median = errors[errors.len() / 2];
                assert!(median < 0.1, "{pyramid_levels} {iteration_count}: {median}");

                let center = flow.get(32, 24);
                assert!(
                    (center - shift).length() < 0.2,
                    "{pyramid_levels} {iteration_count}: {center}"
                );
            });
    }
}
