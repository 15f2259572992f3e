pub use super::*;

use glam::Mat2;
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, IntoParallelRefIterator, ParallelIterator};
use std::ops::AddAssign;

/// The upstream gradients of [`RenderOutput`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderOutputGrads {
    pub depth: ScalarMap,
    pub direct: Image,
    pub transmittance: ScalarMap,
}

/// The gradients of [`Gaussian3dScene`] parameters, laid out by slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Gaussian3dSceneGrads {
    /// `[S, (D + 1) ^ 2, 3]`
    pub colors_sh: Vec<f32>,
    /// `[S, 3]`
    pub log_scalings: Vec<f32>,
    /// `[S]`
    pub opacity_logits: Vec<f32>,
    /// `[S, 3]`
    pub positions: Vec<f32>,
    /// `[S, 4]`
    pub rotations: Vec<f32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderBackward {
    pub grads: Gaussian3dSceneGrads,
    /// The norm of the 2D positional gradient of each projected slot, in NDC.
    pub positions_2d_grad_norm: Vec<(usize, f32)>,
    /// As `positions_2d_grad_norm`, but of the per-pixel absolute gradients.
    pub positions_2d_grad_abs_norm: Vec<(usize, f32)>,
}

/// Gradients w.r.t. a projected splat.
#[derive(Clone, Copy, Debug, Default)]
struct ProjectedGrad {
    color_rgb: [f32; 3],
    conic: [f32; 3],
    depth: f32,
    opacity: f32,
    position_2d: Vec2,
    /// `Σ |∂L/∂p|` over pixels
    position_2d_abs: Vec2,
}

/// Gradients w.r.t. the parameters of one slot.
struct SlotGrad {
    colors_sh: [f32; 48],
    log_scaling: Vec3,
    opacity_logit: f32,
    position: Vec3,
    position_2d_grad_norm: f32,
    position_2d_grad_abs_norm: f32,
    rotation: [f32; 4],
}

impl RenderState {
    /// Back-propagating the upstream gradients to the scene parameters.
    ///
    /// The view direction of spherical harmonics is held constant.
    pub fn backward(
        &self,
        grads: &RenderOutputGrads,
    ) -> RenderBackward {
        let (width, height) = (self.camera.image_width, self.camera.image_height);
        let count = self.projected.len();

        // Per band of tiles, back-to-front per pixel
        let projected_grads = (0..height.div_ceil(TILE_SIZE))
            .into_par_iter()
            .fold(
                || vec![ProjectedGrad::default(); count],
                |mut sums, band| {
                    let mut contributions = Vec::new();
                    let y_end = ((band + 1) * TILE_SIZE).min(height);
                    for y in band * TILE_SIZE..y_end {
                        for x in 0..width {
                            contributions.clear();
                            let transmittance_final =
                                self.blend_pixel(x, y, |c| contributions.push(*c));
                            let index = (y * width + x) as usize;
                            self.backward_pixel(
                                &contributions,
                                transmittance_final,
                                grads.direct.pixels[index],
                                grads.depth.values[index],
                                grads.transmittance.values[index],
                                &mut sums,
                            );
                        }
                    }
                    sums
                },
            )
            .reduce(
                || vec![ProjectedGrad::default(); count],
                |mut lhs, rhs| {
                    lhs.iter_mut().zip(rhs).for_each(|(l, r)| *l += r);
                    lhs
                },
            );

        let slot_grads = self
            .projected
            .par_iter()
            .zip(projected_grads.par_iter())
            .map(|(projected, grad)| self.backward_gaussian(projected, grad))
            .collect::<Vec<_>>();

        let stride = self.colors_sh_stride;
        let colors_sh_count = sh_count(self.colors_sh_degree) * 3;
        let mut output = RenderBackward {
            grads: Gaussian3dSceneGrads::zeros(self.slot_count, stride),
            positions_2d_grad_norm: Vec::with_capacity(count),
            positions_2d_grad_abs_norm: Vec::with_capacity(count),
        };
        self.projected
            .iter()
            .zip(slot_grads)
            .for_each(|(projected, grad)| {
                let slot = projected.slot;
                let grads = &mut output.grads;
                grads.colors_sh[slot * stride..slot * stride + colors_sh_count]
                    .copy_from_slice(&grad.colors_sh[..colors_sh_count]);
                grads.log_scalings[slot * 3..slot * 3 + 3]
                    .copy_from_slice(&grad.log_scaling.to_array());
                grads.opacity_logits[slot] = grad.opacity_logit;
                grads.positions[slot * 3..slot * 3 + 3].copy_from_slice(&grad.position.to_array());
                grads.rotations[slot * 4..slot * 4 + 4].copy_from_slice(&grad.rotation);
                output
                    .positions_2d_grad_norm
                    .push((slot, grad.position_2d_grad_norm));
                output
                    .positions_2d_grad_abs_norm
                    .push((slot, grad.position_2d_grad_abs_norm));
            });

        output
    }

    /// Accumulating the gradients of the splats blended into one pixel.
    #[allow(clippy::too_many_arguments)]
    fn backward_pixel(
        &self,
        contributions: &[Contribution],
        transmittance_final: f32,
        grad_color: [f32; 3],
        grad_depth: f32,
        grad_transmittance: f32,
        sums: &mut [ProjectedGrad],
    ) {
        // Σ_{j > i} c_j α_j T_j and Σ_{j > i} z_j α_j T_j
        let mut suffix_color = [0.0; 3];
        let mut suffix_depth = 0.0;

        for contribution in contributions.iter().rev() {
            let projected = &self.projected[contribution.index];
            let sum = &mut sums[contribution.index];
            let weight = contribution.alpha * contribution.transmittance;
            let one_minus_alpha = 1.0 - contribution.alpha;

            let mut grad_alpha = 0.0;
            (0..3).for_each(|i| {
                sum.color_rgb[i] += grad_color[i] * weight;
                grad_alpha += grad_color[i]
                    * (projected.color_rgb[i] * contribution.transmittance
                        - suffix_color[i] / one_minus_alpha);
                suffix_color[i] += projected.color_rgb[i] * weight;
            });
            sum.depth += grad_depth * weight;
            grad_alpha += grad_depth
                * (projected.depth * contribution.transmittance - suffix_depth / one_minus_alpha);
            grad_alpha -= grad_transmittance * transmittance_final / one_minus_alpha;
            suffix_depth += projected.depth * weight;

            if contribution.is_alpha_clamped {
                continue;
            }

            // α = o * exp(power)
            sum.opacity += grad_alpha * contribution.gaussian;
            let grad_power = grad_alpha * contribution.alpha;
            let [a, b, c] = projected.conic;
            let delta = contribution.delta;
            let grad_position_2d =
                Vec2::new(a * delta.x + b * delta.y, b * delta.x + c * delta.y) * grad_power;
            sum.position_2d += grad_position_2d;
            sum.position_2d_abs += grad_position_2d.abs();
            sum.conic[0] -= 0.5 * delta.x * delta.x * grad_power;
            sum.conic[1] -= delta.x * delta.y * grad_power;
            sum.conic[2] -= 0.5 * delta.y * delta.y * grad_power;
        }
    }

    /// Chaining the gradients of a projected splat to its parameters.
    fn backward_gaussian(
        &self,
        projected: &ProjectedGaussian,
        grad: &ProjectedGrad,
    ) -> SlotGrad {
        let camera = &self.camera;
        let (f_x, f_y) = (camera.focal_length_x, camera.focal_length_y);
        let Vec3 { x, y, z } = projected.position_view;
        let z_2 = z * z;

        // Projected position and depth
        let mut grad_view = Vec3::new(
            grad.position_2d.x * f_x / z,
            grad.position_2d.y * f_y / z,
            grad.depth - (grad.position_2d.x * f_x * x + grad.position_2d.y * f_y * y) / z_2,
        );

        // Conic to the 2D covariance, dΣ2 = -Q dQ Q
        let [a, b, c] = projected.conic;
        let conic = Mat2::from_cols(Vec2::new(a, b), Vec2::new(b, c));
        let grad_conic = Mat2::from_cols(
            Vec2::new(grad.conic[0], 0.5 * grad.conic[1]),
            Vec2::new(0.5 * grad.conic[1], grad.conic[2]),
        );
        let grad_covariance_2d = conic * grad_conic * conic * -1.0;
        let grad_covariance_2d = Mat3::from_cols(
            grad_covariance_2d.x_axis.extend(0.0),
            grad_covariance_2d.y_axis.extend(0.0),
            Vec3::ZERO,
        );

        // Σ2 = T Σ3 T^T, T = J W
        let transform = projected.transform;
        let grad_covariance_3d = transform.transpose() * grad_covariance_2d * transform;
        let grad_transform = 2.0 * grad_covariance_2d * transform * projected.covariance_3d;
        let grad_jacobian = grad_transform * camera.view_rotation.transpose();

        // J = [[f_x / z, 0, -f_x r_x / z], [0, f_y / z, -f_y r_y / z], 0]
        grad_view.z -= (grad_jacobian.x_axis.x * f_x + grad_jacobian.y_axis.y * f_y) / z_2;
        let [(ratio_x, is_clamped_x), (ratio_y, is_clamped_y)] = projected.ratio;
        let grad_j_02 = grad_jacobian.z_axis.x;
        let grad_j_12 = grad_jacobian.z_axis.y;
        if is_clamped_x {
            grad_view.z += grad_j_02 * f_x * ratio_x / z_2;
        } else {
            grad_view.x -= grad_j_02 * f_x / z_2;
            grad_view.z += grad_j_02 * 2.0 * f_x * x / (z_2 * z);
        }
        if is_clamped_y {
            grad_view.z += grad_j_12 * f_y * ratio_y / z_2;
        } else {
            grad_view.y -= grad_j_12 * f_y / z_2;
            grad_view.z += grad_j_12 * 2.0 * f_y * y / (z_2 * z);
        }
        let position = camera.view_rotation.transpose() * grad_view;

        // Σ3 = L L^T, L = M S
        let scaling = Mat3::from_diagonal(projected.scaling);
        let rotation_matrix = Mat3::from_quat(projected.rotation);
        let l = rotation_matrix * scaling;
        let grad_l = 2.0 * grad_covariance_3d * l;
        let grad_rotation_matrix = grad_l * scaling;
        let grad_scaling = Vec3::new(
            rotation_matrix.x_axis.dot(grad_l.x_axis),
            rotation_matrix.y_axis.dot(grad_l.y_axis),
            rotation_matrix.z_axis.dot(grad_l.z_axis),
        );
        let log_scaling = grad_scaling * projected.scaling;

        let rotation = backward_rotation(
            projected.rotation,
            projected.rotation_norm,
            &grad_rotation_matrix,
        );

        let opacity = projected.opacity;
        let opacity_logit = grad.opacity * opacity * (1.0 - opacity);

        let mut colors_sh = [0.0; 48];
        (0..sh_count(self.colors_sh_degree)).for_each(|k| {
            (0..3).for_each(|i| {
                if !projected.color_is_clamped[i] {
                    colors_sh[k * 3 + i] = projected.colors_sh_basis[k] * grad.color_rgb[i];
                }
            });
        });

        let ndc_scale = Vec2::new(
            0.5 * camera.image_width as f32,
            0.5 * camera.image_height as f32,
        );
        let position_2d_grad_norm = (grad.position_2d * ndc_scale).length();
        let position_2d_grad_abs_norm = (grad.position_2d_abs * ndc_scale).length();

        SlotGrad {
            colors_sh,
            log_scaling,
            opacity_logit,
            position,
            position_2d_grad_norm,
            position_2d_grad_abs_norm,
            rotation,
        }
    }
}

/// Back-propagating through `M = R(q / |q|)`.
///
/// ## Returns
///
/// The gradient of the raw quaternion `(w, x, y, z)`.
fn backward_rotation(
    rotation: Quat,
    norm: f32,
    grad_matrix: &Mat3,
) -> [f32; 4] {
    if norm <= 0.0 {
        return [0.0; 4];
    }

    let (x, y, z, w) = (rotation.x, rotation.y, rotation.z, rotation.w);
    let row = Vec3::new;
    let grad_w = mat3_dot(
        grad_matrix,
        &mat3_from_rows(
            row(0.0, -2.0 * z, 2.0 * y),
            row(2.0 * z, 0.0, -2.0 * x),
            row(-2.0 * y, 2.0 * x, 0.0),
        ),
    );
    let grad_x = mat3_dot(
        grad_matrix,
        &mat3_from_rows(
            row(0.0, 2.0 * y, 2.0 * z),
            row(2.0 * y, -4.0 * x, -2.0 * w),
            row(2.0 * z, 2.0 * w, -4.0 * x),
        ),
    );
    let grad_y = mat3_dot(
        grad_matrix,
        &mat3_from_rows(
            row(-4.0 * y, 2.0 * x, 2.0 * w),
            row(2.0 * x, 0.0, 2.0 * z),
            row(-2.0 * w, 2.0 * z, -4.0 * y),
        ),
    );
    let grad_z = mat3_dot(
        grad_matrix,
        &mat3_from_rows(
            row(-4.0 * z, -2.0 * w, 2.0 * x),
            row(2.0 * w, -4.0 * z, 2.0 * y),
            row(2.0 * x, 2.0 * y, 0.0),
        ),
    );

    // q_n = q / |q|
    let normalized = [w, x, y, z];
    let grad_normalized = [grad_w, grad_x, grad_y, grad_z];
    let dot = normalized
        .iter()
        .zip(grad_normalized)
        .map(|(q, g)| q * g)
        .sum::<f32>();
    [0, 1, 2, 3].map(|i| (grad_normalized[i] - normalized[i] * dot) / norm)
}

impl Gaussian3dSceneGrads {
    pub fn zeros(
        slot_count: usize,
        colors_sh_stride: usize,
    ) -> Self {
        Self {
            colors_sh: vec![0.0; slot_count * colors_sh_stride],
            log_scalings: vec![0.0; slot_count * 3],
            opacity_logits: vec![0.0; slot_count],
            positions: vec![0.0; slot_count * 3],
            rotations: vec![0.0; slot_count * 4],
        }
    }

    pub fn is_finite(&self) -> bool {
        self.colors_sh
            .iter()
            .chain(&self.log_scalings)
            .chain(&self.opacity_logits)
            .chain(&self.positions)
            .chain(&self.rotations)
            .all(|v| v.is_finite())
    }
}

impl AddAssign for ProjectedGrad {
    #[inline]
    fn add_assign(
        &mut self,
        rhs: Self,
    ) {
        (0..3).for_each(|i| {
            self.color_rgb[i] += rhs.color_rgb[i];
            self.conic[i] += rhs.conic[i];
        });
        self.depth += rhs.depth;
        self.opacity += rhs.opacity;
        self.position_2d += rhs.position_2d;
        self.position_2d_abs += rhs.position_2d_abs;
    }
}
