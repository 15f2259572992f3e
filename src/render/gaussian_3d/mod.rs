//! A tiled rasterizer of 3D Gaussian splats with exact gradients.
//!
//! Splats are composited front-to-back per pixel. A splat whose blending
//! would drop the transmittance below [`TRANSMITTANCE_MIN`] saturates the
//! pixel, and it and every splat behind it are skipped.

pub mod backward;
pub mod forward;

pub use crate::{dataset::Camera, function::*, scene::Gaussian3dScene};
pub use backward::*;
pub use burn::config::Config;
pub use glam::{Mat3, Quat, Vec2, Vec3};

use std::fmt;

/// The upper bound of alpha per splat.
pub const ALPHA_MAX: f32 = 0.99;

/// Contributions with a lower alpha are skipped.
pub const ALPHA_MIN: f32 = 1.0 / 255.0;

/// The variance added to the 2D covariance, in pixels.
pub const FILTER_LOW_PASS: f32 = 0.3;

/// The side length of a square tile, in pixels.
pub const TILE_SIZE: u32 = 16;

/// The saturation point of the transmittance.
pub const TRANSMITTANCE_MIN: f32 = 1e-4;

#[derive(Config, Copy, Debug, PartialEq)]
pub struct Gaussian3dRenderOptions {
    /// Splats nearer than this view depth are culled.
    #[config(default = "0.2")]
    pub clip_threshold: f32,

    /// The active degree of spherical harmonics.
    #[config(default = "SH_DEGREE_MAX")]
    pub colors_sh_degree: u32,
}

/// A splat projected onto the image plane.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectedGaussian {
    pub color_is_clamped: [bool; 3],
    pub color_rgb: [f32; 3],
    /// The basis of spherical harmonics in the view direction.
    pub colors_sh_basis: [f32; 16],
    /// `(A, B, C)` of the inverse 2D covariance `[[A, B], [B, C]]`.
    pub conic: [f32; 3],
    pub covariance_3d: Mat3,
    /// The view depth.
    pub depth: f32,
    pub opacity: f32,
    /// In pixels.
    pub position_2d: Vec2,
    pub position_view: Vec3,
    pub radius: f32,
    /// The clamped `x / z` and `y / z`, and whether each is clamped.
    pub ratio: [(f32, bool); 2],
    /// Normalized.
    pub rotation: Quat,
    /// The norm of the raw quaternion, zero if degenerate.
    pub rotation_norm: f32,
    pub scaling: Vec3,
    pub slot: usize,
    /// `[x_min, y_min, x_max, y_max)` in tiles.
    pub tile_rect: [u32; 4],
    /// The projective Jacobian times the view rotation.
    pub transform: Mat3,
}

/// The outputs of [`Gaussian3dScene::render`].
#[derive(Clone, Debug, PartialEq)]
pub struct RenderOutput {
    /// `1 - T_final`
    pub alpha: ScalarMap,
    /// `Σ T_i α_i z_i`, zero where nothing is hit.
    pub depth: ScalarMap,
    /// `Σ T_i α_i c_i`
    pub direct: Image,
    pub state: RenderState,
    /// `T_final`
    pub transmittance: ScalarMap,
}

/// The forward state kept for [`RenderState::backward`].
#[derive(Clone, PartialEq)]
pub struct RenderState {
    pub camera: Camera,
    pub colors_sh_degree: u32,
    pub colors_sh_stride: usize,
    /// Sorted front-to-back.
    pub projected: Vec<ProjectedGaussian>,
    pub slot_count: usize,
    /// Indices into `projected` per tile, front-to-back.
    pub tiles: Vec<Vec<u32>>,
    pub tile_count_x: u32,
}

/// One splat blended into one pixel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Contribution {
    pub alpha: f32,
    /// The pixel center minus the projected position.
    pub delta: Vec2,
    /// `exp(power)`
    pub gaussian: f32,
    pub index: usize,
    pub is_alpha_clamped: bool,
    /// The transmittance in front of the splat.
    pub transmittance: f32,
}

impl RenderState {
    #[inline]
    pub fn tile_list(
        &self,
        tile_x: u32,
        tile_y: u32,
    ) -> &[u32] {
        &self.tiles[(tile_y * self.tile_count_x + tile_x) as usize]
    }

    /// Blending the splats of a tile into the pixel at `(x, y)`.
    ///
    /// ## Returns
    ///
    /// The final transmittance.
    pub fn blend_pixel(
        &self,
        x: u32,
        y: u32,
        mut visit: impl FnMut(&Contribution),
    ) -> f32 {
        let list = self.tile_list(x / TILE_SIZE, y / TILE_SIZE);
        let pixel = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
        let mut transmittance = 1.0;

        for index in list {
            let index = *index as usize;
            let projected = &self.projected[index];
            let delta = pixel - projected.position_2d;
            let [a, b, c] = projected.conic;
            let power = -0.5 * (a * delta.x * delta.x + c * delta.y * delta.y)
                - b * delta.x * delta.y;
            if power > 0.0 {
                continue;
            }

            let gaussian = power.exp();
            let alpha_raw = projected.opacity * gaussian;
            let alpha = alpha_raw.min(ALPHA_MAX);
            if alpha < ALPHA_MIN {
                continue;
            }

            let transmittance_next = transmittance * (1.0 - alpha);
            if transmittance_next < TRANSMITTANCE_MIN {
                break;
            }

            visit(&Contribution {
                alpha,
                delta,
                gaussian,
                index,
                is_alpha_clamped: alpha_raw > ALPHA_MAX,
                transmittance,
            });
            transmittance = transmittance_next;
        }

        transmittance
    }
}

impl Default for Gaussian3dRenderOptions {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RenderState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("RenderState")
            .field("camera", &self.camera)
            .field("colors_sh_degree", &self.colors_sh_degree)
            .field("projected.len()", &self.projected.len())
            .field("slot_count", &self.slot_count)
            .field("tiles.len()", &self.tiles.len())
            .finish()
    }
}

/// A matrix from its rows.
#[inline]
pub(crate) fn mat3_from_rows(
    row_0: Vec3,
    row_1: Vec3,
    row_2: Vec3,
) -> Mat3 {
    Mat3::from_cols(row_0, row_1, row_2).transpose()
}

/// The Frobenius inner product.
#[inline]
pub(crate) fn mat3_dot(
    lhs: &Mat3,
    rhs: &Mat3,
) -> f32 {
    lhs.x_axis.dot(rhs.x_axis) + lhs.y_axis.dot(rhs.y_axis) + lhs.z_axis.dot(rhs.z_axis)
}
