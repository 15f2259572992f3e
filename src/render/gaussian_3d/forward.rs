pub use super::*;

use rayon::{
    iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator},
    slice::ParallelSliceMut,
};

impl Gaussian3dScene {
    /// Projecting the alive splats in front of the camera.
    ///
    /// ## Returns
    ///
    /// The splats overlapping the image, sorted front-to-back by view depth
    /// with ties broken by slot.
    pub fn query_visible(
        &self,
        camera: &Camera,
        options: &Gaussian3dRenderOptions,
    ) -> Vec<ProjectedGaussian> {
        let colors_sh_degree = options.colors_sh_degree.min(self.colors_sh_degree_max);
        let slots = self.slots().collect::<Vec<_>>();
        let mut projected = slots
            .par_iter()
            .filter_map(|slot| {
                project(self, *slot, camera, options.clip_threshold, colors_sh_degree)
            })
            .collect::<Vec<_>>();
        projected.sort_by(|a, b| a.depth.total_cmp(&b.depth).then(a.slot.cmp(&b.slot)));
        projected
    }

    /// Rasterizing the direct radiance, depth and transmittance.
    pub fn render(
        &self,
        camera: &Camera,
        options: &Gaussian3dRenderOptions,
    ) -> RenderOutput {
        let (width, height) = (camera.image_width, camera.image_height);
        let tile_count_x = width.div_ceil(TILE_SIZE);
        let tile_count_y = height.div_ceil(TILE_SIZE);

        let projected = self.query_visible(camera, options);

        // [T_y * T_x, ...]
        let mut tiles = vec![Vec::new(); (tile_count_x * tile_count_y) as usize];
        projected.iter().enumerate().for_each(|(index, p)| {
            let [x_min, y_min, x_max, y_max] = p.tile_rect;
            for tile_y in y_min..y_max {
                for tile_x in x_min..x_max {
                    tiles[(tile_y * tile_count_x + tile_x) as usize].push(index as u32);
                }
            }
        });

        let state = RenderState {
            camera: *camera,
            colors_sh_degree: options.colors_sh_degree.min(self.colors_sh_degree_max),
            colors_sh_stride: self.colors_sh_stride(),
            projected,
            slot_count: self.slot_count(),
            tiles,
            tile_count_x,
        };

        let mut direct = Image::new(width, height);
        let mut depth = ScalarMap::new(width, height);
        let mut transmittance = ScalarMap::filled(width, height, 1.0);
        let band_len = (width * TILE_SIZE) as usize;

        // Each band is a row of tiles.
        direct
            .pixels
            .par_chunks_mut(band_len)
            .zip(depth.values.par_chunks_mut(band_len))
            .zip(transmittance.values.par_chunks_mut(band_len))
            .enumerate()
            .for_each(|(band, ((direct, depth), transmittance))| {
                let y_start = band as u32 * TILE_SIZE;
                direct.iter_mut().enumerate().for_each(|(offset, color)| {
                    let x = offset as u32 % width;
                    let y = y_start + offset as u32 / width;
                    let mut depth_sum = 0.0;
                    transmittance[offset] = state.blend_pixel(x, y, |c| {
                        let projected = &state.projected[c.index];
                        let weight = c.alpha * c.transmittance;
                        (0..3).for_each(|i| color[i] += projected.color_rgb[i] * weight);
                        depth_sum += projected.depth * weight;
                    });
                    depth[offset] = depth_sum;
                });
            });

        let alpha = ScalarMap {
            height,
            values: transmittance.values.iter().map(|t| 1.0 - t).collect(),
            width,
        };

        #[cfg(all(debug_assertions, not(test)))]
        log::debug!(
            target: "aquasplat::trainer::render::gaussian_3d",
            "render > projected ({}) of point_count ({})",
            state.projected.len(),
            self.point_count(),
        );

        RenderOutput {
            alpha,
            depth,
            direct,
            state,
            transmittance,
        }
    }
}

/// The projective Jacobian in view space.
///
/// ## Returns
///
/// The Jacobian and the clamped ratios `x / z` and `y / z`.
fn jacobian(
    camera: &Camera,
    position_view: Vec3,
) -> (Mat3, [(f32, bool); 2]) {
    let Vec3 { x, y, z } = position_view;
    let limit_x = 1.3 * camera.tan_half_field_of_view_x();
    let limit_y = 1.3 * camera.tan_half_field_of_view_y();
    let ratio_x = (x / z).clamp(-limit_x, limit_x);
    let ratio_y = (y / z).clamp(-limit_y, limit_y);
    let (f_x, f_y) = (camera.focal_length_x, camera.focal_length_y);

    let jacobian = mat3_from_rows(
        Vec3::new(f_x / z, 0.0, -f_x * ratio_x / z),
        Vec3::new(0.0, f_y / z, -f_y * ratio_y / z),
        Vec3::ZERO,
    );
    (
        jacobian,
        [
            (ratio_x, ratio_x != x / z),
            (ratio_y, ratio_y != y / z),
        ],
    )
}

fn project(
    scene: &Gaussian3dScene,
    slot: usize,
    camera: &Camera,
    clip_threshold: f32,
    colors_sh_degree: u32,
) -> Option<ProjectedGaussian> {
    let position = scene.position(slot);
    let position_view = camera.view_rotation * position + camera.view_translation;
    let depth = position_view.z;
    if !(depth > clip_threshold) {
        return None;
    }

    // Σ3 = M S S^T M^T
    let scaling = scene.scaling(slot);
    let rotation = scene.rotation(slot);
    let rotation_norm = {
        let [w, x, y, z] = scene.rotation_raw(slot);
        let norm = (w * w + x * x + y * y + z * z).sqrt();
        if norm > f32::EPSILON && norm.is_finite() {
            norm
        } else {
            0.0
        }
    };
    let l = Mat3::from_quat(rotation) * Mat3::from_diagonal(scaling);
    let covariance_3d = l * l.transpose();

    // Σ2 = J W Σ3 W^T J^T
    let (jacobian, ratio) = jacobian(camera, position_view);
    let transform = jacobian * camera.view_rotation;
    let covariance_2d = transform * covariance_3d * transform.transpose();
    let a = covariance_2d.x_axis.x + FILTER_LOW_PASS;
    let b = covariance_2d.y_axis.x;
    let c = covariance_2d.y_axis.y + FILTER_LOW_PASS;
    let determinant = a * c - b * b;
    if !(determinant > 0.0) {
        return None;
    }
    let conic = [c / determinant, -b / determinant, a / determinant];

    let middle = 0.5 * (a + c);
    let lambda_max = middle + (middle * middle - determinant).max(0.1).sqrt();
    let radius = (3.0 * lambda_max.sqrt()).ceil();

    let position_2d = Vec2::new(
        camera.focal_length_x * position_view.x / depth + camera.principal_point_x,
        camera.focal_length_y * position_view.y / depth + camera.principal_point_y,
    );
    if !position_2d.is_finite() || !radius.is_finite() {
        return None;
    }

    let tile_count_x = camera.image_width.div_ceil(TILE_SIZE) as f32;
    let tile_count_y = camera.image_height.div_ceil(TILE_SIZE) as f32;
    let tile = TILE_SIZE as f32;
    let tile_rect = [
        ((position_2d.x - radius) / tile).floor().clamp(0.0, tile_count_x) as u32,
        ((position_2d.y - radius) / tile).floor().clamp(0.0, tile_count_y) as u32,
        ((position_2d.x + radius) / tile + 1.0).floor().clamp(0.0, tile_count_x) as u32,
        ((position_2d.y + radius) / tile + 1.0).floor().clamp(0.0, tile_count_y) as u32,
    ];
    if tile_rect[0] >= tile_rect[2] || tile_rect[1] >= tile_rect[3] {
        return None;
    }

    // Colour from spherical harmonics, shifted by 0.5 and clamped at 0
    let direction = (position - camera.view_position()).normalize_or_zero();
    let mut colors_sh_basis = [0.0; 16];
    sh_basis(colors_sh_degree, direction.to_array(), &mut colors_sh_basis);
    let colors_sh = scene.colors_sh_of(slot);
    let mut color_rgb = [0.5; 3];
    (0..sh_count(colors_sh_degree)).for_each(|k| {
        (0..3).for_each(|i| color_rgb[i] += colors_sh_basis[k] * colors_sh[k * 3 + i]);
    });
    let color_is_clamped = color_rgb.map(|v| v < 0.0);
    let color_rgb = color_rgb.map(|v| v.max(0.0));

    Some(ProjectedGaussian {
        color_is_clamped,
        color_rgb,
        colors_sh_basis,
        conic,
        covariance_3d,
        depth,
        opacity: scene.opacity(slot),
        position_2d,
        position_view,
        radius,
        ratio,
        rotation,
        rotation_norm,
        scaling,
        slot,
        tile_rect,
        transform,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene_of(points: &[([f32; 3], f32, f32, [f32; 3])]) -> Gaussian3dScene {
        let mut scene = Gaussian3dScene::new(0);
        points.iter().for_each(|(position, scaling, opacity, color)| {
            scene.insert(&crate::scene::Gaussian3dPoint::new(
                0, *position, *scaling, *opacity, *color,
            ));
        });
        scene
    }

    fn camera() -> Camera {
        Camera::new_centered(0, 0, 32, 24, 30.0, Mat3::IDENTITY, Vec3::ZERO)
    }

    #[test]
    fn query_visible_sorts_front_to_back_and_culls() {
        let scene = scene_of(&[
            ([0.0, 0.0, 3.0], 0.1, 0.5, [1.0; 3]),
            ([0.0, 0.0, -1.0], 0.1, 0.5, [1.0; 3]),
            ([0.0, 0.0, 1.0], 0.1, 0.5, [1.0; 3]),
            ([100.0, 0.0, 1.0], 0.1, 0.5, [1.0; 3]),
            ([0.1, 0.0, 1.0], 0.1, 0.5, [1.0; 3]),
        ]);

        let output = scene.query_visible(&camera(), &Default::default());
        let slots = output.iter().map(|p| p.slot).collect::<Vec<_>>();
        assert_eq!(slots, [2, 4, 0]);
        assert_eq!(output[0].depth, 1.0);
        assert_eq!(output[0].position_2d, Vec2::new(16.0, 12.0));
    }

    #[test]
    fn render_empty_scene() {
        let scene = Gaussian3dScene::new(0);
        let output = scene.render(&camera(), &Default::default());

        assert!(output.direct.pixels.iter().all(|p| *p == [0.0; 3]));
        assert!(output.depth.values.iter().all(|d| *d == 0.0));
        assert!(output.transmittance.values.iter().all(|t| *t == 1.0));
        assert!(output.alpha.values.iter().all(|a| *a == 0.0));
    }

    #[test]
    fn render_center_splat() {
        let scene = scene_of(&[([0.0, 0.0, 2.0], 0.2, 0.9, [1.0, 0.5, 0.0])]);
        let output = scene.render(&camera(), &Default::default());

        let center = output.direct.get(16, 12);
        assert!(center[0] > 0.5 && center[1] > 0.25, "{center:?}");
        assert!(center[2].abs() < 1e-6, "{center:?}");
        assert!((center[0] - 2.0 * center[1]).abs() < 1e-5, "{center:?}");

        let alpha = output.alpha.get(16, 12);
        let depth = output.depth.get(16, 12);
        assert!((depth - 2.0 * alpha).abs() < 1e-5, "{depth} != 2 * {alpha}");
        assert_eq!(output.alpha.get(0, 0), 0.0);
    }

    #[test]
    fn alpha_accumulates_monotonically() {
        let layers = (0..12)
            .map(|i| ([0.0, 0.0, 1.0 + 0.5 * i as f32], 0.3, 0.6, [0.5; 3]))
            .collect::<Vec<_>>();
        let camera = camera();

        let alphas = (0..=layers.len())
            .map(|count| {
                let scene = scene_of(&layers[..count]);
                scene.render(&camera, &Default::default()).alpha
            })
            .collect::<Vec<_>>();

        alphas.windows(2).for_each(|pair| {
            pair[0]
                .values
                .iter()
                .zip(&pair[1].values)
                .for_each(|(before, after)| {
                    assert!(after >= before, "{after} < {before}");
                    assert!((0.0..=1.0).contains(after));
                });
        });

        let transmittance_min = scene_of(&layers)
            .render(&camera, &Default::default())
            .transmittance
            .values
            .into_iter()
            .fold(1.0, f32::min);
        assert!(transmittance_min >= TRANSMITTANCE_MIN, "{transmittance_min}");
        assert!(transmittance_min < 0.05, "{transmittance_min}");
    }

    #[test]
    fn saturation_skips_splats_behind() {
        let front = ([0.0, 0.0, 1.0], 2.0, 0.9999, [1.0, 0.0, 0.0]);
        let back = ([0.0, 0.0, 3.0], 2.0, 0.9999, [0.0, 1.0, 0.0]);
        let scene = scene_of(&[front; 3].into_iter().chain([back]).collect::<Vec<_>>());

        let output = scene.render(&camera(), &Default::default());
        let center = output.direct.get(16, 12);
        assert_eq!(center[1], 0.0, "{center:?}");
        assert!(center[0] > 0.98, "{center:?}");
        assert!(output.transmittance.get(16, 12) >= TRANSMITTANCE_MIN);
    }

    #[test]
    fn color_depends_on_view_direction() {
        let mut scene = Gaussian3dScene::new(1);
        [[-0.5, 0.0, 2.0], [0.5, 0.0, 2.0]].into_iter().for_each(|position| {
            let mut point = crate::scene::Gaussian3dPoint::new(1, position, 0.1, 0.5, [0.5; 3]);
            // The red coefficient of `-x`
            point.colors_sh[3 * 3] = 1.0;
            scene.insert(&point);
        });

        let options = Gaussian3dRenderOptions::default().with_colors_sh_degree(1);
        let output = scene.query_visible(&camera(), &options);
        assert_eq!(output.len(), 2);

        let [left, right] = [0, 1].map(|slot| {
            output
                .iter()
                .find(|p| p.slot == slot)
                .map(|p| p.color_rgb)
                .unwrap()
        });
        assert!(left[0] > 0.5 && right[0] < 0.5, "{left:?} {right:?}");
        assert!((left[1] - right[1]).abs() < 1e-6, "{left:?} {right:?}");
        assert!((left[0] - 0.5 + right[0] - 0.5).abs() < 1e-5, "{left:?} {right:?}");

        let options = options.with_colors_sh_degree(0);
        let output = scene.query_visible(&camera(), &options);
        output.iter().for_each(|p| assert!((p.color_rgb[0] - 0.5).abs() < 1e-5));
    }
}
