pub use super::*;
pub use burn::config::Config;

use kiddo::{KdTree, SquaredEuclidean};
use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};

#[derive(Config, Copy, Debug, PartialEq)]
pub struct Gaussian3dSceneConfig {
    #[config(default = "SH_DEGREE_MAX")]
    pub colors_sh_degree_max: u32,

    /// The count of nearest neighbours to estimate the initial scaling.
    #[config(default = "3")]
    pub neighbor_count: u32,

    #[config(default = "0.1")]
    pub opacity: f32,
}

impl Gaussian3dSceneConfig {
    /// Initializing one splat per sparse point.
    pub fn init(
        &self,
        points: &[Point],
    ) -> Result<Gaussian3dScene, Error> {
        if points.is_empty() {
            return Err(Error::EmptyPoints);
        }
        if self.colors_sh_degree_max > SH_DEGREE_MAX {
            return Err(Error::InvalidConfig(format!(
                "colors_sh_degree_max should be no more than {SH_DEGREE_MAX}"
            )));
        }
        if !(self.opacity > 0.0 && self.opacity < 1.0) {
            return Err(Error::InvalidConfig(
                "opacity should be in (0, 1)".into(),
            ));
        }

        let distances = nearest_mean_square_distances(
            points,
            self.neighbor_count.max(1) as usize,
        );

        let mut scene = Gaussian3dScene::new(self.colors_sh_degree_max);
        points
            .iter()
            .zip(distances)
            .for_each(|(point, distance_2)| {
                let scaling = distance_2.max(1e-7).sqrt();
                scene.insert(&Gaussian3dPoint::new(
                    self.colors_sh_degree_max,
                    point.position,
                    scaling,
                    self.opacity,
                    point.color_rgb,
                ));
            });

        #[cfg(all(debug_assertions, not(test)))]
        log::debug!(
            target: "aquasplat::trainer::scene::gaussian_3d",
            "Gaussian3dSceneConfig::init > point_count ({})",
            scene.point_count(),
        );

        Ok(scene)
    }
}

/// The mean squared distance from each point to its nearest neighbours.
///
/// A lonely point gets `1.0`.
fn nearest_mean_square_distances(
    points: &[Point],
    neighbor_count: usize,
) -> Vec<f32> {
    let positions = points.iter().map(|point| point.position).collect::<Vec<_>>();
    let tree: KdTree<f32, 3> = (&positions).into();

    positions
        .par_iter()
        .enumerate()
        .map(|(index, position)| {
            // The point itself is among its nearest
            let distances = tree
                .nearest_n::<SquaredEuclidean>(position, neighbor_count + 1)
                .into_iter()
                .filter(|neighbor| neighbor.item != index as u64)
                .take(neighbor_count)
                .map(|neighbor| neighbor.distance)
                .collect::<Vec<_>>();

            if distances.is_empty() {
                1.0
            } else {
                distances.iter().sum::<f32>() / distances.len() as f32
            }
        })
        .collect()
}

impl Default for Gaussian3dSceneConfig {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
