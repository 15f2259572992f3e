//! Global affine motion of the camera in the image plane.

pub use super::*;
pub use glam::{DMat3, DVec3};

/// The rounds of trimming outliers.
const REFIT_COUNT: usize = 3;

/// `flow(x, y) = [u · φ, v · φ]` with `φ = (1, x', y')` in normalized coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineMotion {
    pub center: Vec2,
    pub scale: f32,
    pub u: DVec3,
    pub v: DVec3,
}

impl AffineMotion {
    /// Fitting by weighted least squares, refitted without outliers.
    ///
    /// `None` if the inliers do not constrain the motion.
    pub fn fit_robust(
        flow: &DenseFlow,
        valid: &[bool],
    ) -> Option<Self> {
        // Starting from the median translation
        let (width, height) = (flow.flow_x.width, flow.flow_x.height);
        let median = |values: &[f32]| {
            let mut values = values
                .iter()
                .zip(valid)
                .filter_map(|(value, valid)| valid.then_some(*value))
                .collect::<Vec<_>>();
            values.sort_by(f32::total_cmp);
            values.get(values.len() / 2).copied()
        };
        let mut motion = Self {
            center: Vec2::new(width as f32 * 0.5, height as f32 * 0.5),
            scale: width.max(height).max(1) as f32,
            u: DVec3::new(median(&flow.flow_x.values)? as f64, 0.0, 0.0),
            v: DVec3::new(median(&flow.flow_y.values)? as f64, 0.0, 0.0),
        };

        for round in 0..REFIT_COUNT {
            let residuals = motion.residuals(flow, valid);
            let mut sorted = residuals.iter().flatten().copied().collect::<Vec<_>>();
            if sorted.is_empty() {
                return None;
            }
            sorted.sort_by(f32::total_cmp);
            let threshold = (3.0 * sorted[sorted.len() / 2]).max(0.5);

            let inliers = residuals
                .iter()
                .map(|r| r.is_some_and(|r| r <= threshold))
                .collect::<Vec<_>>();
            match Self::fit(flow, &inliers) {
                Some(refit) => motion = refit,
                None if round == 0 => return None,
                None => break,
            }
        }

        Some(motion)
    }

    /// Fitting by least squares weighted by the minimum eigenvalue.
    pub fn fit(
        flow: &DenseFlow,
        valid: &[bool],
    ) -> Option<Self> {
        let (width, height) = (flow.flow_x.width, flow.flow_x.height);
        let center = Vec2::new(width as f32 * 0.5, height as f32 * 0.5);
        let scale = width.max(height).max(1) as f32;

        let mut normal = DMat3::ZERO;
        let mut rhs_u = DVec3::ZERO;
        let mut rhs_v = DVec3::ZERO;
        for y in 0..height {
            for x in 0..width {
                let index = (y * width + x) as usize;
                if !valid[index] {
                    continue;
                }
                let weight = flow.eigen_min.values[index] as f64;
                let basis = Self::basis(center, scale, x, y);
                normal += DMat3::from_cols(basis * basis.x, basis * basis.y, basis * basis.z)
                    * weight;
                rhs_u += basis * (flow.flow_x.values[index] as f64 * weight);
                rhs_v += basis * (flow.flow_y.values[index] as f64 * weight);
            }
        }

        let determinant = normal.determinant();
        if !(determinant.abs() > 1e-18) {
            return None;
        }
        let inverse = normal.inverse();

        Some(Self {
            center,
            scale,
            u: inverse * rhs_u,
            v: inverse * rhs_v,
        })
    }

    #[inline]
    fn basis(
        center: Vec2,
        scale: f32,
        x: u32,
        y: u32,
    ) -> DVec3 {
        DVec3::new(
            1.0,
            ((x as f32 - center.x) / scale) as f64,
            ((y as f32 - center.y) / scale) as f64,
        )
    }

    /// The flow explained by camera motion at a pixel.
    #[inline]
    pub fn flow_at(
        &self,
        x: u32,
        y: u32,
    ) -> Vec2 {
        let basis = Self::basis(self.center, self.scale, x, y);
        Vec2::new(self.u.dot(basis) as f32, self.v.dot(basis) as f32)
    }

    /// `|flow - affine|` of valid pixels.
    pub fn residuals(
        &self,
        flow: &DenseFlow,
        valid: &[bool],
    ) -> Vec<Option<f32>> {
        let width = flow.flow_x.width;
        valid
            .iter()
            .enumerate()
            .map(|(index, valid)| {
                let (x, y) = (index as u32 % width, index as u32 / width);
                valid.then(|| (flow.get(x, y) - self.flow_at(x, y)).length())
            })
            .collect()
    }
}
