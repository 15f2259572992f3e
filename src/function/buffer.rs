//! Dense per-pixel buffers in row-major order.

/// An RGB image with linear values, nominally in `[0, 1]`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Image {
    pub height: u32,
    /// `[I_y * I_x]`
    pub pixels: Vec<[f32; 3]>,
    pub width: u32,
}

/// A single-channel map, e.g. depth, alpha or mask.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScalarMap {
    pub height: u32,
    /// `[I_y * I_x]`
    pub values: Vec<f32>,
    pub width: u32,
}

impl Image {
    #[inline]
    pub fn new(
        width: u32,
        height: u32,
    ) -> Self {
        Self::filled(width, height, [0.0; 3])
    }

    #[inline]
    pub fn filled(
        width: u32,
        height: u32,
        color_rgb: [f32; 3],
    ) -> Self {
        Self {
            height,
            pixels: vec![color_rgb; width as usize * height as usize],
            width,
        }
    }

    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.pixels.len()
    }

    #[inline]
    pub fn get(
        &self,
        x: u32,
        y: u32,
    ) -> [f32; 3] {
        self.pixels[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(
        &mut self,
        x: u32,
        y: u32,
        color_rgb: [f32; 3],
    ) {
        self.pixels[(y * self.width + x) as usize] = color_rgb;
    }

    #[inline]
    pub fn has_same_size(
        &self,
        other: &Self,
    ) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Rec. 601 luma.
    pub fn luminance(&self) -> ScalarMap {
        ScalarMap {
            height: self.height,
            values: self
                .pixels
                .iter()
                .map(|[r, g, b]| 0.299 * r + 0.587 * g + 0.114 * b)
                .collect(),
            width: self.width,
        }
    }

    /// Sampling with bilinear interpolation and clamping at the border.
    pub fn sample_bilinear(
        &self,
        x: f32,
        y: f32,
    ) -> [f32; 3] {
        let (x0, y0, x1, y1, tx, ty) =
            bilinear_taps(self.width, self.height, x, y);
        let p00 = self.get(x0, y0);
        let p10 = self.get(x1, y0);
        let p01 = self.get(x0, y1);
        let p11 = self.get(x1, y1);
        [0, 1, 2].map(|c| {
            let top = p00[c] + (p10[c] - p00[c]) * tx;
            let bottom = p01[c] + (p11[c] - p01[c]) * tx;
            top + (bottom - top) * ty
        })
    }

    /// Box-averaging by an integer factor.
    pub fn downscale(
        &self,
        factor: u32,
    ) -> Self {
        if factor <= 1 {
            return self.to_owned();
        }

        let width = (self.width / factor).max(1);
        let height = (self.height / factor).max(1);
        let mut output = Self::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let mut sum = [0.0; 3];
                let mut count = 0.0;
                for sy in y * factor..((y + 1) * factor).min(self.height) {
                    for sx in x * factor..((x + 1) * factor).min(self.width) {
                        let p = self.get(sx, sy);
                        sum.iter_mut().zip(p).for_each(|(s, v)| *s += v);
                        count += 1.0;
                    }
                }
                output.set(x, y, sum.map(|s| s / count));
            }
        }
        output
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.pixels.iter().flatten().all(|v| v.is_finite())
    }

    /// Clamping every value into `[0, 1]`.
    pub fn clamped(&self) -> Self {
        Self {
            height: self.height,
            pixels: self
                .pixels
                .iter()
                .map(|p| p.map(|v| v.clamp(0.0, 1.0)))
                .collect(),
            width: self.width,
        }
    }
}

impl ScalarMap {
    #[inline]
    pub fn new(
        width: u32,
        height: u32,
    ) -> Self {
        Self::filled(width, height, 0.0)
    }

    #[inline]
    pub fn filled(
        width: u32,
        height: u32,
        value: f32,
    ) -> Self {
        Self {
            height,
            values: vec![value; width as usize * height as usize],
            width,
        }
    }

    #[inline]
    pub fn get(
        &self,
        x: u32,
        y: u32,
    ) -> f32 {
        self.values[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(
        &mut self,
        x: u32,
        y: u32,
        value: f32,
    ) {
        self.values[(y * self.width + x) as usize] = value;
    }

    /// Sampling with bilinear interpolation and clamping at the border.
    pub fn sample_bilinear(
        &self,
        x: f32,
        y: f32,
    ) -> f32 {
        let (x0, y0, x1, y1, tx, ty) =
            bilinear_taps(self.width, self.height, x, y);
        let top = self.get(x0, y0) + (self.get(x1, y0) - self.get(x0, y0)) * tx;
        let bottom =
            self.get(x0, y1) + (self.get(x1, y1) - self.get(x0, y1)) * tx;
        top + (bottom - top) * ty
    }

    /// Box-averaging by an integer factor.
    pub fn downscale(
        &self,
        factor: u32,
    ) -> Self {
        if factor <= 1 {
            return self.to_owned();
        }

        let width = (self.width / factor).max(1);
        let height = (self.height / factor).max(1);
        let mut output = Self::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let mut sum = 0.0;
                let mut count = 0.0;
                for sy in y * factor..((y + 1) * factor).min(self.height) {
                    for sx in x * factor..((x + 1) * factor).min(self.width) {
                        sum += self.get(sx, sy);
                        count += 1.0;
                    }
                }
                output.set(x, y, sum / count);
            }
        }
        output
    }

    #[inline]
    pub fn mean(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }

    #[inline]
    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }
}

/// `(x_0, y_0, x_1, y_1, t_x, t_y)`
#[inline]
fn bilinear_taps(
    width: u32,
    height: u32,
    x: f32,
    y: f32,
) -> (u32, u32, u32, u32, f32, f32) {
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    (x0, y0, x1, y1, x - x0 as f32, y - y0 as f32)
}

#[cfg(test)]
mod tests {
    #[test]
    fn downscale_averages() {
        use super::*;

        let mut image = Image::new(4, 2);
        image.set(0, 0, [1.0, 0.0, 0.0]);
        image.set(1, 1, [1.0, 1.0, 1.0]);

        let output = image.downscale(2);
        assert_eq!((output.width, output.height), (2, 1));
        assert_eq!(output.get(0, 0), [0.5, 0.25, 0.25]);
        assert_eq!(output.get(1, 0), [0.0; 3]);
    }

    #[test]
    fn sample_bilinear_clamps_and_interpolates() {
        use super::*;

        let map = ScalarMap {
            height: 1,
            values: vec![0.0, 1.0],
            width: 2,
        };
        assert_eq!(map.sample_bilinear(0.5, 0.0), 0.5);
        assert_eq!(map.sample_bilinear(-3.0, 0.0), 0.0);
        assert_eq!(map.sample_bilinear(7.0, 9.0), 1.0);
    }

    #[test]
    fn luminance_of_white_is_one() {
        use super::*;

        let output = Image::filled(3, 3, [1.0; 3]).luminance();
        assert!(output.values.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }
}
