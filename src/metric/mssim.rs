pub use super::*;

use burn::tensor::{module::conv2d, ops::ConvOptions, TensorData};

/// The side length of the Gaussian window.
pub const WINDOW_SIZE: usize = 11;

/// The standard deviation of the Gaussian window.
pub const WINDOW_STD: f64 = 1.5;

/// Computing the mean of structural similarity index (MSSIM) between the inputs
/// using the approaches described in the paper:
///
/// *Wang, J., Bovik, A. C., Sheikh, H. R., & Simoncelli, E. P. (2004). Image quality assessment: from error visibility to structural similarity. IEEE Transactions on Image Processing, 13(4), 600–612.*
/// https://www.cns.nyu.edu/pub/lcv/wang03-preprint.pdf
///
/// ## Details
///
/// - `self.window`: `[C, 1, 11, 11]`
///   - A normalized Gaussian window applied per channel
#[derive(Clone, Debug)]
pub struct MeanStructuralSimilarity<B: Backend, const C: usize> {
    pub window: Tensor<B, 4>,
}

impl<B: Backend, const C: usize> MeanStructuralSimilarity<B, C> {
    pub fn init(device: &B::Device) -> Self {
        let size_half = (WINDOW_SIZE / 2) as i32;
        // g[11]
        let weights_1d = (-size_half..=size_half)
            .map(|x| (-(x * x) as f64 / (2.0 * WINDOW_STD * WINDOW_STD)).exp())
            .collect::<Vec<_>>();
        let sum = weights_1d.iter().sum::<f64>();

        // w[C, 1, 11, 11] = g[11, 1] * g[1, 11] / sum(g) ^ 2
        let weights = (0..C)
            .flat_map(|_| {
                weights_1d.iter().flat_map(|w_y| {
                    weights_1d
                        .iter()
                        .map(move |w_x| (w_y * w_x / (sum * sum)) as f32)
                })
            })
            .collect::<Vec<_>>();

        let window = Tensor::from_data(
            TensorData::new(weights, [C, 1, WINDOW_SIZE, WINDOW_SIZE]),
            device,
        );

        Self { window }
    }

    /// Computing the mean of structural similarity index (MSSIM) between the inputs
    /// using the equations 13-16 and settings in the paper.
    ///
    /// ## Details
    ///
    /// - `(value, target)`: `([N, C, H, W], [N, C, H, W])`
    ///   - The values are expected to fall within the range of `0.0` to `1.0`
    /// - Return: `[1]`
    pub fn evaluate(
        &self,
        value: Tensor<B, 4>,
        target: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        const K1: f64 = 0.01;
        const K2: f64 = 0.03;
        const L: f64 = 1.0;
        const C1: f64 = (K1 * L) * (K1 * L);
        const C2: f64 = (K2 * L) * (K2 * L);

        debug_assert_eq!(value.dims(), target.dims());
        debug_assert_eq!(value.dims()[1], C);

        let input = (value, target);
        // m0 = F(x0)
        // m1 = F(x1)
        let mean = (
            self.filter(input.0.to_owned()),
            self.filter(input.1.to_owned()),
        );
        // m0^2 = m0 * m0
        // m1^2 = m1 * m1
        let mean2 = (
            mean.0.to_owned() * mean.0.to_owned(),
            mean.1.to_owned() * mean.1.to_owned(),
        );
        // s0^2 = F(x0^2) - m0^2
        // s1^2 = F(x1^2) - m1^2
        let std2 = (
            self.filter(input.0.to_owned() * input.0.to_owned())
                .sub(mean2.0.to_owned()),
            self.filter(input.1.to_owned() * input.1.to_owned())
                .sub(mean2.1.to_owned()),
        );
        // m_01 = m0 * m1
        let mean_01 = mean.0 * mean.1;
        // s_01 = F(x0 * x1) - m_01
        let std_01 = self.filter(input.0 * input.1) - mean_01.to_owned();
        // I(x0, x1) =
        // (2 * m_01 + C1) * (2 * s_01 + C2) /
        // ((m0^2 + m1^2 + C1) * (s0^2 + s1^2 + C2))
        let indexes = (mean_01.mul_scalar(2.0).add_scalar(C1))
            * (std_01.mul_scalar(2.0).add_scalar(C2))
            / ((mean2.0 + mean2.1).add_scalar(C1) * (std2.0 + std2.1).add_scalar(C2));

        // MI(x0, x1) = mean(I(x0, x1))
        indexes.mean()
    }

    /// `F(x) = sum(window * x)` per channel, zero-padded.
    #[inline]
    fn filter(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let padding = WINDOW_SIZE / 2;
        conv2d(
            input,
            self.window.to_owned(),
            None,
            ConvOptions::new([1, 1], [padding, padding], [1, 1], C),
        )
    }
}

impl<B: Backend, const C: usize> Default for MeanStructuralSimilarity<B, C> {
    fn default() -> Self {
        Self::init(&Default::default())
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn window_is_normalized() {
        use super::*;
        use burn::backend::NdArray;

        let metric = MeanStructuralSimilarity::<NdArray, 3>::default();
        assert_eq!(metric.window.dims(), [3, 1, WINDOW_SIZE, WINDOW_SIZE]);

        let sum = metric.window.sum().into_scalar();
        assert!((sum - 3.0).abs() < 1e-5, "{sum}");
    }

    #[test]
    fn evaluate() {
        use super::*;
        use burn::backend::NdArray;

        let device = Default::default();
        let metric = MeanStructuralSimilarity::<NdArray, 3>::init(&device);

        let input_0 = Tensor::zeros([1, 3, 32, 32], &device);
        let input_1 = Tensor::zeros([1, 3, 32, 32], &device);
        let score = metric.evaluate(input_0, input_1).into_scalar();
        assert!((score - 1.0).abs() < 1e-5, "{score}");

        let input_0 = Tensor::ones([1, 3, 32, 32], &device);
        let input_1 = Tensor::ones([1, 3, 32, 32], &device);
        let score = metric.evaluate(input_0, input_1).into_scalar();
        assert!((score - 1.0).abs() < 1e-4, "{score}");

        let input_0 = Tensor::zeros([1, 3, 32, 32], &device);
        let input_1 = Tensor::ones([1, 3, 32, 32], &device);
        let score = metric.evaluate(input_0, input_1).into_scalar();
        assert!(score < 1e-2, "{score}");
        assert_ne!(score, 0.0);
    }
}
