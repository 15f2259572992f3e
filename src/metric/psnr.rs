//! Peak signal-to-noise ratio (PSNR) metric.

pub use super::*;

/// Computing the peak signal-to-noise ratio (PSNR) between the inputs:
///
/// `10 * log10(1 / MSE) = -10 / log(10) * log(MSE)`
///
/// ## Details
///
/// It relies on [`MSE`](MeanSquareError).
#[derive(Clone, Debug)]
pub struct Psnr<B: Backend> {
    /// Coefficient for PSNR.
    pub coefficient: Tensor<B, 1>,
    /// Inner metric.
    pub mse: MeanSquareError,
}

impl<B: Backend> Psnr<B> {
    pub fn init(device: &B::Device) -> Self {
        let coefficient = Tensor::<B, 1>::from_floats([-10.0 / 10.0_f32.ln()], device);
        let mse = MeanSquareError::init();
        Self { coefficient, mse }
    }

    /// The PSNR of the weighted MSE.
    pub fn evaluate_weighted<const D: usize>(
        &self,
        value: Tensor<B, D>,
        target: Tensor<B, D>,
        weight: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        let mse = self.mse.evaluate_weighted(value, target, weight);
        self.coefficient.to_owned().mul(mse.log())
    }
}

impl<B: Backend> Metric<B> for Psnr<B> {
    /// ## Returns
    ///
    /// The peak signal-to-noise ratio (PSNR) with shape `[1]`.
    #[inline]
    fn evaluate<const D: usize>(
        &self,
        value: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        let mse = self.mse.evaluate(value, target);
        self.coefficient.to_owned().mul(mse.log())
    }
}

impl<B: Backend> Default for Psnr<B> {
    fn default() -> Self {
        Self::init(&Default::default())
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn evaluate() {
        use super::*;
        use burn::backend::NdArray;

        let device = Default::default();
        let metric = Psnr::init(&device);

        let input_0 = Tensor::<NdArray, 4>::zeros([1, 3, 16, 16], &device);
        let input_1 = Tensor::<NdArray, 4>::zeros([1, 3, 16, 16], &device);
        let score = metric.evaluate(input_0, input_1).into_scalar();
        assert_eq!(score, f32::INFINITY);

        let input_0 = Tensor::<NdArray, 4>::zeros([1, 3, 16, 16], &device);
        let input_1 = Tensor::<NdArray, 4>::ones([1, 3, 16, 16], &device);
        let score = metric.evaluate(input_0, input_1).into_scalar();
        assert_eq!(score, 0.0);

        let input_0 = Tensor::<NdArray, 2>::from_floats(
            [[0.0, 0.1, 0.2], [0.5, 0.4, 0.3]],
            &device,
        );
        let input_1 = Tensor::<NdArray, 2>::from_floats(
            [[0.0, 0.6, 0.7], [0.0, 0.4, 0.3]],
            &device,
        );
        let score = metric.evaluate(input_0, input_1).into_scalar();
        assert!((score - 9.030899).abs() < 1e-4, "{score}");
    }

    #[test]
    fn evaluate_weighted() {
        use super::*;
        use burn::backend::NdArray;

        let device = Default::default();
        let metric = Psnr::init(&device);

        // The masked pixel is wrong, the others are off by 0.1
        let value = Tensor::<NdArray, 1>::from_floats([0.1, 0.1, 1.0], &device);
        let target = Tensor::<NdArray, 1>::from_floats([0.0, 0.0, 0.0], &device);
        let weight = Tensor::<NdArray, 1>::from_floats([1.0, 1.0, 0.0], &device);
        let score = metric.evaluate_weighted(value, target, weight).into_scalar();
        assert!((score - 20.0).abs() < 1e-3, "{score}");
    }
}
