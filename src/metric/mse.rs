pub use super::*;

/// Computing the mean square error (MSE) between the inputs:
///
/// `mean((value - target) ^ 2)`
#[derive(Clone, Copy, Debug, Default)]
pub struct MeanSquareError;

impl MeanSquareError {
    #[inline]
    pub fn init() -> Self {
        Self
    }

    pub fn evaluate_weighted<B: Backend, const D: usize>(
        &self,
        value: Tensor<B, D>,
        target: Tensor<B, D>,
        weight: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        weighted_mean(value.sub(target).powf_scalar(2.0), weight)
    }
}

impl<B: Backend> Metric<B> for MeanSquareError {
    /// ## Returns
    ///
    /// The mean square error (MSE) with shape `[1]`.
    #[inline]
    fn evaluate<const D: usize>(
        &self,
        value: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        value.sub(target).powf_scalar(2.0).mean()
    }
}
