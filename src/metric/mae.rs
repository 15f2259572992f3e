pub use super::*;

/// Computing the mean absolute error (MAE) between the inputs:
///
/// `mean(abs(value - target))`
#[derive(Clone, Copy, Debug, Default)]
pub struct MeanAbsoluteError;

impl MeanAbsoluteError {
    #[inline]
    pub fn init() -> Self {
        Self
    }

    /// The MAE over the pixels weighted by `weight`, e.g. a transient mask
    /// broadcast to the value's shape.
    pub fn evaluate_weighted<B: Backend, const D: usize>(
        &self,
        value: Tensor<B, D>,
        target: Tensor<B, D>,
        weight: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        weighted_mean(value.sub(target).abs(), weight)
    }
}

impl<B: Backend> Metric<B> for MeanAbsoluteError {
    #[inline]
    fn evaluate<const D: usize>(
        &self,
        value: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        value.sub(target).abs().mean()
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn evaluate() {
        use super::*;
        use burn::backend::NdArray;

        let device = Default::default();
        let metric = MeanAbsoluteError::init();

        let input_0 = Tensor::<NdArray, 4>::zeros([1, 3, 32, 32], &device);
        let input_1 = Tensor::<NdArray, 4>::ones([1, 3, 32, 32], &device);
        let score = metric.evaluate(input_0, input_1).into_scalar();
        assert_eq!(score, 1.0);

        let input_0 = Tensor::<NdArray, 2>::from_floats([[0.0, 0.1], [0.5, 0.4]], &device);
        let input_1 = Tensor::<NdArray, 2>::from_floats([[0.5, 0.1], [0.0, 0.4]], &device);
        let score = metric.evaluate(input_0, input_1).into_scalar();
        assert_eq!(score, 0.25);
    }

    #[test]
    fn evaluate_weighted() {
        use super::*;
        use burn::backend::NdArray;

        let device = Default::default();
        let metric = MeanAbsoluteError::init();

        let value = Tensor::<NdArray, 2>::from_floats([[0.0, 1.0], [0.0, 0.0]], &device);
        let target = Tensor::<NdArray, 2>::zeros([2, 2], &device);

        let weight = Tensor::<NdArray, 2>::from_floats([[1.0, 0.0], [1.0, 1.0]], &device);
        let score = metric
            .evaluate_weighted(value.to_owned(), target.to_owned(), weight)
            .into_scalar();
        assert_eq!(score, 0.0);

        let weight = Tensor::<NdArray, 2>::zeros([2, 2], &device);
        let score = metric.evaluate_weighted(value, target, weight).into_scalar();
        assert_eq!(score, 0.0);
    }
}
