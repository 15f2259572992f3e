//! Image quality metrics on tensors of `[N, C, H, W]`.

pub mod mae;
pub mod mse;
pub mod mssim;
pub mod psnr;

pub use burn::tensor::{backend::Backend, Tensor};
pub use mae::*;
pub use mse::*;
pub use mssim::*;
pub use psnr::*;

/// The floor of the weight sum of a weighted mean.
pub const WEIGHT_SUM_MIN: f64 = 1e-12;

pub trait Metric<B: Backend> {
    /// Evaluate the value against the target.
    ///
    /// ## Returns
    ///
    /// The metric value with shape `[1]`.
    fn evaluate<const D: usize>(
        &self,
        value: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> Tensor<B, 1>;
}

/// `sum(weight * error) / sum(weight)`
pub(crate) fn weighted_mean<B: Backend, const D: usize>(
    error: Tensor<B, D>,
    weight: Tensor<B, D>,
) -> Tensor<B, 1> {
    error
        .mul(weight.to_owned())
        .sum()
        .div(weight.sum().clamp_min(WEIGHT_SUM_MIN))
}
