//! The mutable state fitted during training.

pub mod gaussian_3d;
pub mod medium;

pub use gaussian_3d::*;
pub use medium::*;

/// The Gaussian splats with their light-transport medium.
#[derive(Clone, Debug, PartialEq)]
pub struct UnderwaterScene {
    pub gaussians: Gaussian3dScene,
    pub medium: Medium,
}
