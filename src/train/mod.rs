//! Fitting an underwater scene to a sparse-view dataset.

pub mod gaussian_3d;

pub use gaussian_3d::*;
