//! Rasterization of the scene.

pub mod gaussian_3d;

pub use gaussian_3d::*;
