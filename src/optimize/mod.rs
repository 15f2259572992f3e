//! Optimizers over the slot-indexed parameters of a scene.

pub mod adam;
pub mod learning_rate;

pub use adam::*;
pub use learning_rate::*;
