//! External inputs of training.

pub mod sparse_view;

pub use sparse_view::*;
