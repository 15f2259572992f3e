//! A library to train underwater scenes with Gaussian splats and a light-transport medium

#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::excessive_precision)]

pub mod dataset;
pub mod error;
pub mod eval;
pub mod function;
pub mod mask;
pub mod metric;
pub mod optimize;
pub mod range;
pub mod render;
pub mod scene;
pub mod train;
