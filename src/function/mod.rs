pub mod activation;
pub mod buffer;
pub mod convert;
pub mod spherical_harmonics;

pub use activation::*;
pub use buffer::*;
pub use convert::*;
pub use spherical_harmonics::*;
