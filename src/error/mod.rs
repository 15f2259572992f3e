//! Errors of the crate.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Degenerate optical flow: only {0:.4} of the pixels are trackable")]
    DegenerateFlow(f32),

    #[error("The sparse point set is empty")]
    EmptyPoints,

    #[error("The camera set is empty")]
    EmptyCameras,

    #[error("The image of frame {0} is empty")]
    EmptyImage(u32),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "Mismatched frame size: ({0}, {1}) against ({2}, {3})"
    )]
    MismatchedFrameSize(u32, u32, u32, u32),

    #[error(
        "Mismatched image size of camera {0}: ({1}, {2}) against ({3}, {4})"
    )]
    MismatchedImageSize(u32, u32, u32, u32, u32),

    #[error("The transient mask has non-finite values")]
    NonFiniteMask,

    #[error("Missing checkpoint file: {0:?}")]
    MissingCheckpoint(PathBuf),

    #[error(
        "Training is numerically unstable for {0} consecutive steps at iteration {1}"
    )]
    PersistentInstability(u64, u64),

    #[error("Record error: {0}")]
    Record(String),

    #[error("Unknown frame id: {0}")]
    UnknownFrameId(u32),

    #[error("Unsupported checkpoint version: {0}")]
    UnsupportedCheckpointVersion(u32),
}
