pub use super::*;

use crate::function::get_image_from_rgb_image;
use image::RgbImage;

/// A timestamped image of the video sequence.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Frame {
    pub frame_id: u32,
    pub image: Image,
    pub timestamp: f64,
}

/// A map of [`Frame::frame_id`] to [`Frame`].
pub type Frames = BTreeMap<u32, Frame>;

impl Frame {
    #[inline]
    pub fn from_rgb_image(
        frame_id: u32,
        timestamp: f64,
        rgb_image: &RgbImage,
    ) -> Self {
        Self {
            frame_id,
            image: get_image_from_rgb_image(rgb_image),
            timestamp,
        }
    }
}

/// A sparse point from structure-from-motion.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    /// In `[0, 1]`
    pub color_rgb: [f32; 3],
    pub position: [f32; 3],
}

pub type Points = Vec<Point>;
