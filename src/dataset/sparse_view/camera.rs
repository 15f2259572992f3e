pub use super::*;
pub use glam::{Mat3, Vec3};

/// A pinhole camera in the OpenCV convention (`+x` right, `+y` down, `+z` forward).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub camera_id: u32,
    pub focal_length_x: f32,
    pub focal_length_y: f32,
    /// The frame observed by the camera.
    pub frame_id: u32,
    pub image_height: u32,
    pub image_width: u32,
    pub principal_point_x: f32,
    pub principal_point_y: f32,
    /// World-to-view rotation.
    pub view_rotation: Mat3,
    /// World-to-view translation.
    pub view_translation: Vec3,
}

/// A map of [`Camera::camera_id`] to [`Camera`].
pub type Cameras = BTreeMap<u32, Camera>;

impl Camera {
    /// A camera with the principal point at the image center.
    pub fn new_centered(
        camera_id: u32,
        frame_id: u32,
        image_width: u32,
        image_height: u32,
        focal_length: f32,
        view_rotation: Mat3,
        view_translation: Vec3,
    ) -> Self {
        Self {
            camera_id,
            focal_length_x: focal_length,
            focal_length_y: focal_length,
            frame_id,
            image_height,
            image_width,
            principal_point_x: image_width as f32 * 0.5,
            principal_point_y: image_height as f32 * 0.5,
            view_rotation,
            view_translation,
        }
    }

    #[inline]
    pub fn tan_half_field_of_view_x(&self) -> f32 {
        self.image_width as f32 * 0.5 / self.focal_length_x
    }

    #[inline]
    pub fn tan_half_field_of_view_y(&self) -> f32 {
        self.image_height as f32 * 0.5 / self.focal_length_y
    }

    /// The camera center in world space.
    #[inline]
    pub fn view_position(&self) -> Vec3 {
        -(self.view_rotation.transpose() * self.view_translation)
    }

    /// Scaling the intrinsics down by an integer factor.
    pub fn downscale(
        &self,
        factor: u32,
    ) -> Self {
        if factor <= 1 {
            return *self;
        }

        let scale = 1.0 / factor as f32;
        Self {
            focal_length_x: self.focal_length_x * scale,
            focal_length_y: self.focal_length_y * scale,
            image_height: (self.image_height / factor).max(1),
            image_width: (self.image_width / factor).max(1),
            principal_point_x: self.principal_point_x * scale,
            principal_point_y: self.principal_point_y * scale,
            ..*self
        }
    }
}

impl Default for Camera {
    #[inline]
    fn default() -> Self {
        Self::new_centered(0, 0, 16, 16, 16.0, Mat3::IDENTITY, Vec3::ZERO)
    }
}
