pub mod camera;
pub mod frame;

pub use crate::{error::Error, function::Image};
pub use camera::*;
pub use frame::*;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::{collections::BTreeMap, fmt};

/// Cameras, frames and sparse points, validated against each other.
#[derive(Clone, PartialEq)]
pub struct SparseViewDataset {
    pub cameras: Cameras,
    pub frames: Frames,
    pub points: Points,
    /// Frame ids ordered by timestamp.
    frame_ids_by_time: Vec<u32>,
}

/// A camera with its observed image.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingView {
    pub camera: Camera,
    pub image: Image,
}

impl SparseViewDataset {
    /// Validating the inputs before training starts.
    ///
    /// Every camera must observe a known frame of the same size.
    pub fn init(
        cameras: impl IntoIterator<Item = Camera>,
        frames: impl IntoIterator<Item = Frame>,
        points: Points,
    ) -> Result<Self, Error> {
        if points.is_empty() {
            return Err(Error::EmptyPoints);
        }

        let cameras = cameras
            .into_iter()
            .map(|camera| (camera.camera_id, camera))
            .collect::<Cameras>();
        if cameras.is_empty() {
            return Err(Error::EmptyCameras);
        }

        let frames = frames
            .into_iter()
            .map(|frame| (frame.frame_id, frame))
            .collect::<Frames>();

        if let Some(frame) = frames
            .values()
            .find(|frame| frame.image.width == 0 || frame.image.height == 0)
        {
            return Err(Error::EmptyImage(frame.frame_id));
        }

        cameras.par_iter().try_for_each(|(_, camera)| {
            let frame = frames
                .get(&camera.frame_id)
                .ok_or(Error::UnknownFrameId(camera.frame_id))?;
            if frame.image.width != camera.image_width
                || frame.image.height != camera.image_height
            {
                return Err(Error::MismatchedImageSize(
                    camera.camera_id,
                    camera.image_width,
                    camera.image_height,
                    frame.image.width,
                    frame.image.height,
                ));
            }
            Ok(())
        })?;

        let mut frame_ids_by_time = frames.keys().copied().collect::<Vec<_>>();
        frame_ids_by_time.sort_by(|a, b| {
            frames[a].timestamp.total_cmp(&frames[b].timestamp).then(a.cmp(b))
        });

        #[cfg(all(debug_assertions, not(test)))]
        log::debug!(
            target: "aquasplat::trainer::dataset::sparse_view",
            "SparseViewDataset::init > {} cameras, {} frames, {} points",
            cameras.len(),
            frames.len(),
            points.len(),
        );

        Ok(Self {
            cameras,
            frames,
            points,
            frame_ids_by_time,
        })
    }

    /// The frames `offset` steps before and after `frame_id` in time order.
    pub fn temporal_neighbors(
        &self,
        frame_id: u32,
        offset: u32,
    ) -> Result<(Option<&Frame>, Option<&Frame>), Error> {
        let index = self
            .frame_ids_by_time
            .iter()
            .position(|id| *id == frame_id)
            .ok_or(Error::UnknownFrameId(frame_id))?;
        let offset = offset.max(1) as usize;

        let previous = index
            .checked_sub(offset)
            .and_then(|i| self.frames.get(&self.frame_ids_by_time[i]));
        let next = self
            .frame_ids_by_time
            .get(index + offset)
            .and_then(|id| self.frames.get(id));

        Ok((previous, next))
    }

    /// One view per camera, in camera id order.
    pub fn training_views(&self) -> Vec<TrainingView> {
        self.cameras
            .values()
            .filter_map(|camera| {
                self.frames.get(&camera.frame_id).map(|frame| TrainingView {
                    camera: *camera,
                    image: frame.image.to_owned(),
                })
            })
            .collect()
    }
}

impl TrainingView {
    /// Scaling both the camera and the image down by an integer factor.
    pub fn downscale(
        &self,
        factor: u32,
    ) -> Self {
        Self {
            camera: self.camera.downscale(factor),
            image: self.image.downscale(factor),
        }
    }
}

impl fmt::Debug for SparseViewDataset {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SparseViewDataset")
            .field("cameras.len()", &self.cameras.len())
            .field("frames.len()", &self.frames.len())
            .field("points.len()", &self.points.len())
            .finish()
    }
}
