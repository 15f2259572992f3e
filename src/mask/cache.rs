pub use super::*;

use crate::dataset::SparseViewDataset;
use dashmap::DashMap;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::fmt;

/// Transient masks by frame id, computed once ahead of training.
#[derive(Clone, Default)]
pub struct TransientMaskCache {
    masks: DashMap<u32, TransientMask>,
}

impl TransientMaskCache {
    /// Computing the mask of every frame against its neighbours at
    /// `±frame_offset` in time, combined by the minimum.
    ///
    /// A frame without neighbours is unmasked.
    pub fn precompute<E: TransientMaskEstimator + Sync>(
        dataset: &SparseViewDataset,
        estimator: &E,
        frame_offset: u32,
    ) -> Result<Self, Error> {
        let masks = dataset
            .frames
            .par_iter()
            .map(|(frame_id, frame)| {
                let (previous, next) = dataset.temporal_neighbors(*frame_id, frame_offset)?;
                let masks = [previous, next]
                    .into_iter()
                    .flatten()
                    .map(|other| estimator.compute_mask_or_unmasked(&frame.image, &other.image))
                    .collect::<Vec<_>>();
                let mask = combine_masks(&masks).unwrap_or_else(|| {
                    TransientMask::filled(frame.image.width, frame.image.height, 1.0)
                });
                Ok((*frame_id, mask))
            })
            .collect::<Result<DashMap<_, _>, Error>>()?;

        #[cfg(all(debug_assertions, not(test)))]
        log::debug!(
            target: "aquasplat::trainer::mask::cache",
            "TransientMaskCache::precompute > mask_count ({})",
            masks.len(),
        );

        Ok(Self { masks })
    }

    /// The mask of a frame, downscaled by an integer factor.
    pub fn get(
        &self,
        frame_id: u32,
        factor: u32,
    ) -> Option<TransientMask> {
        self.masks
            .get(&frame_id)
            .map(|mask| mask.value().downscale(factor))
    }

    /// Replacing the mask of a frame, e.g. after its pairing changes.
    #[inline]
    pub fn insert(
        &self,
        frame_id: u32,
        mask: TransientMask,
    ) -> Option<TransientMask> {
        self.masks.insert(frame_id, mask)
    }

    #[inline]
    pub fn remove(
        &self,
        frame_id: u32,
    ) -> Option<TransientMask> {
        self.masks.remove(&frame_id).map(|(_, mask)| mask)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}

impl fmt::Debug for TransientMaskCache {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TransientMaskCache")
            .field("masks.len()", &self.masks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Camera, Frame, Point};

    /// Masking the left half of every frame against any neighbour.
    struct HalfEstimator;

    impl TransientMaskEstimator for HalfEstimator {
        fn compute_mask(
            &self,
            frame_t: &Image,
            _: &Image,
        ) -> Result<TransientMask, Error> {
            let mut mask = TransientMask::filled(frame_t.width, frame_t.height, 1.0);
            (0..frame_t.height).for_each(|y| {
                (0..frame_t.width / 2).for_each(|x| mask.set(x, y, 0.0));
            });
            Ok(mask)
        }
    }

    /// Failing on every frame.
    struct FailingEstimator;

    impl TransientMaskEstimator for FailingEstimator {
        fn compute_mask(
            &self,
            _: &Image,
            _: &Image,
        ) -> Result<TransientMask, Error> {
            Err(Error::DegenerateFlow(0.0))
        }
    }

    fn dataset(frame_count: u32) -> SparseViewDataset {
        let frames = (0..frame_count).map(|frame_id| Frame {
            frame_id,
            image: Image::new(16, 16),
            timestamp: frame_id as f64,
        });
        SparseViewDataset::init([Camera::default()], frames, vec![Point::default()]).unwrap()
    }

    #[test]
    fn precompute_and_downscale() {
        let cache = TransientMaskCache::precompute(&dataset(3), &HalfEstimator, 1).unwrap();
        assert_eq!(cache.len(), 3);

        let mask = cache.get(1, 2).unwrap();
        assert_eq!((mask.width, mask.height), (8, 8));
        assert_eq!(mask.get(0, 0), 0.0);
        assert_eq!(mask.get(7, 7), 1.0);
        assert_eq!(cache.get(9, 1), None);
    }

    #[test]
    fn lonely_frame_is_unmasked() {
        let cache = TransientMaskCache::precompute(&dataset(1), &HalfEstimator, 1).unwrap();
        let mask = cache.get(0, 1).unwrap();
        assert!(mask.values.iter().all(|w| *w == 1.0));
    }

    #[test]
    fn failures_are_unmasked() {
        let cache = TransientMaskCache::precompute(&dataset(2), &FailingEstimator, 1).unwrap();
        assert_eq!(cache.len(), 2);
        (0..2).for_each(|frame_id| {
            let mask = cache.get(frame_id, 1).unwrap();
            assert!(mask.values.iter().all(|w| *w == 1.0));
        });
    }
}
