//! An arena of 3D Gaussian splats.
//!
//! Parameters are stored struct-of-arrays by slot. Removing a splat frees its
//! slot, and later insertions reuse freed slots, so slot indices stay stable
//! across densification and pruning.

pub mod config;
pub mod record;
pub mod refine;

pub use crate::{dataset::Point, error::Error, function::*};
pub use config::*;
pub use glam::{Quat, Vec3};
pub use record::*;
pub use refine::*;

use std::fmt;

#[derive(Clone, PartialEq)]
pub struct Gaussian3dScene {
    /// `[S, (D + 1) ^ 2, 3]`
    pub colors_sh: Vec<f32>,
    /// `D`
    pub colors_sh_degree_max: u32,
    /// `[S, 3]`
    pub log_scalings: Vec<f32>,
    /// `[S]`
    pub opacity_logits: Vec<f32>,
    /// `[S, 3]`
    pub positions: Vec<f32>,
    /// `[S, 4]`, `(w, x, y, z)` and not necessarily normalized.
    pub rotations: Vec<f32>,
    /// `[S]`
    alive: Vec<bool>,
    free_slots: Vec<usize>,
}

/// The parameters of one splat.
#[derive(Clone, Debug, PartialEq)]
pub struct Gaussian3dPoint {
    /// `[(D + 1) ^ 2, 3]`
    pub colors_sh: Vec<f32>,
    pub log_scaling: [f32; 3],
    pub opacity_logit: f32,
    pub position: [f32; 3],
    pub rotation: [f32; 4],
}

impl Gaussian3dScene {
    /// An empty arena.
    pub fn new(colors_sh_degree_max: u32) -> Self {
        Self {
            colors_sh: Vec::new(),
            colors_sh_degree_max: colors_sh_degree_max.min(SH_DEGREE_MAX),
            log_scalings: Vec::new(),
            opacity_logits: Vec::new(),
            positions: Vec::new(),
            rotations: Vec::new(),
            alive: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    /// The count of values per slot in [`Self::colors_sh`].
    #[inline]
    pub fn colors_sh_stride(&self) -> usize {
        sh_count(self.colors_sh_degree_max) * 3
    }

    /// The count of slots, alive or free.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.alive.len()
    }

    /// The count of alive splats.
    #[inline]
    pub fn point_count(&self) -> usize {
        self.alive.len() - self.free_slots.len()
    }

    #[inline]
    pub fn is_alive(
        &self,
        slot: usize,
    ) -> bool {
        self.alive.get(slot).copied().unwrap_or(false)
    }

    /// Alive slots in ascending order.
    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.alive
            .iter()
            .enumerate()
            .filter_map(|(slot, alive)| alive.then_some(slot))
    }

    #[inline]
    pub fn free_slots(&self) -> &[usize] {
        &self.free_slots
    }

    #[inline]
    pub fn alive(&self) -> &[bool] {
        &self.alive
    }

    #[inline]
    pub fn position(
        &self,
        slot: usize,
    ) -> Vec3 {
        Vec3::from_slice(&self.positions[slot * 3..slot * 3 + 3])
    }

    /// The activated scaling, `exp(log_scaling)`.
    #[inline]
    pub fn scaling(
        &self,
        slot: usize,
    ) -> Vec3 {
        Vec3::from_slice(&self.log_scalings[slot * 3..slot * 3 + 3]).exp()
    }

    /// The raw quaternion `(w, x, y, z)`.
    #[inline]
    pub fn rotation_raw(
        &self,
        slot: usize,
    ) -> [f32; 4] {
        let r = &self.rotations[slot * 4..slot * 4 + 4];
        [r[0], r[1], r[2], r[3]]
    }

    /// The normalized rotation, identity if degenerate.
    #[inline]
    pub fn rotation(
        &self,
        slot: usize,
    ) -> Quat {
        let [w, x, y, z] = self.rotation_raw(slot);
        let rotation = Quat::from_xyzw(x, y, z, w);
        let norm = rotation.length();
        if norm > f32::EPSILON && norm.is_finite() {
            rotation / norm
        } else {
            Quat::IDENTITY
        }
    }

    /// The activated opacity, `sigmoid(opacity_logit)`.
    #[inline]
    pub fn opacity(
        &self,
        slot: usize,
    ) -> f32 {
        sigmoid(self.opacity_logits[slot])
    }

    #[inline]
    pub fn colors_sh_of(
        &self,
        slot: usize,
    ) -> &[f32] {
        let stride = self.colors_sh_stride();
        &self.colors_sh[slot * stride..(slot + 1) * stride]
    }

    pub fn get(
        &self,
        slot: usize,
    ) -> Gaussian3dPoint {
        let [x, y, z] = [0, 1, 2].map(|i| self.positions[slot * 3 + i]);
        let [sx, sy, sz] = [0, 1, 2].map(|i| self.log_scalings[slot * 3 + i]);
        Gaussian3dPoint {
            colors_sh: self.colors_sh_of(slot).to_vec(),
            log_scaling: [sx, sy, sz],
            opacity_logit: self.opacity_logits[slot],
            position: [x, y, z],
            rotation: self.rotation_raw(slot),
        }
    }

    /// Writing the parameters into a slot and marking it alive.
    pub fn overwrite(
        &mut self,
        slot: usize,
        point: &Gaussian3dPoint,
    ) {
        let stride = self.colors_sh_stride();
        let count = point.colors_sh.len().min(stride);
        let colors_sh = &mut self.colors_sh[slot * stride..(slot + 1) * stride];
        colors_sh.fill(0.0);
        colors_sh[..count].copy_from_slice(&point.colors_sh[..count]);

        self.log_scalings[slot * 3..slot * 3 + 3].copy_from_slice(&point.log_scaling);
        self.opacity_logits[slot] = point.opacity_logit;
        self.positions[slot * 3..slot * 3 + 3].copy_from_slice(&point.position);
        self.rotations[slot * 4..slot * 4 + 4].copy_from_slice(&point.rotation);

        if !self.alive[slot] {
            self.alive[slot] = true;
            self.free_slots.retain(|s| *s != slot);
        }
    }

    /// Inserting a splat into a free slot or a new one.
    ///
    /// ## Returns
    ///
    /// The slot of the splat.
    pub fn insert(
        &mut self,
        point: &Gaussian3dPoint,
    ) -> usize {
        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                let slot = self.alive.len();
                self.alive.push(false);
                self.colors_sh
                    .resize(self.colors_sh.len() + self.colors_sh_stride(), 0.0);
                self.log_scalings.extend([0.0; 3]);
                self.opacity_logits.push(0.0);
                self.positions.extend([0.0; 3]);
                self.rotations.extend([1.0, 0.0, 0.0, 0.0]);
                slot
            },
        };
        self.overwrite(slot, point);
        slot
    }

    /// Freeing a slot. It is a no-op if the slot is not alive.
    pub fn remove(
        &mut self,
        slot: usize,
    ) -> bool {
        if !self.is_alive(slot) {
            return false;
        }
        self.alive[slot] = false;
        self.free_slots.push(slot);
        true
    }

    /// Whether every parameter of the slot is finite.
    pub fn is_finite(
        &self,
        slot: usize,
    ) -> bool {
        self.positions[slot * 3..slot * 3 + 3]
            .iter()
            .chain(&self.log_scalings[slot * 3..slot * 3 + 3])
            .chain(&self.rotations[slot * 4..slot * 4 + 4])
            .chain(std::iter::once(&self.opacity_logits[slot]))
            .chain(self.colors_sh_of(slot))
            .all(|v| v.is_finite())
    }
}

impl Default for Gaussian3dScene {
    #[inline]
    fn default() -> Self {
        Self::new(SH_DEGREE_MAX)
    }
}

impl fmt::Debug for Gaussian3dScene {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Gaussian3dScene")
            .field("colors_sh_degree_max", &self.colors_sh_degree_max)
            .field("point_count", &self.point_count())
            .field("slot_count", &self.slot_count())
            .finish()
    }
}

impl Gaussian3dPoint {
    /// An isotropic splat with a constant colour.
    pub fn new(
        colors_sh_degree_max: u32,
        position: [f32; 3],
        scaling: f32,
        opacity: f32,
        color_rgb: [f32; 3],
    ) -> Self {
        let mut colors_sh = vec![0.0; sh_count(colors_sh_degree_max) * 3];
        colors_sh[..3].copy_from_slice(&color_rgb.map(rgb_to_sh_dc));
        Self {
            colors_sh,
            log_scaling: [scaling.max(f32::MIN_POSITIVE).ln(); 3],
            opacity_logit: logit(opacity),
            position,
            rotation: [1.0, 0.0, 0.0, 0.0],
        }
    }
}
