pub use super::*;
pub use burn::record::Record;

#[derive(Clone, Debug, Record)]
pub struct Gaussian3dSceneRecord {
    pub alive: Vec<bool>,
    pub colors_sh: Vec<f32>,
    pub colors_sh_degree_max: u32,
    /// In the order of reuse, last first.
    pub free_slots: Vec<u64>,
    pub log_scalings: Vec<f32>,
    pub opacity_logits: Vec<f32>,
    pub positions: Vec<f32>,
    pub rotations: Vec<f32>,
}

impl Gaussian3dScene {
    pub fn into_record(self) -> Gaussian3dSceneRecord {
        Gaussian3dSceneRecord {
            alive: self.alive,
            colors_sh: self.colors_sh,
            colors_sh_degree_max: self.colors_sh_degree_max,
            free_slots: self.free_slots.into_iter().map(|s| s as u64).collect(),
            log_scalings: self.log_scalings,
            opacity_logits: self.opacity_logits,
            positions: self.positions,
            rotations: self.rotations,
        }
    }

    /// Restoring the arena after checking the buffer sizes.
    pub fn from_record(record: Gaussian3dSceneRecord) -> Result<Self, Error> {
        if record.colors_sh_degree_max > SH_DEGREE_MAX {
            return Err(Error::Record(format!(
                "colors_sh_degree_max ({}) is out of range",
                record.colors_sh_degree_max
            )));
        }

        let slot_count = record.alive.len();
        let colors_sh_stride = sh_count(record.colors_sh_degree_max) * 3;
        [
            ("colors_sh", record.colors_sh.len(), colors_sh_stride),
            ("log_scalings", record.log_scalings.len(), 3),
            ("opacity_logits", record.opacity_logits.len(), 1),
            ("positions", record.positions.len(), 3),
            ("rotations", record.rotations.len(), 4),
        ]
        .into_iter()
        .try_for_each(|(name, len, stride)| {
            if len != slot_count * stride {
                return Err(Error::Record(format!(
                    "{name} has {len} values for {slot_count} slots"
                )));
            }
            Ok(())
        })?;

        let free_slots = record
            .free_slots
            .into_iter()
            .map(|slot| slot as usize)
            .collect::<Vec<_>>();
        let free_count = record.alive.iter().filter(|alive| !**alive).count();
        let is_free_list_valid = free_slots.len() == free_count
            && free_slots
                .iter()
                .all(|slot| record.alive.get(*slot) == Some(&false));
        if !is_free_list_valid {
            return Err(Error::Record("free_slots mismatches alive".into()));
        }

        Ok(Self {
            colors_sh: record.colors_sh,
            colors_sh_degree_max: record.colors_sh_degree_max,
            log_scalings: record.log_scalings,
            opacity_logits: record.opacity_logits,
            positions: record.positions,
            rotations: record.rotations,
            alive: record.alive,
            free_slots,
        })
    }
}
