use crate::catalog::GeometryCatalog;
use crate::geometry::Geometry;
use crate::model::GpuModel;
use crate::node::StateError;
use crate::profile::MigProfile;

/// One physical GPU of a node, described by its used and free MIG devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpu {
    index: u32,
    model: GpuModel,
    used: Geometry,
    free: Geometry,
    allowed_geometries: Vec<Geometry>,
}

impl Gpu {
    /// Fails if `used + free` is neither empty nor an allowed geometry of `model`.
    pub fn new(
        model: GpuModel,
        index: u32,
        used: Geometry,
        free: Geometry,
        catalog: &GeometryCatalog,
    ) -> Result<Self, StateError> {
        let gpu = Self {
            index,
            model,
            used,
            free,
            allowed_geometries: catalog.allowed_for(model).to_vec(),
        };
        let geometry = gpu.geometry();
        if !geometry.is_empty() && !gpu.allows_geometry(&geometry) {
            return Err(StateError::IllegalGeometry {
                gpu_index: index,
                model,
                geometry,
            });
        }
        Ok(gpu)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn model(&self) -> GpuModel {
        self.model
    }

    pub fn used(&self) -> &Geometry {
        &self.used
    }

    pub fn free(&self) -> &Geometry {
        &self.free
    }

    pub fn allowed_geometries(&self) -> &[Geometry] {
        &self.allowed_geometries
    }

    /// Current geometry, used and free devices together.
    pub fn geometry(&self) -> Geometry {
        self.used.merged(&self.free)
    }

    pub fn allows_geometry(&self, geometry: &Geometry) -> bool {
        self.allowed_geometries.contains(geometry)
    }

    /// Returns true if `geometry` is allowed and keeps every used device.
    pub fn can_apply_geometry(&self, geometry: &Geometry) -> bool {
        self.allows_geometry(geometry) && geometry.contains(&self.used)
    }

    pub fn apply_geometry(&mut self, geometry: &Geometry) -> Result<(), StateError> {
        if !self.can_apply_geometry(geometry) {
            return Err(StateError::IllegalGeometry {
                gpu_index: self.index,
                model: self.model,
                geometry: geometry.clone(),
            });
        }
        self.free = geometry.difference(&self.used);
        Ok(())
    }

    /// Returns true if some allowed geometry holds at least the devices in `desired`.
    pub fn can_reach(&self, desired: &Geometry) -> bool {
        desired.is_empty()
            || self
                .allowed_geometries
                .iter()
                .any(|allowed| allowed.contains(desired))
    }

    pub fn has_free_devices(&self) -> bool {
        !self.free.is_empty()
    }

    /// Turns the first allowed geometry that keeps every used device and has
    /// room for one more `profile` into the current geometry.
    pub(crate) fn make_room_for(&mut self, profile: &MigProfile) -> bool {
        let used = &self.used;
        let candidate = self.allowed_geometries.iter().find(|candidate| {
            candidate.get(profile) > used.get(profile) && candidate.contains(used)
        });
        match candidate {
            Some(candidate) => {
                self.free = candidate.difference(used);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn geometry(items: &[(u32, u32, u32)]) -> Geometry {
        items
            .iter()
            .map(|(gi, mem, quantity)| (MigProfile::new(*gi, *mem), *quantity))
            .collect()
    }

    fn a100(used: Geometry, free: Geometry) -> Result<Gpu, StateError> {
        Gpu::new(
            GpuModel::A100With40Gb,
            0,
            used,
            free,
            &GeometryCatalog::builtin(),
        )
    }

    #[test]
    fn gpu_geometry_must_be_allowed() {
        let gpu = a100(geometry(&[(1, 5, 3)]), geometry(&[(1, 5, 4)])).expect("allowed geometry");
        assert_eq!(gpu.geometry(), geometry(&[(1, 5, 7)]));

        assert!(matches!(
            a100(geometry(&[(1, 5, 3)]), geometry(&[(7, 40, 1)])),
            Err(StateError::IllegalGeometry { .. })
        ));
    }

    #[test]
    fn gpu_without_devices_is_valid() {
        let gpu = a100(Geometry::new(), Geometry::new()).expect("empty geometry");
        assert!(!gpu.has_free_devices());
        assert!(gpu.can_reach(&geometry(&[(3, 20, 2)])));
        assert!(!gpu.can_reach(&geometry(&[(3, 20, 3)])));
    }

    #[test]
    fn apply_keeps_used_devices() {
        let mut gpu = a100(geometry(&[(3, 20, 1)]), geometry(&[(3, 20, 1)])).expect("allowed");

        assert!(!gpu.can_apply_geometry(&geometry(&[(1, 5, 7)])));
        assert!(gpu.apply_geometry(&geometry(&[(1, 5, 7)])).is_err());

        gpu.apply_geometry(&geometry(&[(3, 20, 1), (1, 5, 3)]))
            .expect("keeps the used 3g.20gb");
        assert_eq!(gpu.free(), &geometry(&[(1, 5, 3)]));
        assert_eq!(gpu.used(), &geometry(&[(3, 20, 1)]));
    }
}
