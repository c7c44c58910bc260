use std::collections::BTreeMap;

use crate::annotations::AnnotationError;
use crate::annotations::AnnotationSchema;
use crate::annotations::SpecEntry;
use crate::catalog::GeometryCatalog;
use crate::device::DeviceStatus;
use crate::geometry::Geometry;
use crate::gpu::Gpu;
use crate::model::GpuModel;
use crate::model::UnknownModel;
use crate::profile::MigProfile;
use crate::LABEL_GPU_COUNT;
use crate::LABEL_GPU_PRODUCT;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("geometry {geometry} is not allowed on GPU {gpu_index} ({model})")]
    IllegalGeometry {
        gpu_index: u32,
        model: GpuModel,
        geometry: Geometry,
    },

    #[error("no GPU can host another {profile} device")]
    NoCapacity { profile: MigProfile },

    #[error(transparent)]
    UnknownModel(#[from] UnknownModel),

    #[error(transparent)]
    InvalidAnnotation(#[from] AnnotationError),
}

/// A cluster node and the MIG geometry of its GPUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    model: Option<GpuModel>,
    gpus: Vec<Gpu>,
}

impl Node {
    pub fn new(name: impl Into<String>, mut gpus: Vec<Gpu>) -> Self {
        gpus.sort_by_key(Gpu::index);
        Self {
            name: name.into(),
            model: gpus.first().map(Gpu::model),
            gpus,
        }
    }

    /// Builds the node from its labels alone, every GPU up to the GPU count
    /// label with an empty geometry. A node without a product label has no GPUs.
    pub fn from_labels(
        name: impl Into<String>,
        labels: &BTreeMap<String, String>,
        catalog: &GeometryCatalog,
    ) -> Result<Self, StateError> {
        let name = name.into();
        let Some((model, gpu_count)) = labelled_model(&name, labels)? else {
            return Ok(Self {
                name,
                model: None,
                gpus: Vec::new(),
            });
        };
        let gpus = (0..gpu_count)
            .map(|index| Gpu::new(model, index, Geometry::new(), Geometry::new(), catalog))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name,
            model: Some(model),
            gpus,
        })
    }

    /// Builds the node from its labels and the reported status annotations.
    ///
    /// The GPU model comes from the product label; a node without it has no
    /// GPUs. GPUs with no reported devices, up to the GPU count label, are
    /// added with an empty geometry.
    pub fn from_metadata(
        name: impl Into<String>,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
        catalog: &GeometryCatalog,
        schema: &AnnotationSchema,
    ) -> Result<Self, StateError> {
        let name = name.into();
        let Some((model, gpu_count)) = labelled_model(&name, labels)? else {
            return Ok(Self {
                name,
                model: None,
                gpus: Vec::new(),
            });
        };

        let (_, statuses) = schema.extract(annotations)?;
        let mut geometries: BTreeMap<u32, (Geometry, Geometry)> = BTreeMap::new();
        for status in statuses {
            let (used, free) = geometries.entry(status.gpu_index).or_default();
            match status.status {
                DeviceStatus::Used => used.add(status.profile, status.quantity),
                DeviceStatus::Free => free.add(status.profile, status.quantity),
                DeviceStatus::Unknown => {}
            }
        }
        for index in 0..gpu_count {
            geometries.entry(index).or_default();
        }

        let gpus = geometries
            .into_iter()
            .map(|(index, (used, free))| Gpu::new(model, index, used, free, catalog))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name,
            model: Some(model),
            gpus,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> Option<GpuModel> {
        self.model
    }

    pub fn gpus(&self) -> &[Gpu] {
        &self.gpus
    }

    pub fn gpu(&self, index: u32) -> Option<&Gpu> {
        self.gpus.iter().find(|gpu| gpu.index() == index)
    }

    /// Sum of the geometries of every GPU.
    pub fn geometry(&self) -> Geometry {
        self.gpus
            .iter()
            .fold(Geometry::new(), |acc, gpu| acc.merged(&gpu.geometry()))
    }

    pub fn has_free_capacity(&self) -> bool {
        self.gpus.iter().any(|gpu| {
            gpu.has_free_devices()
                || gpu
                    .allowed_geometries()
                    .iter()
                    .any(|candidate| candidate.contains(gpu.used()) && candidate != gpu.used())
        })
    }

    /// Makes sure at least one free `profile` device exists on the node,
    /// repartitioning the first GPU (lowest index, then catalog order) that
    /// can host it without touching used devices. The node is unchanged on error.
    pub fn update_geometry_for(&mut self, profile: &MigProfile) -> Result<(), StateError> {
        if self.gpus.iter().any(|gpu| gpu.free().get(profile) > 0) {
            return Ok(());
        }
        if self.gpus.iter_mut().any(|gpu| gpu.make_room_for(profile)) {
            return Ok(());
        }
        Err(StateError::NoCapacity { profile: *profile })
    }

    /// Checks that, for every GPU named in `specs`, some allowed geometry
    /// contains the requested devices. GPUs of a node without a known model
    /// cannot be checked and are accepted.
    pub fn check_spec_feasibility(
        &self,
        specs: &[SpecEntry],
        catalog: &GeometryCatalog,
    ) -> Result<(), StateError> {
        let Some(model) = self.model else {
            return Ok(());
        };
        let mut desired: BTreeMap<u32, Geometry> = BTreeMap::new();
        for spec in specs {
            desired
                .entry(spec.gpu_index)
                .or_default()
                .add(spec.profile, spec.quantity);
        }
        for (gpu_index, geometry) in desired {
            let reachable = match self.gpu(gpu_index) {
                Some(gpu) => gpu.can_reach(&geometry),
                None => Gpu::new(model, gpu_index, Geometry::new(), Geometry::new(), catalog)?
                    .can_reach(&geometry),
            };
            if !reachable {
                return Err(StateError::IllegalGeometry {
                    gpu_index,
                    model,
                    geometry,
                });
            }
        }
        Ok(())
    }
}

/// Model and GPU count from the node labels, `None` without a product label.
fn labelled_model(
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<Option<(GpuModel, u32)>, StateError> {
    let Some(product) = labels.get(LABEL_GPU_PRODUCT) else {
        tracing::debug!(node = %name, "node has no GPU product label");
        return Ok(None);
    };
    let model: GpuModel = product.parse()?;
    let gpu_count = labels
        .get(LABEL_GPU_COUNT)
        .and_then(|count| count.parse::<u32>().ok())
        .unwrap_or_default();
    Ok(Some((model, gpu_count)))
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

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn a100_gpu(index: u32, used: Geometry, free: Geometry) -> Gpu {
        Gpu::new(
            GpuModel::A100With40Gb,
            index,
            used,
            free,
            &GeometryCatalog::builtin(),
        )
        .expect("allowed geometry")
    }

    #[test]
    fn node_is_built_from_labels_and_status_annotations() {
        let labels = map(&[
            (LABEL_GPU_PRODUCT, "NVIDIA-A100-SXM4-80GB"),
            (LABEL_GPU_COUNT, "2"),
        ]);
        let annotations = map(&[
            ("n8s.nebuly.ai/status-gpu-0-1g.10gb-used", "2"),
            ("n8s.nebuly.ai/status-gpu-0-1g.10gb-free", "5"),
            ("n8s.nebuly.ai/spec-gpu-1-7g.80gb", "1"),
        ]);
        let node = Node::from_metadata(
            "node-1",
            &labels,
            &annotations,
            &GeometryCatalog::builtin(),
            &AnnotationSchema::default(),
        )
        .expect("valid node");

        assert_eq!(node.model(), Some(GpuModel::A100With80Gb));
        assert_eq!(node.gpus().len(), 2);
        assert_eq!(node.gpu(0).map(Gpu::geometry), Some(geometry(&[(1, 10, 7)])));
        assert_eq!(node.gpu(1).map(Gpu::geometry), Some(Geometry::new()));
        assert_eq!(node.geometry(), geometry(&[(1, 10, 7)]));
    }

    #[test]
    fn node_without_product_label_has_no_gpus() {
        let node = Node::from_metadata(
            "node-1",
            &BTreeMap::new(),
            &BTreeMap::new(),
            &GeometryCatalog::builtin(),
            &AnnotationSchema::default(),
        )
        .expect("valid node");
        assert!(node.gpus().is_empty());
        assert!(!node.has_free_capacity());
    }

    #[test]
    fn reported_geometry_outside_the_catalog_is_rejected() {
        let labels = map(&[(LABEL_GPU_PRODUCT, "A30")]);
        let annotations = map(&[("n8s.nebuly.ai/status-gpu-0-1g.6gb-free", "5")]);
        let result = Node::from_metadata(
            "node-1",
            &labels,
            &annotations,
            &GeometryCatalog::builtin(),
            &AnnotationSchema::default(),
        );
        assert!(matches!(result, Err(StateError::IllegalGeometry { .. })));
    }

    #[test]
    fn overflowing_status_quantities_are_rejected() {
        let labels = map(&[(LABEL_GPU_PRODUCT, "NVIDIA-A100-80GB-PCIe")]);
        let max = u32::MAX.to_string();
        let annotations = map(&[
            ("n8s.nebuly.ai/status-gpu-0-1g.10gb-used", max.as_str()),
            ("n8s.nebuly.ai/status-gpu-0-1g.10gb-free", "1"),
        ]);
        let result = Node::from_metadata(
            "node-1",
            &labels,
            &annotations,
            &GeometryCatalog::builtin(),
            &AnnotationSchema::default(),
        );
        assert!(matches!(result, Err(StateError::IllegalGeometry { .. })));
    }

    #[test]
    fn node_from_labels_has_empty_gpus() {
        let labels = map(&[
            (LABEL_GPU_PRODUCT, "NVIDIA-A100-80GB-PCIe"),
            (LABEL_GPU_COUNT, "2"),
        ]);
        let catalog = GeometryCatalog::builtin();
        let node = Node::from_labels("node-1", &labels, &catalog).expect("valid node");

        assert_eq!(node.model(), Some(GpuModel::A100With80Gb));
        assert_eq!(node.gpus().len(), 2);
        assert_eq!(node.geometry(), Geometry::new());

        let partial = [SpecEntry {
            gpu_index: 0,
            profile: MigProfile::new(1, 10),
            quantity: 3,
        }];
        assert_eq!(node.check_spec_feasibility(&partial, &catalog), Ok(()));
        assert!(Node::from_labels("node-1", &BTreeMap::new(), &catalog)
            .expect("valid node")
            .gpus()
            .is_empty());
    }

    #[test]
    fn update_is_a_no_op_when_a_free_device_exists() {
        let mut node = Node::new(
            "node-1",
            vec![
                a100_gpu(0, geometry(&[(7, 40, 1)]), Geometry::new()),
                a100_gpu(1, geometry(&[(1, 5, 1)]), geometry(&[(1, 5, 6)])),
            ],
        );
        let before = node.clone();
        node.update_geometry_for(&MigProfile::new(1, 5))
            .expect("free device available");
        assert_eq!(node, before);
    }

    #[test]
    fn update_picks_lowest_gpu_and_first_candidate() {
        let mut node = Node::new(
            "node-1",
            vec![
                a100_gpu(1, Geometry::new(), Geometry::new()),
                a100_gpu(0, geometry(&[(3, 20, 1)]), Geometry::new()),
            ],
        );
        node.update_geometry_for(&MigProfile::new(2, 10))
            .expect("room on GPU 0");

        // first candidate in canonical order holding a used 3g.20gb and a 2g.10gb
        assert_eq!(
            node.gpu(0).map(|gpu| gpu.free().clone()),
            Some(geometry(&[(1, 5, 1), (2, 10, 1)]))
        );
        assert_eq!(node.gpu(1).map(Gpu::geometry), Some(Geometry::new()));
    }

    #[test]
    fn update_without_capacity_leaves_node_unchanged() {
        let mut node = Node::new(
            "node-1",
            vec![a100_gpu(0, geometry(&[(7, 40, 1)]), Geometry::new())],
        );
        let before = node.clone();
        assert_eq!(
            node.update_geometry_for(&MigProfile::new(1, 5)),
            Err(StateError::NoCapacity {
                profile: MigProfile::new(1, 5)
            })
        );
        assert_eq!(node, before);
    }

    #[test]
    fn spec_feasibility_uses_the_gpu_catalog() {
        let node = Node::new(
            "node-1",
            vec![a100_gpu(0, Geometry::new(), Geometry::new())],
        );
        let catalog = GeometryCatalog::builtin();
        let spec = |gpu_index, gi, mem, quantity| SpecEntry {
            gpu_index,
            profile: MigProfile::new(gi, mem),
            quantity,
        };

        assert_eq!(
            node.check_spec_feasibility(&[spec(0, 3, 20, 1), spec(0, 1, 5, 2)], &catalog),
            Ok(())
        );
        assert_eq!(
            node.check_spec_feasibility(&[spec(3, 1, 5, 7)], &catalog),
            Ok(())
        );
        assert!(matches!(
            node.check_spec_feasibility(&[spec(0, 7, 40, 1), spec(0, 1, 5, 1)], &catalog),
            Err(StateError::IllegalGeometry { gpu_index: 0, .. })
        ));
    }
}
