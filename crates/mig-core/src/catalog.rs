//! Allowed MIG geometries per GPU model

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::geometry::Geometry;
use crate::model::GpuModel;
use crate::profile::MigProfile;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("GPU model {model} does not support profile {profile} (geometry {geometry})")]
    UnsupportedProfile {
        model: GpuModel,
        profile: MigProfile,
        geometry: Geometry,
    },

    #[error("geometry {geometry} needs {required} compute slices, GPU model {model} has {capacity}")]
    ComputeOverCapacity {
        model: GpuModel,
        geometry: Geometry,
        required: u64,
        capacity: u32,
    },

    #[error("geometry {geometry} needs {required}GB of memory, GPU model {model} has {capacity}GB")]
    MemoryOverCapacity {
        model: GpuModel,
        geometry: Geometry,
        required: u64,
        capacity: u32,
    },

    #[error("geometry {geometry} of GPU model {model} has a zero quantity for {profile}")]
    ZeroQuantity {
        model: GpuModel,
        profile: MigProfile,
        geometry: Geometry,
    },

    #[error("geometry {geometry} is listed more than once for GPU model {model}")]
    DuplicateGeometry { model: GpuModel, geometry: Geometry },

    #[error("GPU model {model} has no allowed geometries")]
    EmptyModel { model: GpuModel },

    #[error("invalid external catalog: {message}")]
    Decode { message: String },
}

/// Shapes shared by both A100 variants, as `(compute slices, quantity)` pairs.
/// The memory of each profile depends on the variant.
const A100_SHAPES: &[&[(u32, u32)]] = &[
    &[(7, 1)],
    &[(4, 1), (2, 1), (1, 1)],
    &[(4, 1), (1, 3)],
    &[(3, 2)],
    &[(3, 1), (2, 1), (1, 1)],
    &[(3, 1), (1, 3)],
    &[(2, 2), (3, 1)],
    &[(2, 1), (1, 2), (3, 1)],
    &[(2, 3), (1, 1)],
    &[(2, 2), (1, 3)],
    &[(2, 1), (1, 5)],
    &[(1, 7)],
];

const A30_SHAPES: &[&[(u32, u32)]] = &[&[(4, 1)], &[(2, 2)], &[(2, 1), (1, 2)], &[(1, 4)]];

/// Memory size in GB of the profile with `gi` compute slices on `model`.
fn builtin_memory_for(model: GpuModel, gi: u32) -> u32 {
    model
        .capacity()
        .profiles
        .iter()
        .find(|profile| profile.gi() == gi)
        .map(MigProfile::memory_gb)
        .unwrap_or_default()
}

fn builtin_geometries(model: GpuModel, shapes: &[&[(u32, u32)]]) -> Vec<Geometry> {
    shapes
        .iter()
        .map(|shape| {
            shape
                .iter()
                .map(|(gi, quantity)| {
                    (
                        MigProfile::new(*gi, builtin_memory_for(model, *gi)),
                        *quantity,
                    )
                })
                .collect()
        })
        .collect()
}

/// Mapping from GPU model to its allowed geometries.
///
/// Geometries are kept in canonical order so that every consumer iterates
/// candidates the same way, which is what makes plans reproducible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryCatalog {
    models: BTreeMap<GpuModel, Vec<Geometry>>,
}

impl Default for GeometryCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl GeometryCatalog {
    /// The catalog baked into the binary.
    pub fn builtin() -> Self {
        Self::from_entries([
            (GpuModel::A30, builtin_geometries(GpuModel::A30, A30_SHAPES)),
            (
                GpuModel::A100With40Gb,
                builtin_geometries(GpuModel::A100With40Gb, A100_SHAPES),
            ),
            (
                GpuModel::A100With80Gb,
                builtin_geometries(GpuModel::A100With80Gb, A100_SHAPES),
            ),
        ])
    }

    /// Builds a catalog from raw entries. Geometries are sorted but not
    /// de-duplicated, so [`GeometryCatalog::validate`] can still report duplicates.
    pub fn from_entries(entries: impl IntoIterator<Item = (GpuModel, Vec<Geometry>)>) -> Self {
        let models = entries
            .into_iter()
            .map(|(model, mut geometries)| {
                geometries.sort();
                (model, geometries)
            })
            .collect();
        Self { models }
    }

    /// Allowed geometries of `model` in canonical order, empty if the model is unknown.
    pub fn allowed_for(&self, model: GpuModel) -> &[Geometry] {
        self.models.get(&model).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn allows(&self, model: GpuModel, geometry: &Geometry) -> bool {
        self.allowed_for(model).contains(geometry)
    }

    pub fn models(&self) -> impl Iterator<Item = GpuModel> + '_ {
        self.models.keys().copied()
    }

    /// Checks every geometry against the capacity of its model.
    pub fn validate(&self) -> Result<(), CatalogError> {
        for (model, geometries) in &self.models {
            let model = *model;
            if geometries.is_empty() {
                return Err(CatalogError::EmptyModel { model });
            }
            for geometry in geometries {
                validate_geometry(model, geometry)?;
            }
            if let Some(window) = geometries.windows(2).find(|w| w[0] == w[1]) {
                return Err(CatalogError::DuplicateGeometry {
                    model,
                    geometry: window[0].clone(),
                });
            }
        }
        Ok(())
    }

    /// Replaces the geometries of every model listed in `external`.
    pub fn merge(&mut self, external: &ExternalCatalog) -> Result<(), CatalogError> {
        for (model, mut geometries) in external.group_by_model()? {
            geometries.sort();
            tracing::debug!(
                %model,
                geometries = geometries.len(),
                "overriding allowed geometries from external catalog"
            );
            self.models.insert(model, geometries);
        }
        Ok(())
    }
}

fn validate_geometry(model: GpuModel, geometry: &Geometry) -> Result<(), CatalogError> {
    let capacity = model.capacity();
    for (profile, quantity) in geometry.iter() {
        if *quantity == 0 {
            return Err(CatalogError::ZeroQuantity {
                model,
                profile: *profile,
                geometry: geometry.clone(),
            });
        }
        if !model.supports(profile) {
            return Err(CatalogError::UnsupportedProfile {
                model,
                profile: *profile,
                geometry: geometry.clone(),
            });
        }
    }
    let gi = geometry.total_gi();
    if gi > u64::from(capacity.max_gi) {
        return Err(CatalogError::ComputeOverCapacity {
            model,
            geometry: geometry.clone(),
            required: gi,
            capacity: capacity.max_gi,
        });
    }
    let memory = geometry.total_memory_gb();
    if memory > u64::from(capacity.max_memory_gb) {
        return Err(CatalogError::MemoryOverCapacity {
            model,
            geometry: geometry.clone(),
            required: memory,
            capacity: capacity.max_memory_gb,
        });
    }
    Ok(())
}

/// One entry of an external catalog document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedGeometries {
    pub models: Vec<GpuModel>,
    pub allowed_geometries: Vec<Geometry>,
}

/// Operator-supplied catalog, a YAML (or JSON) list of [`AllowedGeometries`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalCatalog(pub Vec<AllowedGeometries>);

impl ExternalCatalog {
    pub fn from_yaml_str(document: &str) -> Result<Self, CatalogError> {
        serde_yaml::from_str(document).map_err(|e| CatalogError::Decode {
            message: e.to_string(),
        })
    }

    /// Geometries per model; when a model appears in several entries the last one wins.
    pub fn group_by_model(&self) -> Result<BTreeMap<GpuModel, Vec<Geometry>>, CatalogError> {
        let mut grouped = BTreeMap::new();
        for entry in &self.0 {
            if entry.models.is_empty() {
                return Err(CatalogError::Decode {
                    message: "entry without models".to_string(),
                });
            }
            for model in &entry.models {
                grouped.insert(*model, entry.allowed_geometries.clone());
            }
        }
        Ok(grouped)
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

    #[test]
    fn builtin_catalog_is_within_capacity() {
        let catalog = GeometryCatalog::builtin();
        assert_eq!(catalog.validate(), Ok(()));
        for model in catalog.models() {
            let capacity = model.capacity();
            for g in catalog.allowed_for(model) {
                assert!(g.total_gi() <= u64::from(capacity.max_gi), "{model}: {g}");
                assert!(g.total_memory_gb() <= u64::from(capacity.max_memory_gb), "{model}: {g}");
            }
        }
    }

    #[test]
    fn builtin_catalog_lists_every_model() {
        let catalog = GeometryCatalog::builtin();
        assert_eq!(catalog.allowed_for(GpuModel::A30).len(), 4);
        assert_eq!(catalog.allowed_for(GpuModel::A100With40Gb).len(), 12);
        assert_eq!(catalog.allowed_for(GpuModel::A100With80Gb).len(), 12);
        assert!(catalog.allows(GpuModel::A100With80Gb, &geometry(&[(1, 10, 7)])));
        assert!(catalog.allows(GpuModel::A30, &geometry(&[(2, 12, 1), (1, 6, 2)])));
        assert!(!catalog.allows(GpuModel::A30, &geometry(&[(1, 5, 7)])));
    }

    #[test]
    fn allowed_geometries_are_in_canonical_order() {
        let catalog = GeometryCatalog::builtin();
        for model in catalog.models() {
            let allowed = catalog.allowed_for(model);
            let mut sorted = allowed.to_vec();
            sorted.sort();
            assert_eq!(allowed, sorted.as_slice());
        }
    }

    #[test]
    fn validation_rejects_over_capacity_geometries() {
        let catalog =
            GeometryCatalog::from_entries([(GpuModel::A30, vec![geometry(&[(2, 12, 3)])])]);
        assert_eq!(
            catalog.validate(),
            Err(CatalogError::ComputeOverCapacity {
                model: GpuModel::A30,
                geometry: geometry(&[(2, 12, 3)]),
                required: 6,
                capacity: 4,
            })
        );
    }

    #[test]
    fn validation_rejects_foreign_profiles_and_duplicates() {
        let foreign =
            GeometryCatalog::from_entries([(GpuModel::A30, vec![geometry(&[(1, 5, 1)])])]);
        assert!(matches!(
            foreign.validate(),
            Err(CatalogError::UnsupportedProfile { .. })
        ));

        let duplicated = GeometryCatalog::from_entries([(
            GpuModel::A100With40Gb,
            vec![geometry(&[(3, 20, 2)]), geometry(&[(3, 20, 2)])],
        )]);
        assert!(matches!(
            duplicated.validate(),
            Err(CatalogError::DuplicateGeometry { .. })
        ));
    }

    #[test]
    fn external_catalog_overrides_builtin_models() {
        let document = r#"
- models: ["NVIDIA-A100-40GB-SXM4"]
  allowedGeometries:
    - 1g.5gb: 7
- models: ["A30"]
  allowedGeometries:
    - 4g.24gb: 1
- models: ["A30"]
  allowedGeometries:
    - 1g.6gb: 4
    - 2g.12gb: 2
"#;
        let external = ExternalCatalog::from_yaml_str(document).expect("valid document");
        let mut catalog = GeometryCatalog::builtin();
        catalog.merge(&external).expect("merge");

        assert_eq!(
            catalog.allowed_for(GpuModel::A100With40Gb),
            &[geometry(&[(1, 5, 7)])]
        );
        assert_eq!(
            catalog.allowed_for(GpuModel::A30),
            &[geometry(&[(1, 6, 4)]), geometry(&[(2, 12, 2)])]
        );
        assert_eq!(catalog.allowed_for(GpuModel::A100With80Gb).len(), 12);
        assert_eq!(catalog.validate(), Ok(()));
    }

    #[test]
    fn external_catalog_with_zero_quantity_fails_validation() {
        let document = r#"[{"models": ["A30"], "allowedGeometries": [{"1g.6gb": 0}]}]"#;
        let external = ExternalCatalog::from_yaml_str(document).expect("json is valid yaml");
        let mut catalog = GeometryCatalog::builtin();
        catalog.merge(&external).expect("merge");
        assert!(matches!(
            catalog.validate(),
            Err(CatalogError::ZeroQuantity { .. })
        ));
    }

    #[test]
    fn external_catalog_with_huge_quantity_is_over_capacity() {
        let document = "- models: [NVIDIA-A100-80GB-PCIe]\n  allowedGeometries:\n    - 7g.80gb: 1000000000\n";
        let external = ExternalCatalog::from_yaml_str(document).expect("valid document");
        let mut catalog = GeometryCatalog::builtin();
        catalog.merge(&external).expect("merge");
        assert_eq!(
            catalog.validate(),
            Err(CatalogError::ComputeOverCapacity {
                model: GpuModel::A100With80Gb,
                geometry: geometry(&[(7, 80, 1_000_000_000)]),
                required: 7_000_000_000,
                capacity: 7,
            })
        );
    }

    #[test]
    fn external_catalog_with_unknown_model_is_rejected() {
        let document = "- models: [Tesla-T4]\n  allowedGeometries: []\n";
        assert!(matches!(
            ExternalCatalog::from_yaml_str(document),
            Err(CatalogError::Decode { .. })
        ));
    }
}
