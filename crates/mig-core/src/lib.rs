//! Core model of the MIG partitioning control plane
//!
//! This crate is free of I/O. It contains the allowed-geometry catalog, the
//! in-memory model of a node's GPUs and MIG devices, the codec for the node
//! annotations that carry desired and observed state, and the plan computer
//! that diffs the two.

pub mod annotations;
pub mod catalog;
pub mod device;
pub mod geometry;
pub mod gpu;
pub mod model;
pub mod node;
pub mod plan;
pub mod profile;
pub mod state;

pub use annotations::spec_matches_status;
pub use annotations::AnnotationError;
pub use annotations::AnnotationSchema;
pub use annotations::SpecEntry;
pub use annotations::StatusEntry;
pub use annotations::DEFAULT_ANNOTATION_PREFIX;
pub use catalog::AllowedGeometries;
pub use catalog::CatalogError;
pub use catalog::ExternalCatalog;
pub use catalog::GeometryCatalog;
pub use device::DeviceStatus;
pub use device::MigDevice;
pub use geometry::Geometry;
pub use gpu::Gpu;
pub use model::GpuModel;
pub use node::Node;
pub use node::StateError;
pub use plan::CreateOperation;
pub use plan::DeleteOperation;
pub use plan::MigConfigPlan;
pub use profile::MigProfile;
pub use profile::ProfileError;
pub use profile::DEFAULT_PROFILE_PATTERN;
pub use state::MigState;

/// Node label exposing the GPU product name.
pub const LABEL_GPU_PRODUCT: &str = "nvidia.com/gpu.product";
/// Node label exposing the number of GPUs.
pub const LABEL_GPU_COUNT: &str = "nvidia.com/gpu.count";
/// Vendor segment of the extended resources advertised by the device plugin.
pub const DEFAULT_RESOURCE_VENDOR: &str = "nvidia.com";
