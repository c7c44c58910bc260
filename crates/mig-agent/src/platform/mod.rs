//! Adapters to the GPU driver, the kubelet and the Kubernetes API.

pub mod errors;
pub mod k8s;
pub mod mig_client;
pub mod nvml;
pub mod pod_resources;

pub use errors::DriverError;
pub use mig_client::MigClient;
pub use mig_client::MigClientImpl;
pub use nvml::GpuDriver;
pub use nvml::NvmlDriver;
pub use pod_resources::KubeletPodResources;
pub use pod_resources::PodResourcesLister;
