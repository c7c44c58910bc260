//! MIG device inventory and mutation, combining kubelet accounting with the driver

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use mig_core::DeviceStatus;
use mig_core::MigDevice;
use mig_core::MigProfile;
use tracing::debug;

use crate::platform::errors::DriverError;
use crate::platform::nvml::GpuDriver;
use crate::platform::pod_resources::PodResourcesLister;
use crate::platform::pod_resources::ResourceDevices;

#[async_trait]
pub trait MigClient: Send + Sync {
    /// Every MIG device the kubelet can allocate, with `unknown` status.
    async fn list_allocatable(&self) -> Result<Vec<MigDevice>, Report<DriverError>>;

    /// MIG devices assigned to pods, with `used` status.
    async fn list_in_use(&self) -> Result<Vec<MigDevice>, Report<DriverError>>;

    /// Used devices followed by the allocatable devices nobody uses, marked `free`.
    async fn get_mig_devices(&self) -> Result<Vec<MigDevice>, Report<DriverError>> {
        let used = self.list_in_use().await?;
        let allocatable = self.list_allocatable().await?;

        let used_ids: HashSet<&str> = used.iter().map(MigDevice::device_id).collect();
        let free: Vec<MigDevice> = allocatable
            .into_iter()
            .filter(|device| !used_ids.contains(device.device_id()))
            .map(|device| device.with_status(DeviceStatus::Free))
            .collect();

        debug!(used = used.len(), free = free.len(), "correlated MIG devices");
        Ok(used.into_iter().chain(free).collect())
    }

    /// Creates all of `profiles` on `gpu_index`, trying several creation orders if needed.
    async fn create_migs(
        &self,
        gpu_index: u32,
        profiles: Vec<MigProfile>,
    ) -> Result<(), Report<DriverError>>;

    async fn delete_mig(&self, device: &MigDevice) -> Result<(), Report<DriverError>>;

    /// Deletes every MIG device except `keep`. Returns the number deleted.
    async fn delete_all_except(&self, keep: &[MigDevice]) -> Result<u32, Report<DriverError>>;
}

pub struct MigClientImpl<L, D> {
    lister: L,
    driver: Arc<D>,
    vendor: String,
}

impl<L, D> MigClientImpl<L, D>
where
    L: PodResourcesLister,
    D: GpuDriver + 'static,
{
    pub fn new(lister: L, driver: Arc<D>, vendor: impl Into<String>) -> Self {
        Self {
            lister,
            driver,
            vendor: vendor.into(),
        }
    }

    /// Parent GPU index of a MIG device.
    pub async fn resolve_parent_gpu_index(&self, device_id: &str) -> Result<u32, Report<DriverError>> {
        let device_id = device_id.to_string();
        self.blocking(move |driver| driver.gpu_index_of(&device_id))
            .await
    }

    /// Runs a driver call on the blocking pool. The call always runs to completion.
    async fn blocking<T, F>(&self, call: F) -> Result<T, Report<DriverError>>
    where
        T: Send + 'static,
        F: FnOnce(&D) -> Result<T, Report<DriverError>> + Send + 'static,
    {
        let driver = self.driver.clone();
        tokio::task::spawn_blocking(move || call(driver.as_ref()))
            .await
            .map_err(|e| Report::new(DriverError::driver(format!("driver task failed: {e}"))))?
    }

    async fn to_mig_devices(
        &self,
        resources: Vec<ResourceDevices>,
        status: DeviceStatus,
    ) -> Result<Vec<MigDevice>, Report<DriverError>> {
        let vendor_prefix = format!("{}/", self.vendor);
        let mut devices = Vec::new();
        for resource in resources {
            if !resource.resource_name.starts_with(&vendor_prefix) {
                continue;
            }
            let [device_id] = resource.device_ids.as_slice() else {
                return Err(Report::new(DriverError::driver(format!(
                    "resource {} lists {} device ids, expected exactly one",
                    resource.resource_name,
                    resource.device_ids.len()
                ))));
            };
            if !MigProfile::is_mig_resource(&resource.resource_name, &self.vendor) {
                continue;
            }
            let gpu_index = self
                .resolve_parent_gpu_index(device_id)
                .await
                .attach_printable_lazy(|| format!("resource {}", resource.resource_name))?;
            let device = MigDevice::new(&resource.resource_name, device_id, status, gpu_index)
                .map_err(|e| Report::new(DriverError::driver(e.to_string())))?;
            devices.push(device);
        }
        Ok(devices)
    }
}

#[async_trait]
impl<L, D> MigClient for MigClientImpl<L, D>
where
    L: PodResourcesLister,
    D: GpuDriver + 'static,
{
    async fn list_allocatable(&self) -> Result<Vec<MigDevice>, Report<DriverError>> {
        let resources = self.lister.allocatable().await?;
        self.to_mig_devices(resources, DeviceStatus::Unknown).await
    }

    async fn list_in_use(&self) -> Result<Vec<MigDevice>, Report<DriverError>> {
        let resources = self.lister.list().await?;
        self.to_mig_devices(resources, DeviceStatus::Used).await
    }

    async fn create_migs(
        &self,
        gpu_index: u32,
        profiles: Vec<MigProfile>,
    ) -> Result<(), Report<DriverError>> {
        self.blocking(move |driver| driver.create_migs(gpu_index, &profiles).map(|_| ()))
            .await
    }

    async fn delete_mig(&self, device: &MigDevice) -> Result<(), Report<DriverError>> {
        let device_id = device.device_id().to_string();
        self.blocking(move |driver| driver.delete_mig(&device_id))
            .await
    }

    async fn delete_all_except(&self, keep: &[MigDevice]) -> Result<u32, Report<DriverError>> {
        let keep: Vec<String> = keep.iter().map(|d| d.device_id().to_string()).collect();
        self.blocking(move |driver| driver.delete_all_except(&keep))
            .await
    }
}
