//! In-memory doubles for controller tests.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use error_stack::Report;
use mig_core::DeviceStatus;
use mig_core::MigDevice;
use mig_core::MigProfile;
use mig_core::DEFAULT_RESOURCE_VENDOR;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::platform::errors::DriverError;
use crate::platform::k8s::DevicePluginRefresher;
use crate::platform::k8s::KubernetesError;
use crate::platform::k8s::NodeSnapshot;
use crate::platform::k8s::NodeStore;
use crate::platform::mig_client::MigClient;

pub const NODE_NAME: &str = "gpu-node-1";

pub fn device(id: &str, profile: &str, status: DeviceStatus, gpu: u32) -> MigDevice {
    MigDevice::new(format!("nvidia.com/mig-{profile}"), id, status, gpu).expect("valid device")
}

pub fn annotations(items: &[(&str, &str)]) -> BTreeMap<String, String> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Node store enforcing resource versions like the apiserver does.
pub struct FakeNodeStore {
    node: Mutex<NodeSnapshot>,
    forced_conflicts: AtomicU32,
    pub patches: AtomicU32,
}

impl FakeNodeStore {
    pub fn new(labels: BTreeMap<String, String>, annotations: BTreeMap<String, String>) -> Arc<Self> {
        Arc::new(Self {
            node: Mutex::new(NodeSnapshot {
                name: NODE_NAME.to_string(),
                labels,
                annotations,
                resource_version: Some("1".to_string()),
            }),
            forced_conflicts: AtomicU32::new(0),
            patches: AtomicU32::new(0),
        })
    }

    /// The next `count` patches fail as if someone else wrote the node first.
    pub fn force_conflicts(&self, count: u32) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.node.lock().unwrap().annotations.clone()
    }

    pub fn set_annotation(&self, key: &str, value: &str) {
        let mut node = self.node.lock().unwrap();
        node.annotations.insert(key.to_string(), value.to_string());
        bump(&mut node);
    }
}

fn bump(node: &mut NodeSnapshot) {
    let version: u64 = node
        .resource_version
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    node.resource_version = Some((version + 1).to_string());
}

#[async_trait]
impl NodeStore for FakeNodeStore {
    async fn get(&self) -> Result<NodeSnapshot, Report<KubernetesError>> {
        Ok(self.node.lock().unwrap().clone())
    }

    async fn patch_annotations(
        &self,
        resource_version: Option<&str>,
        changes: BTreeMap<String, Option<String>>,
    ) -> Result<(), Report<KubernetesError>> {
        let conflict = || {
            Report::new(KubernetesError::Conflict {
                message: NODE_NAME.to_string(),
            })
        };
        if self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            let mut node = self.node.lock().unwrap();
            bump(&mut node);
            return Err(conflict());
        }

        let mut node = self.node.lock().unwrap();
        if resource_version.is_some() && resource_version != node.resource_version.as_deref() {
            return Err(conflict());
        }
        for (key, value) in changes {
            match value {
                Some(value) => node.annotations.insert(key, value),
                None => node.annotations.remove(&key),
            };
        }
        bump(&mut node);
        self.patches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Delete(String),
    Create(u32, Vec<MigProfile>),
}

/// MIG client over an in-memory device list.
#[derive(Default)]
pub struct FakeMigClient {
    devices: Mutex<Vec<MigDevice>>,
    calls: Mutex<Vec<Call>>,
    delete_errors: Mutex<HashMap<String, DriverError>>,
    create_error: Mutex<Option<DriverError>>,
    list_error: Mutex<Option<DriverError>>,
    next_id: AtomicU32,
    /// When set, each delete waits for `release` after signalling `entered`.
    pub delete_pause: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakeMigClient {
    pub fn new(devices: Vec<MigDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn devices(&self) -> Vec<MigDevice> {
        self.devices.lock().unwrap().clone()
    }

    pub fn fail_delete(&self, device_id: &str, error: DriverError) {
        self.delete_errors
            .lock()
            .unwrap()
            .insert(device_id.to_string(), error);
    }

    pub fn fail_create(&self, error: DriverError) {
        *self.create_error.lock().unwrap() = Some(error);
    }

    pub fn fail_list(&self, error: DriverError) {
        *self.list_error.lock().unwrap() = Some(error);
    }

    fn check_list(&self) -> Result<(), Report<DriverError>> {
        match self.list_error.lock().unwrap().clone() {
            Some(error) => Err(Report::new(error)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MigClient for FakeMigClient {
    async fn list_allocatable(&self) -> Result<Vec<MigDevice>, Report<DriverError>> {
        self.check_list()?;
        Ok(self
            .devices()
            .into_iter()
            .map(|d| d.with_status(DeviceStatus::Unknown))
            .collect())
    }

    async fn list_in_use(&self) -> Result<Vec<MigDevice>, Report<DriverError>> {
        self.check_list()?;
        Ok(self.devices().into_iter().filter(MigDevice::is_used).collect())
    }

    async fn create_migs(
        &self,
        gpu_index: u32,
        profiles: Vec<MigProfile>,
    ) -> Result<(), Report<DriverError>> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Create(gpu_index, profiles.clone()));
        if let Some(error) = self.create_error.lock().unwrap().clone() {
            return Err(Report::new(error));
        }
        for profile in profiles {
            let id = format!("MIG-new-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            let created = MigDevice::new(
                profile.resource_name(DEFAULT_RESOURCE_VENDOR),
                id,
                DeviceStatus::Free,
                gpu_index,
            )
            .expect("valid device");
            self.devices.lock().unwrap().push(created);
        }
        Ok(())
    }

    async fn delete_mig(&self, device: &MigDevice) -> Result<(), Report<DriverError>> {
        if let Some((entered, release)) = &self.delete_pause {
            entered.notify_one();
            release.notified().await;
        }
        self.calls
            .lock()
            .unwrap()
            .push(Call::Delete(device.device_id().to_string()));
        if let Some(error) = self.delete_errors.lock().unwrap().get(device.device_id()) {
            return Err(Report::new(error.clone()));
        }
        self.devices
            .lock()
            .unwrap()
            .retain(|d| d.device_id() != device.device_id());
        Ok(())
    }

    async fn delete_all_except(&self, keep: &[MigDevice]) -> Result<u32, Report<DriverError>> {
        let mut devices = self.devices.lock().unwrap();
        let before = devices.len();
        devices.retain(|d| keep.iter().any(|k| k.device_id() == d.device_id()));
        Ok((before - devices.len()) as u32)
    }
}

#[derive(Default)]
pub struct FakeRefresher {
    pub refreshes: AtomicU32,
}

#[async_trait]
impl DevicePluginRefresher for FakeRefresher {
    async fn refresh(
        &self,
        _cancellation_token: &CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
