use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::profile::MigProfile;
use crate::profile::ProfileError;

/// Whether a MIG device is assigned to a container.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Used,
    Free,
    /// Allocatable but not yet correlated with the in-use list.
    Unknown,
}

impl DeviceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Used => "used",
            DeviceStatus::Free => "free",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for DeviceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "used" => Ok(DeviceStatus::Used),
            "free" => Ok(DeviceStatus::Free),
            "unknown" => Ok(DeviceStatus::Unknown),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A MIG device as advertised by the device plugin.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigDevice {
    gpu_index: u32,
    profile: MigProfile,
    device_id: String,
    resource_name: String,
    status: DeviceStatus,
}

impl MigDevice {
    /// Fails unless `resource_name` has the `<vendor>/mig-<profile>` shape.
    pub fn new(
        resource_name: impl Into<String>,
        device_id: impl Into<String>,
        status: DeviceStatus,
        gpu_index: u32,
    ) -> Result<Self, ProfileError> {
        let resource_name = resource_name.into();
        let profile = MigProfile::from_resource_name(&resource_name)?;
        Ok(Self {
            gpu_index,
            profile,
            device_id: device_id.into(),
            resource_name,
            status,
        })
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Opaque MIG device UUID.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn gpu_index(&self) -> u32 {
        self.gpu_index
    }

    pub fn profile(&self) -> MigProfile {
        self.profile
    }

    pub fn is_free(&self) -> bool {
        self.status == DeviceStatus::Free
    }

    pub fn is_used(&self) -> bool {
        self.status == DeviceStatus::Used
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = status;
        self
    }
}

impl fmt::Display for MigDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, gpu {}, {})",
            self.device_id, self.resource_name, self.gpu_index, self.status
        )
    }
}
