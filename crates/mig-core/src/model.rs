//! GPU models that support MIG and their slice capacities

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::profile::MigProfile;

/// Closed set of MIG-capable GPU models known to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GpuModel {
    A30,
    A100With40Gb,
    A100With80Gb,
}

/// Per-model slice capacity and the profiles the hardware exposes.
#[derive(Debug)]
pub struct ModelCapacity {
    pub max_gi: u32,
    pub max_memory_gb: u32,
    pub profiles: &'static [MigProfile],
}

const A30_CAPACITY: ModelCapacity = ModelCapacity {
    max_gi: 4,
    max_memory_gb: 24,
    profiles: &[
        MigProfile::new(1, 6),
        MigProfile::new(2, 12),
        MigProfile::new(4, 24),
    ],
};

const A100_40GB_CAPACITY: ModelCapacity = ModelCapacity {
    max_gi: 7,
    max_memory_gb: 40,
    profiles: &[
        MigProfile::new(1, 5),
        MigProfile::new(2, 10),
        MigProfile::new(3, 20),
        MigProfile::new(4, 20),
        MigProfile::new(7, 40),
    ],
};

const A100_80GB_CAPACITY: ModelCapacity = ModelCapacity {
    max_gi: 7,
    max_memory_gb: 80,
    profiles: &[
        MigProfile::new(1, 10),
        MigProfile::new(2, 20),
        MigProfile::new(3, 40),
        MigProfile::new(4, 40),
        MigProfile::new(7, 80),
    ],
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown GPU model `{name}`")]
pub struct UnknownModel {
    pub name: String,
}

impl GpuModel {
    pub const ALL: [GpuModel; 3] = [GpuModel::A30, GpuModel::A100With40Gb, GpuModel::A100With80Gb];

    /// Canonical name used in logs and catalog dumps.
    pub const fn name(self) -> &'static str {
        match self {
            GpuModel::A30 => "A30",
            GpuModel::A100With40Gb => "A100-SXM4-40GB",
            GpuModel::A100With80Gb => "A100-SXM4-80GB",
        }
    }

    /// Spellings accepted from the `nvidia.com/gpu.product` label and catalog files.
    const fn aliases(self) -> &'static [&'static str] {
        match self {
            GpuModel::A30 => &["A30", "NVIDIA-A30"],
            GpuModel::A100With40Gb => &[
                "A100-SXM4-40GB",
                "NVIDIA-A100-SXM4-40GB",
                "NVIDIA-A100-40GB-SXM4",
                "NVIDIA-A100-PCIE-40GB",
            ],
            GpuModel::A100With80Gb => &[
                "A100-SXM4-80GB",
                "NVIDIA-A100-SXM4-80GB",
                "NVIDIA-A100-80GB-PCIe",
                "NVIDIA-A100-80GB-SXM4",
            ],
        }
    }

    pub const fn capacity(self) -> &'static ModelCapacity {
        match self {
            GpuModel::A30 => &A30_CAPACITY,
            GpuModel::A100With40Gb => &A100_40GB_CAPACITY,
            GpuModel::A100With80Gb => &A100_80GB_CAPACITY,
        }
    }

    pub fn supports(self, profile: &MigProfile) -> bool {
        self.capacity().profiles.contains(profile)
    }
}

impl fmt::Display for GpuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GpuModel {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        GpuModel::ALL
            .into_iter()
            .find(|model| {
                model
                    .aliases()
                    .iter()
                    .any(|alias| alias.eq_ignore_ascii_case(trimmed))
            })
            .ok_or_else(|| UnknownModel {
                name: s.to_string(),
            })
    }
}

impl Serialize for GpuModel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for GpuModel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
