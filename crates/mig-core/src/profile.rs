//! MIG profile names such as `1g.10gb`

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

/// Pattern a profile name must match unless configured otherwise.
pub const DEFAULT_PROFILE_PATTERN: &str = r"[1-9][0-9]*g\.[0-9]+gb";

static PROFILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([1-9][0-9]*)g\.([0-9]+)gb$").expect("static profile regex"));

const MIG_RESOURCE_MARKER: &str = "/mig-";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("invalid MIG profile name `{name}`")]
    Invalid { name: String },

    #[error("resource `{resource_name}` is not a MIG resource")]
    NotMigResource { resource_name: String },
}

/// A MIG slice size: compute slices (GPU instance size) plus memory in GB.
///
/// Ordering is by compute slices first, then memory, which gives a stable
/// canonical order for geometries and plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigProfile {
    gi: u32,
    memory_gb: u32,
}

impl MigProfile {
    pub const fn new(gi: u32, memory_gb: u32) -> Self {
        Self { gi, memory_gb }
    }

    /// Number of compute slices.
    pub const fn gi(&self) -> u32 {
        self.gi
    }

    pub const fn memory_gb(&self) -> u32 {
        self.memory_gb
    }

    /// Extended resource name under which the device plugin advertises the profile,
    /// e.g. `nvidia.com/mig-1g.10gb`.
    pub fn resource_name(&self, vendor: &str) -> String {
        format!("{vendor}{MIG_RESOURCE_MARKER}{self}")
    }

    /// Parses the profile out of a `<vendor>/mig-<profile>` resource name.
    pub fn from_resource_name(resource_name: &str) -> Result<Self, ProfileError> {
        let (_, profile) = resource_name.split_once(MIG_RESOURCE_MARKER).ok_or_else(|| {
            ProfileError::NotMigResource {
                resource_name: resource_name.to_string(),
            }
        })?;
        profile.parse()
    }

    /// Returns true if `resource_name` has the `<vendor>/mig-` shape.
    pub fn is_mig_resource(resource_name: &str, vendor: &str) -> bool {
        resource_name
            .strip_prefix(vendor)
            .is_some_and(|rest| rest.starts_with(MIG_RESOURCE_MARKER))
    }
}

impl fmt::Display for MigProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}g.{}gb", self.gi, self.memory_gb)
    }
}

impl FromStr for MigProfile {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProfileError::Invalid {
            name: s.to_string(),
        };
        let captures = PROFILE_RE.captures(s).ok_or_else(invalid)?;
        let gi = captures[1].parse().map_err(|_| invalid())?;
        let memory_gb = captures[2].parse().map_err(|_| invalid())?;
        Ok(Self { gi, memory_gb })
    }
}

impl Serialize for MigProfile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MigProfile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn parses_and_formats_profile_names() {
        let profile: MigProfile = "3g.20gb".parse().expect("valid profile");
        assert_eq!(profile, MigProfile::new(3, 20));
        assert_eq!(profile.to_string(), "3g.20gb");
    }

    #[test]
    fn rejects_malformed_profile_names() {
        for name in ["0g.5gb", "1g5gb", "g.10gb", "1g.10", "1g.10gb.me", ""] {
            assert!(
                name.parse::<MigProfile>().is_err(),
                "`{name}` should be rejected"
            );
        }
    }

    #[test]
    fn resource_name_round_trips_through_vendor_prefix() {
        let profile = MigProfile::new(1, 10);
        let resource_name = profile.resource_name("nvidia.com");
        assert_eq!(resource_name, "nvidia.com/mig-1g.10gb");
        assert!(MigProfile::is_mig_resource(&resource_name, "nvidia.com"));
        assert_eq!(
            MigProfile::from_resource_name(&resource_name),
            Ok(profile)
        );
    }

    #[test]
    fn whole_gpu_resources_are_not_mig_resources() {
        assert!(!MigProfile::is_mig_resource("nvidia.com/gpu", "nvidia.com"));
        assert_eq!(
            MigProfile::from_resource_name("nvidia.com/gpu"),
            Err(ProfileError::NotMigResource {
                resource_name: "nvidia.com/gpu".to_string()
            })
        );
    }

    #[test]
    fn ordering_is_by_compute_then_memory() {
        let mut profiles = vec![
            MigProfile::new(2, 10),
            MigProfile::new(1, 10),
            MigProfile::new(1, 5),
        ];
        profiles.sort();
        assert_eq!(
            profiles,
            vec![
                MigProfile::new(1, 5),
                MigProfile::new(1, 10),
                MigProfile::new(2, 10)
            ]
        );
    }
}
