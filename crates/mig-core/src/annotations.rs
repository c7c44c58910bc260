//! Node annotations carrying the desired and observed MIG geometry
//!
//! Desired state is written by an operator (or a scheduler extension) as
//! `<prefix>/spec-gpu-<index>-<profile>: <quantity>`. Observed state is written
//! by the reporter as `<prefix>/status-gpu-<index>-<profile>-<used|free>: <quantity>`.

use std::collections::BTreeMap;

use regex::Regex;

use crate::device::DeviceStatus;
use crate::device::MigDevice;
use crate::profile::MigProfile;
use crate::profile::DEFAULT_PROFILE_PATTERN;

pub const DEFAULT_ANNOTATION_PREFIX: &str = "n8s.nebuly.ai";

const SPEC_MARKER: &str = "spec-gpu-";
const STATUS_MARKER: &str = "status-gpu-";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnotationError {
    #[error("invalid annotation key `{key}`: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("invalid value `{value}` for annotation `{key}`: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid profile pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// One desired `(gpu, profile) -> quantity` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecEntry {
    pub gpu_index: u32,
    pub profile: MigProfile,
    pub quantity: u32,
}

/// One observed `(gpu, profile, status) -> quantity` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusEntry {
    pub gpu_index: u32,
    pub profile: MigProfile,
    pub status: DeviceStatus,
    pub quantity: u32,
}

/// Key layout of the MIG annotations.
#[derive(Debug, Clone)]
pub struct AnnotationSchema {
    prefix: String,
    profile_pattern: Regex,
}

impl Default for AnnotationSchema {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_ANNOTATION_PREFIX.to_string(),
            profile_pattern: anchored(DEFAULT_PROFILE_PATTERN).expect("default profile pattern"),
        }
    }
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

impl AnnotationSchema {
    pub fn new(prefix: impl Into<String>, profile_pattern: &str) -> Result<Self, AnnotationError> {
        let profile_pattern =
            anchored(profile_pattern).map_err(|e| AnnotationError::InvalidPattern {
                pattern: profile_pattern.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
            profile_pattern,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn spec_prefix(&self) -> String {
        format!("{}/{SPEC_MARKER}", self.prefix)
    }

    fn status_prefix(&self) -> String {
        format!("{}/{STATUS_MARKER}", self.prefix)
    }

    pub fn spec_key(&self, gpu_index: u32, profile: MigProfile) -> String {
        format!("{}{gpu_index}-{profile}", self.spec_prefix())
    }

    pub fn status_key(&self, gpu_index: u32, profile: MigProfile, status: DeviceStatus) -> String {
        format!("{}{gpu_index}-{profile}-{status}", self.status_prefix())
    }

    pub fn is_spec_key(&self, key: &str) -> bool {
        key.starts_with(&self.spec_prefix())
    }

    pub fn is_status_key(&self, key: &str) -> bool {
        key.starts_with(&self.status_prefix())
    }

    fn parse_profile(&self, key: &str, raw: &str) -> Result<MigProfile, AnnotationError> {
        let invalid = |reason: String| AnnotationError::InvalidKey {
            key: key.to_string(),
            reason,
        };
        if !self.profile_pattern.is_match(raw) {
            return Err(invalid(format!(
                "profile `{raw}` does not match `{}`",
                self.profile_pattern.as_str()
            )));
        }
        raw.parse().map_err(|e| invalid(format!("{e}")))
    }

    fn parse_gpu_index(key: &str, raw: &str) -> Result<u32, AnnotationError> {
        raw.parse().map_err(|_| AnnotationError::InvalidKey {
            key: key.to_string(),
            reason: format!("GPU index `{raw}` is not a non-negative integer"),
        })
    }

    fn parse_quantity(key: &str, value: &str, allow_zero: bool) -> Result<u32, AnnotationError> {
        let invalid = |reason: &str| AnnotationError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let quantity: u32 = value
            .trim()
            .parse()
            .map_err(|_| invalid("quantity is not an integer"))?;
        if quantity == 0 && !allow_zero {
            return Err(invalid("quantity must be positive"));
        }
        Ok(quantity)
    }

    pub fn parse_spec(&self, key: &str, value: &str) -> Result<SpecEntry, AnnotationError> {
        let suffix = key
            .strip_prefix(&self.spec_prefix())
            .ok_or_else(|| AnnotationError::InvalidKey {
                key: key.to_string(),
                reason: format!("missing `{}` prefix", self.spec_prefix()),
            })?;
        let (index, profile) = suffix
            .split_once('-')
            .ok_or_else(|| AnnotationError::InvalidKey {
                key: key.to_string(),
                reason: "expected `<index>-<profile>`".to_string(),
            })?;
        Ok(SpecEntry {
            gpu_index: Self::parse_gpu_index(key, index)?,
            profile: self.parse_profile(key, profile)?,
            quantity: Self::parse_quantity(key, value, false)?,
        })
    }

    pub fn parse_status(&self, key: &str, value: &str) -> Result<StatusEntry, AnnotationError> {
        let invalid_layout = || AnnotationError::InvalidKey {
            key: key.to_string(),
            reason: "expected `<index>-<profile>-<used|free>`".to_string(),
        };
        let suffix = key
            .strip_prefix(&self.status_prefix())
            .ok_or_else(|| AnnotationError::InvalidKey {
                key: key.to_string(),
                reason: format!("missing `{}` prefix", self.status_prefix()),
            })?;
        let (rest, status) = suffix.rsplit_once('-').ok_or_else(invalid_layout)?;
        let (index, profile) = rest.split_once('-').ok_or_else(invalid_layout)?;
        let status = match status {
            "used" => DeviceStatus::Used,
            "free" => DeviceStatus::Free,
            other => {
                return Err(AnnotationError::InvalidKey {
                    key: key.to_string(),
                    reason: format!("status `{other}` is neither `used` nor `free`"),
                })
            }
        };
        Ok(StatusEntry {
            gpu_index: Self::parse_gpu_index(key, index)?,
            profile: self.parse_profile(key, profile)?,
            status,
            quantity: Self::parse_quantity(key, value, true)?,
        })
    }

    /// Status annotations describing `devices`. Devices whose status is
    /// unknown are left out.
    pub fn emit(&self, devices: &[MigDevice]) -> BTreeMap<String, String> {
        let mut counts: BTreeMap<(u32, MigProfile, DeviceStatus), u32> = BTreeMap::new();
        for device in devices
            .iter()
            .filter(|d| d.status() != DeviceStatus::Unknown)
        {
            *counts
                .entry((device.gpu_index(), device.profile(), device.status()))
                .or_default() += 1;
        }
        counts
            .into_iter()
            .map(|((gpu_index, profile, status), quantity)| {
                (
                    self.status_key(gpu_index, profile, status),
                    quantity.to_string(),
                )
            })
            .collect()
    }

    /// Spec and status entries found in `annotations`. Unrelated keys are ignored;
    /// a malformed key or value under one of the two prefixes fails the whole call.
    pub fn extract(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(Vec<SpecEntry>, Vec<StatusEntry>), AnnotationError> {
        let mut specs = Vec::new();
        let mut statuses = Vec::new();
        for (key, value) in annotations {
            if self.is_spec_key(key) {
                specs.push(self.parse_spec(key, value)?);
            } else if self.is_status_key(key) {
                statuses.push(self.parse_status(key, value)?);
            }
        }
        Ok((specs, statuses))
    }

    /// The status annotations owned by the reporter.
    pub fn status_subset(&self, annotations: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        annotations
            .iter()
            .filter(|(key, _)| self.is_status_key(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Returns true if the desired and reported quantities agree per `(gpu, profile)`,
/// counting used and free devices together.
pub fn spec_matches_status(specs: &[SpecEntry], statuses: &[StatusEntry]) -> bool {
    let mut desired: BTreeMap<(u32, MigProfile), u64> = BTreeMap::new();
    for spec in specs.iter().filter(|s| s.quantity > 0) {
        *desired.entry((spec.gpu_index, spec.profile)).or_default() += u64::from(spec.quantity);
    }
    let mut observed: BTreeMap<(u32, MigProfile), u64> = BTreeMap::new();
    for status in statuses.iter().filter(|s| s.quantity > 0) {
        *observed
            .entry((status.gpu_index, status.profile))
            .or_default() += u64::from(status.quantity);
    }
    desired == observed
}
