use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::profile::MigProfile;

/// A multiset of MIG profiles describing one partitioning of a GPU.
///
/// The map is kept sorted by profile, so the derived ordering compares
/// geometries lexicographically on their canonical form. Entries with a
/// zero quantity are never stored by the mutating helpers; they can only
/// appear through deserialization, where catalog validation reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Geometry(BTreeMap<MigProfile, u32>);

impl Geometry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, profile: &MigProfile) -> u32 {
        self.0.get(profile).copied().unwrap_or_default()
    }

    pub fn add(&mut self, profile: MigProfile, quantity: u32) {
        if quantity > 0 {
            let entry = self.0.entry(profile).or_default();
            *entry = entry.saturating_add(quantity);
        }
    }

    pub fn set(&mut self, profile: MigProfile, quantity: u32) {
        if quantity == 0 {
            self.0.remove(&profile);
        } else {
            self.0.insert(profile, quantity);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MigProfile, &u32)> {
        self.0.iter()
    }

    pub fn profiles(&self) -> impl Iterator<Item = &MigProfile> {
        self.0.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|quantity| *quantity == 0)
    }

    /// Total number of MIG devices.
    pub fn device_count(&self) -> u64 {
        self.0.values().map(|quantity| u64::from(*quantity)).sum()
    }

    /// Compute slices of every device together. Quantities come from
    /// operator input, so totals are computed in `u64`.
    pub fn total_gi(&self) -> u64 {
        self.0
            .iter()
            .map(|(profile, quantity)| u64::from(profile.gi()) * u64::from(*quantity))
            .sum()
    }

    pub fn total_memory_gb(&self) -> u64 {
        self.0
            .iter()
            .map(|(profile, quantity)| u64::from(profile.memory_gb()) * u64::from(*quantity))
            .sum()
    }

    /// Pointwise sum (multiset union with multiplicities added).
    pub fn merged(&self, other: &Geometry) -> Geometry {
        let mut result = self.clone();
        for (profile, quantity) in other.iter() {
            result.add(*profile, *quantity);
        }
        result
    }

    /// Pointwise difference, saturating at zero.
    pub fn difference(&self, other: &Geometry) -> Geometry {
        self.iter()
            .map(|(profile, quantity)| (*profile, quantity.saturating_sub(other.get(profile))))
            .collect()
    }

    /// Returns true if every profile of `other` is present here at least as many times.
    pub fn contains(&self, other: &Geometry) -> bool {
        other
            .iter()
            .all(|(profile, quantity)| self.get(profile) >= *quantity)
    }
}

impl FromIterator<(MigProfile, u32)> for Geometry {
    fn from_iter<T: IntoIterator<Item = (MigProfile, u32)>>(iter: T) -> Self {
        let mut geometry = Geometry::new();
        for (profile, quantity) in iter {
            geometry.add(profile, quantity);
        }
        geometry
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (profile, quantity)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{profile}: {quantity}")?;
        }
        f.write_str("}")
    }
}
