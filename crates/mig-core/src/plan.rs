//! Diff between the observed MIG devices and the desired spec

use std::collections::BTreeMap;
use std::fmt;

use crate::annotations::SpecEntry;
use crate::device::MigDevice;
use crate::profile::MigProfile;
use crate::state::MigState;

/// Deletes `quantity` devices of `profile` on a GPU, trying `resources` in order.
#[derive(Debug, Clone, Eq)]
pub struct DeleteOperation {
    pub gpu_index: u32,
    pub profile: MigProfile,
    pub resources: Vec<MigDevice>,
    pub quantity: u32,
}

impl DeleteOperation {
    fn all(gpu_index: u32, profile: MigProfile, resources: Vec<MigDevice>) -> Self {
        Self {
            gpu_index,
            profile,
            quantity: resources.len() as u32,
            resources,
        }
    }

    fn sort_key(&self) -> (u32, MigProfile, u32, Vec<MigDevice>) {
        let mut resources = self.resources.clone();
        resources.sort();
        (self.gpu_index, self.profile, self.quantity, resources)
    }
}

/// Resources are compared as a multiset.
impl PartialEq for DeleteOperation {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CreateOperation {
    pub gpu_index: u32,
    pub profile: MigProfile,
    pub quantity: u32,
}

/// Operations turning the observed state into the desired one.
/// Deletes are always applied before creates.
#[derive(Debug, Clone, Default, Eq)]
pub struct MigConfigPlan {
    pub deletes: Vec<DeleteOperation>,
    pub creates: Vec<CreateOperation>,
}

impl MigConfigPlan {
    pub fn new(state: &MigState, desired: &[SpecEntry]) -> Self {
        let mut desired_by_gpu: BTreeMap<u32, BTreeMap<MigProfile, u32>> = BTreeMap::new();
        for spec in desired {
            let total = desired_by_gpu
                .entry(spec.gpu_index)
                .or_default()
                .entry(spec.profile)
                .or_default();
            *total = total.saturating_add(spec.quantity);
        }

        let mut plan = MigConfigPlan::default();

        // Devices on GPUs missing from the spec, or of a profile the spec does
        // not mention for their GPU, are all deleted.
        let mut off_spec = state.clone();
        for (gpu_index, profiles) in &desired_by_gpu {
            off_spec = off_spec.without_profiles(*gpu_index, profiles.keys());
        }
        for ((gpu_index, profile), devices) in off_spec.group_by_profile() {
            plan.deletes
                .push(DeleteOperation::all(gpu_index, profile, devices));
        }

        let actual_by_profile = state.group_by_profile();
        for (gpu_index, profiles) in desired_by_gpu {
            for (profile, total_desired) in profiles {
                let actual = actual_by_profile
                    .get(&(gpu_index, profile))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let actual_count = actual.len() as u32;

                if total_desired > actual_count {
                    // Free devices of the profile are re-created along with the
                    // missing ones, which gives the per-GPU create batch more
                    // creation orders to try.
                    let free: Vec<MigDevice> =
                        actual.iter().filter(|d| d.is_free()).cloned().collect();
                    if !free.is_empty() {
                        let quantity = free.len() as u32;
                        plan.deletes
                            .push(DeleteOperation::all(gpu_index, profile, free));
                        plan.creates.push(CreateOperation {
                            gpu_index,
                            profile,
                            quantity,
                        });
                    }
                    plan.creates.push(CreateOperation {
                        gpu_index,
                        profile,
                        quantity: total_desired - actual_count,
                    });
                } else if total_desired < actual_count {
                    let quantity = actual_count - total_desired;
                    plan.deletes.push(DeleteOperation {
                        gpu_index,
                        profile,
                        resources: deletion_candidates(actual, quantity as usize),
                        quantity,
                    });
                }
            }
        }

        plan.deletes.sort_by_key(|op| (op.gpu_index, op.profile));
        plan.creates.sort_by_key(|op| (op.gpu_index, op.profile));
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.creates.is_empty()
    }
}

/// Picks `count` devices to delete, free ones first, each group in observed order.
fn deletion_candidates(devices: &[MigDevice], count: usize) -> Vec<MigDevice> {
    let free = devices.iter().filter(|d| d.is_free());
    let not_free = devices.iter().filter(|d| !d.is_free());
    free.chain(not_free).take(count).cloned().collect()
}

/// Both operation lists are compared as multisets.
impl PartialEq for MigConfigPlan {
    fn eq(&self, other: &Self) -> bool {
        let mut deletes: Vec<_> = self.deletes.iter().map(DeleteOperation::sort_key).collect();
        let mut other_deletes: Vec<_> = other.deletes.iter().map(DeleteOperation::sort_key).collect();
        deletes.sort();
        other_deletes.sort();

        let mut creates = self.creates.clone();
        let mut other_creates = other.creates.clone();
        creates.sort();
        other_creates.sort();

        deletes == other_deletes && creates == other_creates
    }
}

impl fmt::Display for MigConfigPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| {
            let result = if first { Ok(()) } else { f.write_str(", ") };
            first = false;
            result
        };
        for op in &self.deletes {
            sep(f)?;
            write!(f, "delete {}x{} on gpu {}", op.quantity, op.profile, op.gpu_index)?;
        }
        for op in &self.creates {
            sep(f)?;
            write!(f, "create {}x{} on gpu {}", op.quantity, op.profile, op.gpu_index)?;
        }
        if first {
            f.write_str("no-op")?;
        }
        Ok(())
    }
}
