use std::collections::BTreeMap;

use crate::annotations::SpecEntry;
use crate::device::MigDevice;
use crate::profile::MigProfile;

/// Observed MIG devices keyed by parent GPU index.
///
/// Devices keep the order in which they were observed within each GPU.
/// GPUs without devices are not stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigState(BTreeMap<u32, Vec<MigDevice>>);

impl MigState {
    pub fn new(devices: impl IntoIterator<Item = MigDevice>) -> Self {
        let mut state: BTreeMap<u32, Vec<MigDevice>> = BTreeMap::new();
        for device in devices {
            state.entry(device.gpu_index()).or_default().push(device);
        }
        Self(state)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn gpu_indexes(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.keys().copied()
    }

    pub fn devices_on(&self, gpu_index: u32) -> &[MigDevice] {
        self.0.get(&gpu_index).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn flatten(&self) -> Vec<MigDevice> {
        self.0.values().flatten().cloned().collect()
    }

    /// Devices grouped by `(gpu_index, profile)`, each group in observed order.
    pub fn group_by_profile(&self) -> BTreeMap<(u32, MigProfile), Vec<MigDevice>> {
        let mut groups: BTreeMap<(u32, MigProfile), Vec<MigDevice>> = BTreeMap::new();
        for device in self.0.values().flatten() {
            groups
                .entry((device.gpu_index(), device.profile()))
                .or_default()
                .push(device.clone());
        }
        groups
    }

    /// The state without the devices of `gpu_index` whose profile is in `profiles`.
    pub fn without_profiles<'a>(
        &self,
        gpu_index: u32,
        profiles: impl IntoIterator<Item = &'a MigProfile>,
    ) -> MigState {
        let profiles: Vec<&MigProfile> = profiles.into_iter().collect();
        let mut result = self.clone();
        if let Some(devices) = result.0.get_mut(&gpu_index) {
            devices.retain(|device| !profiles.contains(&&device.profile()));
            if devices.is_empty() {
                result.0.remove(&gpu_index);
            }
        }
        result
    }

    /// Returns true if the number of devices per `(gpu, profile)` equals the
    /// quantity summed over `specs`, regardless of device status.
    pub fn matches(&self, specs: &[SpecEntry]) -> bool {
        let mut desired: BTreeMap<(u32, MigProfile), usize> = BTreeMap::new();
        for spec in specs.iter().filter(|s| s.quantity > 0) {
            let total = desired.entry((spec.gpu_index, spec.profile)).or_default();
            *total = total.saturating_add(spec.quantity as usize);
        }
        let observed: BTreeMap<(u32, MigProfile), usize> = self
            .group_by_profile()
            .into_iter()
            .map(|(key, devices)| (key, devices.len()))
            .collect();
        desired == observed
    }
}

impl FromIterator<MigDevice> for MigState {
    fn from_iter<T: IntoIterator<Item = MigDevice>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::device::DeviceStatus;

    fn device(id: &str, profile: &str, status: DeviceStatus, gpu: u32) -> MigDevice {
        MigDevice::new(format!("nvidia.com/mig-{profile}"), id, status, gpu).expect("valid device")
    }

    fn sample() -> MigState {
        MigState::new(vec![
            device("a", "1g.10gb", DeviceStatus::Free, 0),
            device("b", "2g.20gb", DeviceStatus::Used, 1),
            device("c", "1g.10gb", DeviceStatus::Used, 0),
            device("d", "3g.40gb", DeviceStatus::Free, 0),
        ])
    }

    #[test]
    fn rebuilding_from_flattened_devices_gives_the_same_state() {
        let state = sample();
        assert_eq!(MigState::new(state.flatten()), state);
        assert_eq!(MigState::new(MigState::default().flatten()), MigState::default());

        let pruned = state.without_profiles(1, &[MigProfile::new(2, 20)]);
        assert_eq!(MigState::new(pruned.flatten()), pruned);
    }

    #[test]
    fn devices_keep_observed_order_per_gpu() {
        let ids: Vec<String> = sample()
            .devices_on(0)
            .iter()
            .map(|d| d.device_id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn without_profiles_only_touches_the_given_gpu() {
        let state = sample().without_profiles(0, &[MigProfile::new(1, 10)]);
        assert_eq!(state.devices_on(0).len(), 1);
        assert_eq!(state.devices_on(1).len(), 1);
        assert_eq!(sample().devices_on(0).len(), 3);
    }

    #[test]
    fn groups_by_gpu_and_profile() {
        let groups = sample().group_by_profile();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[&(0, MigProfile::new(1, 10))].len(), 2);
    }

    #[test]
    fn matches_counts_every_device() {
        let spec = |gpu_index, gi, mem, quantity| SpecEntry {
            gpu_index,
            profile: MigProfile::new(gi, mem),
            quantity,
        };
        let state = sample();
        assert!(state.matches(&[spec(0, 1, 10, 2), spec(0, 3, 40, 1), spec(1, 2, 20, 1)]));
        assert!(!state.matches(&[spec(0, 1, 10, 2), spec(0, 3, 40, 1)]));
        assert!(MigState::default().matches(&[]));
    }
}
