//! MIG partitioning through the raw NVML bindings
//!
//! The safe `nvml-wrapper` API does not cover GPU/compute instance management,
//! so this module drives `libnvidia-ml` through `nvml-wrapper-sys`. Every
//! public operation runs inside its own `nvmlInit`/`nvmlShutdown` session while
//! holding a process-wide lock.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::os::raw::c_uint;
use std::ptr;
use std::sync::Mutex;
use std::sync::PoisonError;

use error_stack::Report;
use mig_core::MigProfile;
use nvml_wrapper_sys::bindings::nvmlComputeInstanceProfileInfo_t;
use nvml_wrapper_sys::bindings::nvmlComputeInstance_t;
use nvml_wrapper_sys::bindings::nvmlDevice_t;
use nvml_wrapper_sys::bindings::nvmlGpuInstanceInfo_t;
use nvml_wrapper_sys::bindings::nvmlGpuInstanceProfileInfo_t;
use nvml_wrapper_sys::bindings::nvmlGpuInstance_t;
use nvml_wrapper_sys::bindings::nvmlReturn_enum_NVML_ERROR_INSUFFICIENT_RESOURCES;
use nvml_wrapper_sys::bindings::nvmlReturn_enum_NVML_ERROR_INVALID_ARGUMENT;
use nvml_wrapper_sys::bindings::nvmlReturn_enum_NVML_ERROR_IN_USE;
use nvml_wrapper_sys::bindings::nvmlReturn_enum_NVML_ERROR_NOT_FOUND;
use nvml_wrapper_sys::bindings::nvmlReturn_enum_NVML_ERROR_NOT_SUPPORTED;
use nvml_wrapper_sys::bindings::nvmlReturn_enum_NVML_SUCCESS;
use nvml_wrapper_sys::bindings::nvmlReturn_t;
use nvml_wrapper_sys::bindings::NvmlLib;
use nvml_wrapper_sys::bindings::NVML_COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED;
use nvml_wrapper_sys::bindings::NVML_COMPUTE_INSTANCE_PROFILE_COUNT;
use nvml_wrapper_sys::bindings::NVML_DEVICE_MIG_ENABLE;
use nvml_wrapper_sys::bindings::NVML_DEVICE_UUID_V2_BUFFER_SIZE;
use nvml_wrapper_sys::bindings::NVML_GPU_INSTANCE_PROFILE_COUNT;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::platform::errors::DriverError;

pub const DEFAULT_NVML_LIBRARY: &str = "libnvidia-ml.so.1";

/// Creation orders tried by [`GpuDriver::create_migs`] before giving up.
pub const MAX_CREATE_ATTEMPTS: usize = 20;

static NVML_LOCK: Mutex<()> = Mutex::new(());

/// Result of a successful MIG device creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigCreated {
    pub gpu_index: u32,
    pub gpu_instance_id: u32,
}

/// Synchronous access to the GPU driver. Implementations may block.
pub trait GpuDriver: Send + Sync {
    /// Index of the GPU hosting the MIG device `mig_uuid`.
    fn gpu_index_of(&self, mig_uuid: &str) -> Result<u32, Report<DriverError>>;

    /// Creates one GPU instance of `profile` on `gpu_index` with a single
    /// compute instance spanning all its slices.
    fn create_mig(
        &self,
        gpu_index: u32,
        profile: MigProfile,
    ) -> Result<MigCreated, Report<DriverError>>;

    /// Destroys a device returned by [`GpuDriver::create_mig`] before anything reports it.
    fn destroy_created(&self, created: MigCreated) -> Result<(), Report<DriverError>>;

    /// Creates every profile in `profiles` on `gpu_index`.
    ///
    /// Whether a set of GPU instances fits depends on the order they are
    /// placed in, so on a capacity error the devices created so far are
    /// destroyed and the next distinct creation order is tried, for at most
    /// [`MAX_CREATE_ATTEMPTS`] orders.
    fn create_migs(
        &self,
        gpu_index: u32,
        profiles: &[MigProfile],
    ) -> Result<Vec<MigCreated>, Report<DriverError>> {
        let mut order = profiles.to_vec();
        order.sort();
        let mut last_error = None;
        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            debug!(gpu_index, attempt, order = %join(&order), "trying MIG creation order");
            match create_in_order(self, gpu_index, &order) {
                Ok(created) => return Ok(created),
                Err(e) if matches!(e.current_context(), DriverError::Capacity { .. }) => {
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
            if !next_permutation(&mut order) {
                break;
            }
        }
        let message = format!(
            "no creation order of [{}] fits on GPU {gpu_index}",
            join(profiles)
        );
        Err(match last_error {
            Some(e) => e.change_context(DriverError::Capacity { message }),
            None => Report::new(DriverError::Capacity { message }),
        })
    }

    /// Destroys the compute instances and the GPU instance behind `mig_uuid`.
    fn delete_mig(&self, mig_uuid: &str) -> Result<(), Report<DriverError>>;

    /// Destroys every MIG device whose UUID is not in `keep`. Returns how many were deleted.
    fn delete_all_except(&self, keep: &[String]) -> Result<u32, Report<DriverError>>;

    /// Indexes of the GPUs with MIG mode currently enabled.
    fn mig_enabled_gpus(&self) -> Result<Vec<u32>, Report<DriverError>>;
}

fn join(profiles: &[MigProfile]) -> String {
    profiles
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Creates `order` one device at a time, destroying the ones already created
/// if any creation fails. A failed cleanup turns the error into a driver error
/// so no further order is tried on a GPU in an unknown state.
fn create_in_order<D: GpuDriver + ?Sized>(
    driver: &D,
    gpu_index: u32,
    order: &[MigProfile],
) -> Result<Vec<MigCreated>, Report<DriverError>> {
    let mut created = Vec::with_capacity(order.len());
    for profile in order {
        match driver.create_mig(gpu_index, *profile) {
            Ok(device) => created.push(device),
            Err(mut e) => {
                let mut leftovers = 0;
                for device in created.into_iter().rev() {
                    if let Err(cleanup) = driver.destroy_created(device) {
                        warn!(?device, "unable to clean up MIG device: {cleanup:?}");
                        e.extend_one(cleanup);
                        leftovers += 1;
                    }
                }
                if leftovers > 0 {
                    return Err(e.change_context(DriverError::driver(format!(
                        "{leftovers} MIG devices on GPU {gpu_index} could not be cleaned up"
                    ))));
                }
                return Err(e);
            }
        }
    }
    Ok(created)
}

/// Rearranges `items` into the next lexicographically greater permutation.
/// Returns false, leaving `items` sorted, once the last one has been reached.
/// Equal items are never swapped, so repeated profiles yield each distinct
/// order once.
fn next_permutation<T: Ord>(items: &mut [T]) -> bool {
    let Some(pivot) = items.windows(2).rposition(|pair| pair[0] < pair[1]) else {
        items.reverse();
        return false;
    };
    let successor = items
        .iter()
        .rposition(|item| *item > items[pivot])
        .unwrap_or(pivot + 1);
    items.swap(pivot, successor);
    items[pivot + 1..].reverse();
    true
}

/// Maps an NVML return code onto the driver error kinds.
fn classify(ret: nvmlReturn_t, message: String) -> DriverError {
    match ret {
        nvmlReturn_enum_NVML_ERROR_NOT_FOUND => DriverError::NotFound { message },
        nvmlReturn_enum_NVML_ERROR_IN_USE => DriverError::Busy { message },
        nvmlReturn_enum_NVML_ERROR_INSUFFICIENT_RESOURCES => DriverError::Capacity { message },
        _ => DriverError::Driver { message },
    }
}

fn is_unsupported(ret: nvmlReturn_t) -> bool {
    ret == nvmlReturn_enum_NVML_ERROR_NOT_SUPPORTED
        || ret == nvmlReturn_enum_NVML_ERROR_INVALID_ARGUMENT
}

struct MigHandle {
    gpu_index: u32,
    parent: nvmlDevice_t,
    handle: nvmlDevice_t,
}

pub struct NvmlDriver {
    lib: NvmlLib,
}

impl NvmlDriver {
    /// Loads the NVML shared library from `path`.
    pub fn load(path: &str) -> Result<Self, Report<DriverError>> {
        // SAFETY: loading libnvidia-ml runs no initialisation code beyond the dynamic linker's.
        let lib = unsafe { NvmlLib::new(path) }.map_err(|e| {
            Report::new(DriverError::driver(format!(
                "unable to load NVML library {path}: {e}"
            )))
        })?;
        Ok(Self { lib })
    }

    fn error_string(&self, ret: nvmlReturn_t) -> String {
        // SAFETY: nvmlErrorString returns a pointer to a static string.
        unsafe {
            let raw = self.lib.nvmlErrorString(ret);
            if raw.is_null() {
                format!("NVML error {ret}")
            } else {
                CStr::from_ptr(raw).to_string_lossy().into_owned()
            }
        }
    }

    fn check(
        &self,
        ret: nvmlReturn_t,
        context: impl FnOnce() -> String,
    ) -> Result<(), Report<DriverError>> {
        if ret == nvmlReturn_enum_NVML_SUCCESS {
            return Ok(());
        }
        let message = format!("{}: {}", context(), self.error_string(ret));
        Err(Report::new(classify(ret, message)))
    }

    /// Runs `body` inside an NVML session while holding the process-wide lock.
    fn with_session<T>(
        &self,
        body: impl FnOnce() -> Result<T, Report<DriverError>>,
    ) -> Result<T, Report<DriverError>> {
        let _guard = NVML_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        // SAFETY: init and shutdown are reference counted by NVML and serialised by the lock.
        let ret = unsafe { self.lib.nvmlInit_v2() };
        self.check(ret, || "unable to initialize NVML".to_string())?;

        let result = body();

        let ret = unsafe { self.lib.nvmlShutdown() };
        if ret != nvmlReturn_enum_NVML_SUCCESS {
            warn!("unable to shut down NVML: {}", self.error_string(ret));
        }
        result
    }

    fn device_count(&self) -> Result<u32, Report<DriverError>> {
        let mut count: c_uint = 0;
        let ret = unsafe { self.lib.nvmlDeviceGetCount_v2(&mut count) };
        self.check(ret, || "unable to get GPU count".to_string())?;
        Ok(count)
    }

    fn device_by_index(&self, index: u32) -> Result<nvmlDevice_t, Report<DriverError>> {
        let mut device: nvmlDevice_t = ptr::null_mut();
        let ret = unsafe { self.lib.nvmlDeviceGetHandleByIndex_v2(index, &mut device) };
        self.check(ret, || format!("unable to get GPU {index}"))?;
        Ok(device)
    }

    fn device_uuid(&self, device: nvmlDevice_t) -> Result<String, Report<DriverError>> {
        let mut buffer: [c_char; NVML_DEVICE_UUID_V2_BUFFER_SIZE as usize] =
            [0; NVML_DEVICE_UUID_V2_BUFFER_SIZE as usize];
        let ret = unsafe {
            self.lib.nvmlDeviceGetUUID(
                device,
                buffer.as_mut_ptr(),
                NVML_DEVICE_UUID_V2_BUFFER_SIZE,
            )
        };
        self.check(ret, || "unable to get device UUID".to_string())?;
        // SAFETY: NVML writes a NUL-terminated string into the buffer on success.
        let uuid = unsafe { CStr::from_ptr(buffer.as_ptr()) };
        Ok(uuid.to_string_lossy().into_owned())
    }

    fn is_mig_enabled(&self, device: nvmlDevice_t) -> Result<bool, Report<DriverError>> {
        let mut current: c_uint = 0;
        let mut pending: c_uint = 0;
        let ret = unsafe {
            self.lib
                .nvmlDeviceGetMigMode(device, &mut current, &mut pending)
        };
        if is_unsupported(ret) {
            return Ok(false);
        }
        self.check(ret, || "unable to get MIG mode".to_string())?;
        Ok(current == NVML_DEVICE_MIG_ENABLE)
    }

    fn mig_handles(&self, device: nvmlDevice_t) -> Result<Vec<nvmlDevice_t>, Report<DriverError>> {
        let mut max_count: c_uint = 0;
        let ret = unsafe {
            self.lib
                .nvmlDeviceGetMaxMigDeviceCount(device, &mut max_count)
        };
        self.check(ret, || "unable to get max MIG device count".to_string())?;

        let mut handles = Vec::new();
        for index in 0..max_count {
            let mut handle: nvmlDevice_t = ptr::null_mut();
            let ret = unsafe {
                self.lib
                    .nvmlDeviceGetMigDeviceHandleByIndex(device, index, &mut handle)
            };
            if ret == nvmlReturn_enum_NVML_ERROR_NOT_FOUND {
                continue;
            }
            self.check(ret, || format!("unable to get MIG device {index}"))?;
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Walks the MIG devices of every MIG-enabled GPU looking for `uuid`.
    fn find_mig(&self, uuid: &str) -> Result<MigHandle, Report<DriverError>> {
        for gpu_index in 0..self.device_count()? {
            let parent = self.device_by_index(gpu_index)?;
            if !self.is_mig_enabled(parent)? {
                continue;
            }
            for handle in self.mig_handles(parent)? {
                if self.device_uuid(handle)? == uuid {
                    return Ok(MigHandle {
                        gpu_index,
                        parent,
                        handle,
                    });
                }
            }
        }
        Err(Report::new(DriverError::NotFound {
            message: format!("MIG device {uuid}"),
        }))
    }

    fn gpu_instance_of(&self, mig: &MigHandle) -> Result<nvmlGpuInstance_t, Report<DriverError>> {
        let mut gpu_instance_id: c_uint = 0;
        let ret = unsafe {
            self.lib
                .nvmlDeviceGetGpuInstanceId(mig.handle, &mut gpu_instance_id)
        };
        self.check(ret, || "unable to get GPU instance id".to_string())?;

        let mut gpu_instance: nvmlGpuInstance_t = ptr::null_mut();
        let ret = unsafe {
            self.lib
                .nvmlDeviceGetGpuInstanceById(mig.parent, gpu_instance_id, &mut gpu_instance)
        };
        self.check(ret, || {
            format!(
                "unable to get GPU instance {gpu_instance_id} of GPU {}",
                mig.gpu_index
            )
        })?;
        Ok(gpu_instance)
    }

    fn gpu_instance_profile(
        &self,
        device: nvmlDevice_t,
        profile: MigProfile,
    ) -> Result<nvmlGpuInstanceProfileInfo_t, Report<DriverError>> {
        for profile_index in 0..NVML_GPU_INSTANCE_PROFILE_COUNT {
            // SAFETY: plain C struct, all-zero is a valid bit pattern.
            let mut info: nvmlGpuInstanceProfileInfo_t = unsafe { std::mem::zeroed() };
            let ret = unsafe {
                self.lib
                    .nvmlDeviceGetGpuInstanceProfileInfo(device, profile_index, &mut info)
            };
            if is_unsupported(ret) {
                continue;
            }
            self.check(ret, || {
                format!("unable to get GPU instance profile {profile_index}")
            })?;
            let memory_gb = info.memorySizeMB.div_ceil(1024);
            if info.sliceCount == profile.gi() && memory_gb == u64::from(profile.memory_gb()) {
                return Ok(info);
            }
        }
        Err(Report::new(DriverError::NotFound {
            message: format!("GPU instance profile {profile}"),
        }))
    }

    fn compute_instance_profiles(
        &self,
        gpu_instance: nvmlGpuInstance_t,
    ) -> Result<Vec<nvmlComputeInstanceProfileInfo_t>, Report<DriverError>> {
        let mut profiles = Vec::new();
        for profile_index in 0..NVML_COMPUTE_INSTANCE_PROFILE_COUNT {
            let mut info: nvmlComputeInstanceProfileInfo_t = unsafe { std::mem::zeroed() };
            let ret = unsafe {
                self.lib.nvmlGpuInstanceGetComputeInstanceProfileInfo(
                    gpu_instance,
                    profile_index,
                    NVML_COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED,
                    &mut info,
                )
            };
            if is_unsupported(ret) {
                continue;
            }
            self.check(ret, || {
                format!("unable to get compute instance profile {profile_index}")
            })?;
            profiles.push(info);
        }
        Ok(profiles)
    }

    fn create_compute_instance(
        &self,
        gpu_instance: nvmlGpuInstance_t,
        slice_count: u32,
    ) -> Result<(), Report<DriverError>> {
        let profile = self
            .compute_instance_profiles(gpu_instance)?
            .into_iter()
            .find(|info| info.sliceCount == slice_count)
            .ok_or_else(|| {
                Report::new(DriverError::NotFound {
                    message: format!("compute instance profile with {slice_count} slices"),
                })
            })?;
        let mut compute_instance: nvmlComputeInstance_t = ptr::null_mut();
        let ret = unsafe {
            self.lib.nvmlGpuInstanceCreateComputeInstance(
                gpu_instance,
                profile.id,
                &mut compute_instance,
            )
        };
        self.check(ret, || "unable to create compute instance".to_string())
    }

    /// Destroys every compute instance of `gpu_instance`, then the instance itself.
    fn destroy_gpu_instance(
        &self,
        gpu_instance: nvmlGpuInstance_t,
        uuid: &str,
    ) -> Result<(), Report<DriverError>> {
        let mut destroyed = 0;
        for profile in self.compute_instance_profiles(gpu_instance)? {
            let mut instances: Vec<nvmlComputeInstance_t> =
                vec![ptr::null_mut(); profile.instanceCount.max(1) as usize];
            let mut count: c_uint = 0;
            let ret = unsafe {
                self.lib.nvmlGpuInstanceGetComputeInstances(
                    gpu_instance,
                    profile.id,
                    instances.as_mut_ptr(),
                    &mut count,
                )
            };
            self.check(ret, || format!("unable to list compute instances of {uuid}"))?;
            for compute_instance in instances.into_iter().take(count as usize) {
                let ret = unsafe { self.lib.nvmlComputeInstanceDestroy(compute_instance) };
                self.check(ret, || format!("unable to destroy compute instance of {uuid}"))?;
                destroyed += 1;
            }
        }
        if destroyed == 0 {
            return Err(Report::new(DriverError::driver(format!(
                "GPU instance of {uuid} has no compute instances"
            ))));
        }
        let ret = unsafe { self.lib.nvmlGpuInstanceDestroy(gpu_instance) };
        self.check(ret, || format!("unable to destroy GPU instance of {uuid}"))
    }

    fn gpu_instance_id(&self, gpu_instance: nvmlGpuInstance_t) -> Result<u32, Report<DriverError>> {
        let mut info: nvmlGpuInstanceInfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe { self.lib.nvmlGpuInstanceGetInfo(gpu_instance, &mut info) };
        self.check(ret, || "unable to get GPU instance info".to_string())?;
        Ok(info.id)
    }
}

impl GpuDriver for NvmlDriver {
    fn gpu_index_of(&self, mig_uuid: &str) -> Result<u32, Report<DriverError>> {
        self.with_session(|| self.find_mig(mig_uuid).map(|mig| mig.gpu_index))
    }

    #[tracing::instrument(skip(self), fields(profile = %profile))]
    fn create_mig(
        &self,
        gpu_index: u32,
        profile: MigProfile,
    ) -> Result<MigCreated, Report<DriverError>> {
        self.with_session(|| {
            let device = self.device_by_index(gpu_index)?;
            let gi_profile = self.gpu_instance_profile(device, profile)?;

            let mut gpu_instance: nvmlGpuInstance_t = ptr::null_mut();
            let ret = unsafe {
                self.lib
                    .nvmlDeviceCreateGpuInstance(device, gi_profile.id, &mut gpu_instance)
            };
            self.check(ret, || {
                format!("unable to create GPU instance {profile} on GPU {gpu_index}")
            })?;

            if let Err(e) = self.create_compute_instance(gpu_instance, gi_profile.sliceCount) {
                let ret = unsafe { self.lib.nvmlGpuInstanceDestroy(gpu_instance) };
                if ret != nvmlReturn_enum_NVML_SUCCESS {
                    warn!(
                        "unable to roll back GPU instance {profile} on GPU {gpu_index}: {}",
                        self.error_string(ret)
                    );
                }
                return Err(e);
            }

            let gpu_instance_id = self.gpu_instance_id(gpu_instance)?;
            info!(gpu_instance_id, "created MIG device");
            Ok(MigCreated {
                gpu_index,
                gpu_instance_id,
            })
        })
    }

    fn destroy_created(&self, created: MigCreated) -> Result<(), Report<DriverError>> {
        let MigCreated {
            gpu_index,
            gpu_instance_id,
        } = created;
        self.with_session(|| {
            let device = self.device_by_index(gpu_index)?;
            let mut gpu_instance: nvmlGpuInstance_t = ptr::null_mut();
            let ret = unsafe {
                self.lib
                    .nvmlDeviceGetGpuInstanceById(device, gpu_instance_id, &mut gpu_instance)
            };
            self.check(ret, || {
                format!("unable to get GPU instance {gpu_instance_id} of GPU {gpu_index}")
            })?;
            let label = format!("MIG device {gpu_instance_id} on GPU {gpu_index}");
            self.destroy_gpu_instance(gpu_instance, &label)?;
            debug!(gpu_index, gpu_instance_id, "destroyed MIG device");
            Ok(())
        })
    }

    #[tracing::instrument(skip(self))]
    fn delete_mig(&self, mig_uuid: &str) -> Result<(), Report<DriverError>> {
        self.with_session(|| {
            let mig = self.find_mig(mig_uuid)?;
            let gpu_instance = self.gpu_instance_of(&mig)?;
            self.destroy_gpu_instance(gpu_instance, mig_uuid)?;
            info!(gpu_index = mig.gpu_index, "deleted MIG device");
            Ok(())
        })
    }

    fn delete_all_except(&self, keep: &[String]) -> Result<u32, Report<DriverError>> {
        self.with_session(|| {
            let mut doomed = Vec::new();
            for gpu_index in 0..self.device_count()? {
                let parent = self.device_by_index(gpu_index)?;
                if !self.is_mig_enabled(parent)? {
                    continue;
                }
                for handle in self.mig_handles(parent)? {
                    let uuid = self.device_uuid(handle)?;
                    if keep.contains(&uuid) {
                        debug!(%uuid, "keeping MIG device");
                        continue;
                    }
                    let mig = MigHandle {
                        gpu_index,
                        parent,
                        handle,
                    };
                    doomed.push((uuid, self.gpu_instance_of(&mig)?));
                }
            }
            let mut deleted = 0;
            for (uuid, gpu_instance) in doomed {
                self.destroy_gpu_instance(gpu_instance, &uuid)?;
                info!(%uuid, "deleted MIG device");
                deleted += 1;
            }
            Ok(deleted)
        })
    }

    fn mig_enabled_gpus(&self) -> Result<Vec<u32>, Report<DriverError>> {
        self.with_session(|| {
            let mut enabled = Vec::new();
            for gpu_index in 0..self.device_count()? {
                let device = self.device_by_index(gpu_index)?;
                if self.is_mig_enabled(device)? {
                    enabled.push(gpu_index);
                }
            }
            Ok(enabled)
        })
    }
}
