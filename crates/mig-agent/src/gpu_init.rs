use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use nvml_wrapper::Nvml;

use crate::platform::GpuDriver;
use crate::platform::NvmlDriver;

/// GPU system information structure
pub struct GpuSystem {
    pub driver: Arc<NvmlDriver>,
    pub mig_enabled_gpus: Vec<u32>,
}

/// Loads the driver and refuses to start without a MIG-enabled GPU.
pub fn initialize_gpu_system(nvml_library: &str) -> Result<GpuSystem> {
    tracing::info!("Initializing GPU system...");

    log_inventory(nvml_library)?;

    let driver = NvmlDriver::load(nvml_library)
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .context("failed to load the MIG driver")?;
    let gpu_system = GpuSystem {
        mig_enabled_gpus: driver
            .mig_enabled_gpus()
            .map_err(|report| anyhow::anyhow!("{report:?}"))
            .context("failed to read the MIG mode of the GPUs")?,
        driver: Arc::new(driver),
    };
    check_mig_enabled(&gpu_system.mig_enabled_gpus)?;

    tracing::info!(
        "MIG mode is enabled on GPU(s) {:?}",
        gpu_system.mig_enabled_gpus
    );
    Ok(gpu_system)
}

fn check_mig_enabled(mig_enabled_gpus: &[u32]) -> Result<()> {
    if mig_enabled_gpus.is_empty() {
        bail!("no GPU has MIG mode enabled, nothing to manage on this node");
    }
    Ok(())
}

fn init_nvml(nvml_library: &str) -> Result<Nvml> {
    match Nvml::init() {
        Ok(nvml) => {
            tracing::info!("NVML initialized successfully");
            Ok(nvml)
        }
        Err(_) => {
            tracing::warn!("Standard NVML init failed, trying with explicit library path");
            let nvml = Nvml::builder()
                .lib_path(std::ffi::OsStr::new(nvml_library))
                .init()
                .context("failed to initialize NVML")?;
            tracing::info!("NVML initialized with explicit library path");
            Ok(nvml)
        }
    }
}

fn log_inventory(nvml_library: &str) -> Result<()> {
    let nvml = init_nvml(nvml_library)?;
    let device_count = nvml.device_count()?;

    tracing::info!("Discovered {} GPU device(s)", device_count);

    for i in 0..device_count {
        let device = nvml.device_by_index(i)?;
        let uuid = device.uuid()?;
        let name = device.name()?;
        let memory_gib = device.memory_info()?.total / (1 << 30);

        tracing::info!("Found GPU {}: {} ({}, {} GiB)", i, uuid, name, memory_gib);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_without_mig_gpus_is_rejected() {
        let err = check_mig_enabled(&[]).unwrap_err();
        assert!(err.to_string().contains("MIG mode"));
        assert!(check_mig_enabled(&[1]).is_ok());
    }
}
