use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use mig_core::AnnotationSchema;
use mig_core::DEFAULT_RESOURCE_VENDOR;

use crate::app::Agent;
use crate::app::ApplicationServices;
use crate::config::load_catalog;
use crate::config::DaemonArgs;
use crate::controllers::Actuator;
use crate::controllers::Reporter;
use crate::controllers::SharedState;
use crate::gpu_init::initialize_gpu_system;
use crate::platform::k8s::init_kube_client;
use crate::platform::k8s::KubeDevicePluginRefresher;
use crate::platform::k8s::KubeNodeStore;
use crate::platform::k8s::NodeWatcher;
use crate::platform::KubeletPodResources;
use crate::platform::MigClient;
use crate::platform::MigClientImpl;

/// Builds the [`Agent`] of one node from the daemon arguments.
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Loads the catalog, opens the driver and the cluster clients, and wires the controllers.
    pub async fn build(self) -> Result<Agent> {
        tracing::info!("Building agent components...");
        let args = &self.daemon_args;

        let catalog = Arc::new(load_catalog(args.known_geometries_file.as_deref())?);
        let schema = AnnotationSchema::new(args.annotation_prefix.clone(), &args.profile_pattern)
            .context("invalid annotation settings")?;

        let gpu_system = initialize_gpu_system(&args.nvml_library)?;

        let kube_client = init_kube_client(args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;

        let lister = KubeletPodResources::new(
            args.pod_resources_socket.clone(),
            args.pod_resources_timeout(),
        );
        tracing::info!(
            socket = %lister.socket_path().display(),
            "Using kubelet pod-resources API"
        );
        let mig_client: Arc<dyn MigClient> = Arc::new(MigClientImpl::new(
            lister,
            gpu_system.driver,
            DEFAULT_RESOURCE_VENDOR,
        ));

        if args.cleanup_on_startup {
            cleanup_unused_mig_devices(mig_client.as_ref()).await?;
        }

        let store = Arc::new(KubeNodeStore::new(kube_client.clone(), &args.node_name));
        let refresher = Arc::new(KubeDevicePluginRefresher::new(
            kube_client.clone(),
            &args.node_name,
            args.device_plugin_namespace.clone(),
            &args.device_plugin_label_selector,
            args.device_plugin_restart_timeout(),
        ));
        let shared = Arc::new(SharedState::new());

        let node_watcher = Arc::new(NodeWatcher::new(
            kube_client,
            &args.node_name,
            shared.clone(),
        ));
        let reporter = Arc::new(Reporter::new(
            mig_client.clone(),
            store.clone(),
            schema.clone(),
            shared.clone(),
            args.refresh_interval(),
        ));
        let actuator = Arc::new(
            Actuator::new(mig_client, store, refresher, schema, catalog, shared.clone())
                .with_reconcile_timeout(args.reconcile_timeout()),
        );

        let services = ApplicationServices {
            shared,
            node_watcher,
            reporter,
            actuator,
        };
        Ok(Agent::new(services, self.daemon_args.health_addr))
    }
}

/// Deletes every MIG device no pod is using. Returns how many were deleted.
async fn cleanup_unused_mig_devices(client: &dyn MigClient) -> Result<u32> {
    tracing::info!("Cleaning up unused MIG devices...");
    let used = client
        .list_in_use()
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("failed to list used MIG devices")?;
    let deleted = client
        .delete_all_except(&used)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("failed to delete unused MIG devices")?;
    tracing::info!(kept = used.len(), deleted, "Startup cleanup completed");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use mig_core::DeviceStatus;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::controllers::testing::device;
    use crate::controllers::testing::FakeMigClient;
    use crate::platform::DriverError;

    #[test(tokio::test)]
    async fn cleanup_keeps_only_used_devices() {
        let client = FakeMigClient::new(vec![
            device("MIG-a", "1g.10gb", DeviceStatus::Used, 0),
            device("MIG-b", "1g.10gb", DeviceStatus::Free, 0),
            device("MIG-c", "3g.40gb", DeviceStatus::Free, 1),
        ]);

        assert_eq!(cleanup_unused_mig_devices(&client).await.unwrap(), 2);
        assert_eq!(
            client.devices(),
            vec![device("MIG-a", "1g.10gb", DeviceStatus::Used, 0)]
        );
    }

    #[test(tokio::test)]
    async fn cleanup_deletes_nothing_when_listing_fails() {
        let client = FakeMigClient::new(vec![device("MIG-b", "1g.10gb", DeviceStatus::Free, 0)]);
        client.fail_list(DriverError::Timeout {
            message: "pod-resources".to_string(),
        });

        assert!(cleanup_unused_mig_devices(&client).await.is_err());
        assert_eq!(client.devices().len(), 1);
    }
}
