//! Restarting the vendor device plugin so it re-advertises MIG devices.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::platform::k8s::KubernetesError;

pub const DEFAULT_DEVICE_PLUGIN_SELECTOR: &str = "app=nvidia-device-plugin-daemonset";
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[async_trait]
pub trait DevicePluginRefresher: Send + Sync {
    /// Makes the device plugin on this node refresh its inventory. Returns
    /// once the plugin is running again.
    async fn refresh(
        &self,
        cancellation_token: &CancellationToken,
    ) -> Result<(), Report<KubernetesError>>;
}

/// Deletes the plugin pod on the node and waits for its DaemonSet to bring a
/// new one to `Running`.
pub struct KubeDevicePluginRefresher {
    client: Client,
    node_name: String,
    namespace: Option<String>,
    label_selector: String,
    restart_timeout: Duration,
}

impl KubeDevicePluginRefresher {
    pub fn new(
        client: Client,
        node_name: impl Into<String>,
        namespace: Option<String>,
        label_selector: impl Into<String>,
        restart_timeout: Duration,
    ) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            namespace,
            label_selector: label_selector.into(),
            restart_timeout,
        }
    }

    fn list_params(&self) -> ListParams {
        ListParams::default()
            .labels(&self.label_selector)
            .fields(&format!("spec.nodeName={}", self.node_name))
    }

    async fn list_plugin_pods(&self) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let api: Api<Pod> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let pods = api.list(&self.list_params()).await.map_err(|e| {
            Report::new(KubernetesError::ConnectionFailed {
                message: format!(
                    "Failed to list device plugin pods ({}): {e}",
                    self.label_selector
                ),
            })
        })?;
        Ok(pods.items)
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<(), Report<KubernetesError>> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        api.delete(&name, &DeleteParams::default())
            .await
            .map_err(|e| {
                Report::new(KubernetesError::from_api(
                    &e,
                    format!("Failed to delete device plugin pod {namespace}/{name}"),
                ))
            })?;
        debug!(pod = %name, namespace = %namespace, "deleted device plugin pod");
        Ok(())
    }

    async fn wait_for_replacement(
        &self,
        replaced: &HashSet<String>,
        cancellation_token: &CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        let deadline = Instant::now() + self.restart_timeout;
        loop {
            let pods = self.list_plugin_pods().await?;
            if pods.iter().any(|pod| is_replacement_running(pod, replaced)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Report::new(KubernetesError::Timeout {
                    message: format!(
                        "device plugin on node {} not running after {:?}",
                        self.node_name, self.restart_timeout
                    ),
                }));
            }
            debug!("waiting for device plugin pod to be recreated");
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Stopped waiting for device plugin, shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

/// A pod that is not one of `replaced`, not terminating and `Running`.
fn is_replacement_running(pod: &Pod, replaced: &HashSet<String>) -> bool {
    let uid = pod.metadata.uid.as_deref().unwrap_or_default();
    let running = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running");
    !replaced.contains(uid) && pod.metadata.deletion_timestamp.is_none() && running
}

#[async_trait]
impl DevicePluginRefresher for KubeDevicePluginRefresher {
    #[tracing::instrument(skip(self, cancellation_token), fields(node = %self.node_name))]
    async fn refresh(
        &self,
        cancellation_token: &CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Restarting device plugin");
        let pods = self.list_plugin_pods().await?;
        if pods.is_empty() {
            return Err(Report::new(KubernetesError::NotFound {
                message: format!(
                    "no device plugin pod matching {} on node {}",
                    self.label_selector, self.node_name
                ),
            }));
        }
        if pods.len() > 1 {
            warn!(count = pods.len(), "more than one device plugin pod on node");
        }

        let mut replaced = HashSet::new();
        for pod in &pods {
            self.delete_pod(pod).await?;
            if let Some(uid) = &pod.metadata.uid {
                replaced.insert(uid.clone());
            }
        }

        self.wait_for_replacement(&replaced, cancellation_token)
            .await?;
        info!("Device plugin restarted");
        Ok(())
    }
}
