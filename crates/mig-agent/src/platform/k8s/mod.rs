//! Kubernetes integration.
//!
//! - [`KubeNodeStore`]: reads and patches the agent's own Node object
//! - [`NodeWatcher`]: turns Node watch events into controller triggers
//! - [`KubeDevicePluginRefresher`]: restarts the vendor device plugin on the node

use core::error::Error;

pub mod device_plugin;
pub mod kube_client;
pub mod node_store;
pub mod node_watcher;

pub use device_plugin::DevicePluginRefresher;
pub use device_plugin::KubeDevicePluginRefresher;
pub use kube_client::init_kube_client;
pub use node_store::KubeNodeStore;
pub use node_store::NodeSnapshot;
pub use node_store::NodeStore;
pub use node_watcher::NodeWatcher;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to watch nodes: {message}")]
    WatchFailed { message: String },
    #[display("Kubernetes object not found: {message}")]
    NotFound { message: String },
    #[display("Conflicting update: {message}")]
    Conflict { message: String },
    #[display("Failed to patch: {message}")]
    PatchFailed { message: String },
    #[display("Timed out: {message}")]
    Timeout { message: String },
}

impl Error for KubernetesError {}

impl KubernetesError {
    /// Classifies a kube API error by its HTTP status.
    pub(crate) fn from_api(err: &kube::Error, message: String) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound { message },
            kube::Error::Api(response) if response.code == 409 => Self::Conflict { message },
            _ => Self::PatchFailed {
                message: format!("{message}: {err}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;
    use similar_asserts::assert_eq;

    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn api_errors_are_classified_by_status_code() {
        assert_eq!(
            KubernetesError::from_api(&api_error(409), "node gpu-1".to_string()),
            KubernetesError::Conflict {
                message: "node gpu-1".to_string()
            }
        );
        assert_eq!(
            KubernetesError::from_api(&api_error(404), "node gpu-1".to_string()),
            KubernetesError::NotFound {
                message: "node gpu-1".to_string()
            }
        );
        assert!(matches!(
            KubernetesError::from_api(&api_error(500), "node gpu-1".to_string()),
            KubernetesError::PatchFailed { .. }
        ));
    }

    #[test]
    fn kubernetes_error_display_formatting() {
        assert_eq!(
            KubernetesError::Conflict {
                message: "node gpu-1".to_string()
            }
            .to_string(),
            "Conflicting update: node gpu-1"
        );
    }
}
