use std::collections::BTreeMap;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Node;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::Api;
use kube::Client;
use serde_json::json;
use tracing::debug;

use crate::platform::k8s::KubernetesError;

/// The parts of the agent's Node object the controllers read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub resource_version: Option<String>,
}

impl From<Node> for NodeSnapshot {
    fn from(node: Node) -> Self {
        let metadata = node.metadata;
        Self {
            name: metadata.name.unwrap_or_default(),
            labels: metadata.labels.unwrap_or_default(),
            annotations: metadata.annotations.unwrap_or_default(),
            resource_version: metadata.resource_version,
        }
    }
}

/// Read/patch access to a single Node object.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get(&self) -> Result<NodeSnapshot, Report<KubernetesError>>;

    /// Applies annotation changes, `None` removing the key. With a
    /// `resource_version` the write fails with [`KubernetesError::Conflict`]
    /// if the node changed since it was read.
    async fn patch_annotations(
        &self,
        resource_version: Option<&str>,
        changes: BTreeMap<String, Option<String>>,
    ) -> Result<(), Report<KubernetesError>>;
}

pub struct KubeNodeStore {
    api: Api<Node>,
    node_name: String,
}

impl KubeNodeStore {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            api: Api::all(client),
            node_name: node_name.into(),
        }
    }
}

/// JSON merge patch body for `changes`.
fn annotations_patch(
    resource_version: Option<&str>,
    changes: &BTreeMap<String, Option<String>>,
) -> serde_json::Value {
    let mut metadata = json!({ "annotations": changes });
    if let Some(resource_version) = resource_version {
        metadata["resourceVersion"] = json!(resource_version);
    }
    json!({ "metadata": metadata })
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn get(&self) -> Result<NodeSnapshot, Report<KubernetesError>> {
        let node = self.api.get(&self.node_name).await.map_err(|e| {
            Report::new(KubernetesError::from_api(
                &e,
                format!("Failed to get node {}", self.node_name),
            ))
        })?;
        Ok(node.into())
    }

    async fn patch_annotations(
        &self,
        resource_version: Option<&str>,
        changes: BTreeMap<String, Option<String>>,
    ) -> Result<(), Report<KubernetesError>> {
        let patch = annotations_patch(resource_version, &changes);
        debug!(node = %self.node_name, "patching node annotations: {patch}");
        self.api
            .patch(
                &self.node_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| {
                Report::new(KubernetesError::from_api(
                    &e,
                    format!("Failed to patch node {}", self.node_name),
                ))
            })?;
        Ok(())
    }
}
