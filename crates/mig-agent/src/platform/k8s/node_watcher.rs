use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::controllers::predicates;
use crate::controllers::SharedState;
use crate::platform::k8s::KubernetesError;

/// Watches the agent's Node and wakes the Reporter on resource changes and
/// the Actuator on annotation changes.
pub struct NodeWatcher {
    client: Client,
    node_name: String,
    shared: Arc<SharedState>,
    previous: Mutex<Option<Node>>,
}

impl NodeWatcher {
    pub fn new(client: Client, node_name: impl Into<String>, shared: Arc<SharedState>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            shared,
            previous: Mutex::new(None),
        }
    }

    #[tracing::instrument(skip(self, cancellation_token), fields(node = %self.node_name))]
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("Starting node watcher");

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Node watcher shutdown requested");
                    break;
                }
                result = self.watch_node() => {
                    match result {
                        Ok(()) => {
                            warn!("Node watch stream ended unexpectedly, restarting...");
                        }
                        Err(e) => {
                            error!("Node watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    }

    async fn watch_node(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let config = Config::default().fields(&format!("metadata.name={}", self.node_name));
        let mut stream = watcher(api, config).boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Applied(node)) => self.handle_node(node).await,
                Ok(Event::Restarted(nodes)) => {
                    for node in nodes {
                        self.handle_node(node).await;
                    }
                }
                Ok(Event::Deleted(_)) => debug!("ignoring node deletion"),
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        message: format!("Watch stream error: {e}"),
                    }));
                }
            }
        }

        Ok(())
    }

    async fn handle_node(&self, node: Node) {
        if !predicates::name_matches(&node, &self.node_name) {
            return;
        }
        let mut previous = self.previous.lock().await;
        if predicates::resources_changed(previous.as_ref(), &node) {
            debug!("node resources changed");
            self.shared.request_report();
        }
        if predicates::annotations_changed(previous.as_ref(), &node) {
            debug!("node annotations changed");
            self.shared.request_apply();
        }
        *previous = Some(node);
    }
}
