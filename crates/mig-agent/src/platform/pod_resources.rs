use std::future::Future;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use hyper_util::rt::TokioIo;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;
use tracing::debug;

use crate::platform::errors::DriverError;

pub mod api {
    tonic::include_proto!("v1");
}

use api::pod_resources_lister_client::PodResourcesListerClient;
use api::AllocatableResourcesRequest;
use api::ContainerDevices;
use api::ListPodResourcesRequest;

pub const DEFAULT_POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";
pub const DEFAULT_POD_RESOURCES_TIMEOUT: Duration = Duration::from_secs(10);
const SOCKET_FILE_NAME: &str = "kubelet.sock";

/// Devices of one resource as seen by the kubelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDevices {
    pub resource_name: String,
    pub device_ids: Vec<String>,
}

impl From<ContainerDevices> for ResourceDevices {
    fn from(devices: ContainerDevices) -> Self {
        Self {
            resource_name: devices.resource_name,
            device_ids: devices.device_ids,
        }
    }
}

/// Kubelet device accounting.
#[async_trait]
pub trait PodResourcesLister: Send + Sync {
    /// Devices assigned to the containers of every pod on the node.
    async fn list(&self) -> Result<Vec<ResourceDevices>, Report<DriverError>>;

    /// Every device the kubelet can hand out.
    async fn allocatable(&self) -> Result<Vec<ResourceDevices>, Report<DriverError>>;
}

/// gRPC client of the kubelet pod-resources API over its UNIX socket.
pub struct KubeletPodResources {
    socket_path: PathBuf,
    timeout: Duration,
}

impl KubeletPodResources {
    /// A directory `socket_path` is resolved to the `kubelet.sock` inside it.
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: resolve_socket_path(socket_path.into()),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn create_unix_channel(&self) -> Result<Channel, io::Error> {
        let socket_path = self.socket_path.clone();

        // The URI is ignored, the connector always dials the socket.
        Endpoint::try_from("http://[::]:50051")
            .map_err(|e| io::Error::other(e.to_string()))?
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket_path = socket_path.clone();
                async move {
                    tokio::net::UnixStream::connect(socket_path)
                        .await
                        .map(TokioIo::new)
                }
            }))
            .await
            .map_err(|e| io::Error::other(e.to_string()))
    }

    async fn client(&self) -> Result<PodResourcesListerClient<Channel>, Report<DriverError>> {
        let channel = self.create_unix_channel().await.map_err(|e| {
            Report::new(DriverError::driver(format!(
                "failed to connect to kubelet socket {}: {e}",
                self.socket_path.display()
            )))
        })?;
        Ok(PodResourcesListerClient::new(channel))
    }

    async fn with_timeout<T>(
        &self,
        rpc: &str,
        call: impl Future<Output = Result<T, Report<DriverError>>>,
    ) -> Result<T, Report<DriverError>> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                Report::new(DriverError::Timeout {
                    message: format!("pod-resources {rpc} after {:?}", self.timeout),
                })
            })?
    }
}

fn resolve_socket_path(path: PathBuf) -> PathBuf {
    if path.is_dir() {
        path.join(SOCKET_FILE_NAME)
    } else {
        path
    }
}

#[async_trait]
impl PodResourcesLister for KubeletPodResources {
    async fn list(&self) -> Result<Vec<ResourceDevices>, Report<DriverError>> {
        self.with_timeout("List", async {
            let mut client = self.client().await?;
            let response = client
                .list(tonic::Request::new(ListPodResourcesRequest {}))
                .await
                .map_err(|e| {
                    Report::new(DriverError::driver(format!(
                        "failed to list pod resources: {e}"
                    )))
                })?
                .into_inner();

            debug!(
                "Processing {} pods for assigned devices",
                response.pod_resources.len()
            );
            Ok(response
                .pod_resources
                .into_iter()
                .flat_map(|pod| pod.containers)
                .flat_map(|container| container.devices)
                .map(ResourceDevices::from)
                .collect())
        })
        .await
    }

    async fn allocatable(&self) -> Result<Vec<ResourceDevices>, Report<DriverError>> {
        self.with_timeout("GetAllocatableResources", async {
            let mut client = self.client().await?;
            let response = client
                .get_allocatable_resources(tonic::Request::new(AllocatableResourcesRequest {}))
                .await
                .map_err(|e| {
                    Report::new(DriverError::driver(format!(
                        "failed to get allocatable resources: {e}"
                    )))
                })?
                .into_inner();
            Ok(response
                .devices
                .into_iter()
                .map(ResourceDevices::from)
                .collect())
        })
        .await
    }
}
