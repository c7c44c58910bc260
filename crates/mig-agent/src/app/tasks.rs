use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::HealthServer;
use crate::app::services::ApplicationServices;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, services: &ApplicationServices, health_addr: &str) {
        let node_watcher_task = self.spawn_node_watcher_task(services);
        self.tasks.push(node_watcher_task);

        let reporter_task = self.spawn_reporter_task(services);
        self.tasks.push(reporter_task);

        let actuator_task = self.spawn_actuator_task(services);
        self.tasks.push(actuator_task);

        let health_server_task = self.spawn_health_server_task(services, health_addr);
        self.tasks.push(health_server_task);
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                anyhow::bail!("a background task exited unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_node_watcher_task(&self, services: &ApplicationServices) -> JoinHandle<()> {
        let node_watcher = services.node_watcher.clone();
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting node watcher task");
            node_watcher.run(token).await;
            tracing::info!("Node watcher task completed");
        })
    }

    fn spawn_reporter_task(&self, services: &ApplicationServices) -> JoinHandle<()> {
        let reporter = services.reporter.clone();
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting reporter task");
            reporter.run(token).await;
            tracing::info!("Reporter task completed");
        })
    }

    fn spawn_actuator_task(&self, services: &ApplicationServices) -> JoinHandle<()> {
        let actuator = services.actuator.clone();
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting actuator task");
            actuator.run(token).await;
            tracing::info!("Actuator task completed");
        })
    }

    fn spawn_health_server_task(
        &self,
        services: &ApplicationServices,
        health_addr: &str,
    ) -> JoinHandle<()> {
        let health_server = HealthServer::new(services.shared.clone(), health_addr.to_string());
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            if let Err(e) = health_server.run(token).await {
                tracing::error!("Health server error: {e:?}");
            }
        })
    }
}
