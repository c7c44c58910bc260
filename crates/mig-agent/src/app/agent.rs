use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing::warn;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::controllers::SharedState;

/// How long to wait for an in-flight Reporter or Actuator run once the tasks stopped.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

/// The node agent: its components plus the address of the health server.
pub struct Agent {
    services: ApplicationServices,
    health_addr: String,
}

impl Agent {
    pub fn new(services: ApplicationServices, health_addr: String) -> Self {
        Self {
            services,
            health_addr,
        }
    }

    /// Runs every task until a shutdown signal or a task exits, then waits
    /// for the node to settle.
    pub async fn run(&self) -> Result<()> {
        info!("Starting all agent tasks...");

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(&self.services, &self.health_addr);
        let result = tasks.wait_for_completion().await;
        if let Err(e) = &result {
            tracing::error!("Error during task execution: {e}");
        }

        settle(&self.services.shared, SETTLE_TIMEOUT).await;
        result
    }
}

/// Waits until no Reporter or Actuator run holds the node lock, so the
/// process never exits between two driver calls of a plan. Returns false if
/// a run is still going after `timeout`.
async fn settle(shared: &SharedState, timeout: Duration) -> bool {
    let Ok(_guard) = tokio::time::timeout(timeout, shared.lock()).await else {
        warn!("a MIG reconciliation is still running after {timeout:?}, exiting anyway");
        return false;
    };
    if !shared.at_least_one_report_since_last_apply() {
        warn!("the last applied MIG plan was never reported, status annotations are stale");
    }
    info!("MIG agent stopped");
    true
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use test_log::test;

    use super::*;

    #[test(tokio::test)]
    async fn settle_returns_once_the_node_is_idle() {
        let shared = SharedState::new();
        shared.on_apply_done();
        assert!(settle(&shared, Duration::from_secs(1)).await);
    }

    #[test(tokio::test(start_paused = true))]
    async fn settle_waits_for_the_running_reconciliation() {
        let shared = Arc::new(SharedState::new());
        let guard = shared.lock().await;

        assert!(!settle(&shared, Duration::from_secs(5)).await);

        let holder = shared.clone();
        let waiter = tokio::spawn(async move { settle(&holder, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }
}
