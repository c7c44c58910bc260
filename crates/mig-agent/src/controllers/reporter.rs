//! Publishes the observed MIG devices as node status annotations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use mig_core::AnnotationSchema;
use rand::Rng;
use tokio::select;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::controllers::errors::ReconcileError;
use crate::controllers::SharedState;
use crate::platform::k8s::KubernetesError;
use crate::platform::k8s::NodeStore;
use crate::platform::mig_client::MigClient;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const MAX_PATCH_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Unchanged,
    Updated,
}

pub struct Reporter {
    client: Arc<dyn MigClient>,
    store: Arc<dyn NodeStore>,
    schema: AnnotationSchema,
    shared: Arc<SharedState>,
    refresh_interval: Duration,
}

/// `base` plus up to 100% random jitter.
fn with_jitter(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.0..=1.0);
    base + base.mul_f64(factor)
}

impl Reporter {
    pub fn new(
        client: Arc<dyn MigClient>,
        store: Arc<dyn NodeStore>,
        schema: AnnotationSchema,
        shared: Arc<SharedState>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            schema,
            shared,
            refresh_interval,
        }
    }

    /// Reports on every tick and on every resource change of the node.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(interval = ?self.refresh_interval, "Starting MIG reporter");
        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("MIG reporter shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.shared.report_requested() => {}
            }
            if let Err(e) = self.report().await {
                error!("Failed to report MIG status: {e:?}");
            }
        }
    }

    /// One report under the node lock. The Actuator's report gate opens
    /// whatever the outcome.
    #[tracing::instrument(skip(self))]
    pub async fn report(&self) -> Result<ReportOutcome, Report<ReconcileError>> {
        let _guard = self.shared.lock().await;
        let result = self.report_locked().await;
        self.shared.on_report_done();
        result
    }

    async fn report_locked(&self) -> Result<ReportOutcome, Report<ReconcileError>> {
        let devices = self
            .client
            .get_mig_devices()
            .await
            .change_context(ReconcileError::Driver)?;
        let status = self.schema.emit(&devices);

        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.publish(&status).await {
                Ok(outcome) => {
                    self.shared.mark_ready();
                    return Ok(outcome);
                }
                Err(e)
                    if matches!(e.current_context(), KubernetesError::Conflict { .. })
                        && attempt < MAX_PATCH_ATTEMPTS =>
                {
                    let delay = with_jitter(backoff);
                    warn!(attempt, ?delay, "Status patch conflicted, retrying");
                    tokio::time::sleep(delay).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e.change_context(ReconcileError::Kubernetes)),
            }
        }
    }

    /// Replaces the node's status annotations with `status` unless they already match.
    async fn publish(
        &self,
        status: &BTreeMap<String, String>,
    ) -> Result<ReportOutcome, Report<KubernetesError>> {
        let node = self.store.get().await?;
        let current = self.schema.status_subset(&node.annotations);
        if &current == status {
            debug!("MIG status up to date");
            return Ok(ReportOutcome::Unchanged);
        }

        let mut changes: BTreeMap<String, Option<String>> =
            current.into_keys().map(|key| (key, None)).collect();
        changes.extend(
            status
                .iter()
                .map(|(key, value)| (key.clone(), Some(value.clone()))),
        );
        self.store
            .patch_annotations(node.resource_version.as_deref(), changes)
            .await?;
        info!(keys = status.len(), "Updated MIG status annotations");
        Ok(ReportOutcome::Updated)
    }
}
