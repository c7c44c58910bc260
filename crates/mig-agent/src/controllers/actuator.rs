//! Drives the physical MIG geometry towards the node's spec annotations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use mig_core::spec_matches_status;
use mig_core::AnnotationSchema;
use mig_core::DeleteOperation;
use mig_core::GeometryCatalog;
use mig_core::MigConfigPlan;
use mig_core::MigProfile;
use mig_core::MigState;
use mig_core::Node;
use mig_core::SpecEntry;
use mig_core::StateError;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::controllers::errors::ReconcileError;
use crate::controllers::SharedState;
use crate::platform::errors::DriverError;
use crate::platform::k8s::DevicePluginRefresher;
use crate::platform::k8s::NodeSnapshot;
use crate::platform::k8s::NodeStore;
use crate::platform::mig_client::MigClient;

pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(300);
const REPORT_GATE_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The last applied plan has not been reported yet.
    WaitingForReport,
    StatusMatchesSpec,
    NothingToDo,
    AlreadyApplied,
    /// The kubelet listed a device the driver does not know; the device plugin was restarted.
    DevicePluginRefreshed,
    Applied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AppliedPlan {
    plan: MigConfigPlan,
    status: BTreeMap<String, String>,
}

#[derive(Default)]
struct Execution {
    refresh_required: bool,
    errors: Option<Report<ReconcileError>>,
}

impl Execution {
    fn record(&mut self, error: Report<ReconcileError>) {
        match self.errors.as_mut() {
            Some(errors) => errors.extend_one(error),
            None => self.errors = Some(error),
        }
    }
}

fn check_cancelled(cancellation_token: &CancellationToken) -> Result<(), Report<ReconcileError>> {
    if cancellation_token.is_cancelled() {
        return Err(Report::new(ReconcileError::Cancelled));
    }
    Ok(())
}

pub struct Actuator {
    client: Arc<dyn MigClient>,
    store: Arc<dyn NodeStore>,
    refresher: Arc<dyn DevicePluginRefresher>,
    schema: AnnotationSchema,
    catalog: Arc<GeometryCatalog>,
    shared: Arc<SharedState>,
    reconcile_timeout: Duration,
    last_applied: Mutex<Option<AppliedPlan>>,
}

impl Actuator {
    pub fn new(
        client: Arc<dyn MigClient>,
        store: Arc<dyn NodeStore>,
        refresher: Arc<dyn DevicePluginRefresher>,
        schema: AnnotationSchema,
        catalog: Arc<GeometryCatalog>,
        shared: Arc<SharedState>,
    ) -> Self {
        Self {
            client,
            store,
            refresher,
            schema,
            catalog,
            shared,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            last_applied: Mutex::new(None),
        }
    }

    pub fn with_reconcile_timeout(mut self, reconcile_timeout: Duration) -> Self {
        self.reconcile_timeout = reconcile_timeout;
        self
    }

    /// Reconciles every time the node's annotations change.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("Starting MIG actuator");

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("MIG actuator shutdown requested");
                    break;
                }
                _ = self.shared.apply_requested() => {}
            }
            while self.reconcile(&cancellation_token).await == Some(ApplyOutcome::WaitingForReport) {
                debug!("last applied plan not reported yet, waiting");
                select! {
                    _ = cancellation_token.cancelled() => return,
                    _ = tokio::time::sleep(REPORT_GATE_RETRY) => {}
                }
            }
        }
    }

    /// One [`Actuator::apply`] bounded by the reconcile timeout. Failures are
    /// logged and yield `None`.
    pub async fn reconcile(&self, cancellation_token: &CancellationToken) -> Option<ApplyOutcome> {
        match tokio::time::timeout(self.reconcile_timeout, self.apply(cancellation_token)).await {
            Ok(Ok(outcome)) => {
                debug!(?outcome, "MIG reconciliation finished");
                Some(outcome)
            }
            Ok(Err(e)) => {
                error!("MIG reconciliation failed: {e:?}");
                None
            }
            Err(_) => {
                // A driver call already on the blocking pool still runs to completion.
                let e = Report::new(ReconcileError::Timeout {
                    seconds: self.reconcile_timeout.as_secs(),
                });
                error!("MIG reconciliation failed: {e:?}");
                None
            }
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn apply(
        &self,
        cancellation_token: &CancellationToken,
    ) -> Result<ApplyOutcome, Report<ReconcileError>> {
        if !self.shared.at_least_one_report_since_last_apply() {
            return Ok(ApplyOutcome::WaitingForReport);
        }

        let _guard = self.shared.lock().await;
        let node = self
            .store
            .get()
            .await
            .change_context(ReconcileError::Kubernetes)?;
        let (specs, statuses) = self
            .schema
            .extract(&node.annotations)
            .change_context(ReconcileError::InvalidAnnotation)?;
        if spec_matches_status(&specs, &statuses) {
            info!("reported status matches desired MIG config, nothing to do");
            return Ok(ApplyOutcome::StatusMatchesSpec);
        }
        self.check_feasibility(&node, &specs)?;

        let devices = match self.client.get_mig_devices().await {
            Ok(devices) => devices,
            Err(e) if matches!(e.current_context(), DriverError::NotFound { .. }) => {
                warn!("kubelet advertises a MIG device unknown to the driver: {e:?}");
                self.refresher
                    .refresh(cancellation_token)
                    .await
                    .change_context(ReconcileError::DevicePlugin)?;
                return Ok(ApplyOutcome::DevicePluginRefreshed);
            }
            Err(e) => return Err(e.change_context(ReconcileError::Driver)),
        };

        let state = MigState::new(devices);
        let plan = if state.matches(&specs) {
            info!("actual state matches desired MIG config");
            MigConfigPlan::default()
        } else {
            MigConfigPlan::new(&state, &specs)
        };
        let current = AppliedPlan {
            plan,
            status: self.schema.status_subset(&node.annotations),
        };
        let previous = self
            .last_applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(current.clone());

        if current.plan.is_empty() {
            info!("MIG config plan is empty, nothing to do");
            return Ok(ApplyOutcome::NothingToDo);
        }
        if previous.as_ref() == Some(&current) {
            info!("MIG config plan already applied and state hasn't changed, nothing to do");
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let result = self.execute(&current.plan, cancellation_token).await;
        self.shared.on_apply_done();
        result
    }

    /// Rejects specs that no allowed geometry of their GPU can hold. The
    /// check starts from empty GPUs: a reported partial layout is a normal
    /// intermediate state and never blocks reconciliation.
    fn check_feasibility(
        &self,
        node: &NodeSnapshot,
        specs: &[SpecEntry],
    ) -> Result<(), Report<ReconcileError>> {
        let layout = match Node::from_labels(&node.name, &node.labels, &self.catalog) {
            Ok(layout) => layout,
            Err(StateError::UnknownModel(e)) => {
                warn!("skipping geometry check: {e}");
                return Ok(());
            }
            Err(e) => return Err(Report::new(e).change_context(ReconcileError::IllegalGeometry)),
        };
        layout
            .check_spec_feasibility(specs, &self.catalog)
            .change_context(ReconcileError::IllegalGeometry)
    }

    async fn execute(
        &self,
        plan: &MigConfigPlan,
        cancellation_token: &CancellationToken,
    ) -> Result<ApplyOutcome, Report<ReconcileError>> {
        info!(%plan, "applying MIG config plan");
        let mut execution = Execution::default();
        let outcome = self
            .run_plan(plan, cancellation_token, &mut execution)
            .await;

        if execution.refresh_required {
            if let Err(e) = self.refresher.refresh(cancellation_token).await {
                execution.record(e.change_context(ReconcileError::DevicePlugin));
            }
        }

        match (outcome, execution.errors) {
            (Err(mut abort), Some(errors)) => {
                abort.extend_one(errors);
                Err(abort)
            }
            (Err(abort), None) => Err(abort),
            (Ok(()), Some(errors)) => Err(errors),
            (Ok(()), None) => Ok(ApplyOutcome::Applied),
        }
    }

    /// All deletes, then the creates batched per GPU. An `Err` aborts the rest of the plan.
    async fn run_plan(
        &self,
        plan: &MigConfigPlan,
        cancellation_token: &CancellationToken,
        execution: &mut Execution,
    ) -> Result<(), Report<ReconcileError>> {
        for op in &plan.deletes {
            self.run_delete(op, cancellation_token, execution).await?;
        }

        let mut batches: BTreeMap<u32, Vec<MigProfile>> = BTreeMap::new();
        for op in &plan.creates {
            batches
                .entry(op.gpu_index)
                .or_default()
                .extend(std::iter::repeat(op.profile).take(op.quantity as usize));
        }
        for (gpu_index, profiles) in batches {
            check_cancelled(cancellation_token)?;
            let count = profiles.len();
            self.client
                .create_migs(gpu_index, profiles)
                .await
                .change_context(ReconcileError::Driver)
                .attach_printable_lazy(|| format!("creating MIG devices on GPU {gpu_index}"))?;
            execution.refresh_required = true;
            info!(gpu_index, count, "created MIG devices");
        }
        Ok(())
    }

    async fn run_delete(
        &self,
        op: &DeleteOperation,
        cancellation_token: &CancellationToken,
        execution: &mut Execution,
    ) -> Result<(), Report<ReconcileError>> {
        let mut deleted = 0;
        for device in op.resources.iter().take(op.quantity as usize) {
            check_cancelled(cancellation_token)?;
            if device.is_used() {
                warn!(%device, "MIG device is in use, abandoning the rest of the delete");
                break;
            }
            match self.client.delete_mig(device).await {
                Ok(()) => {
                    info!(%device, "deleted MIG device");
                    execution.refresh_required = true;
                    deleted += 1;
                }
                Err(e) => match e.current_context() {
                    DriverError::NotFound { .. } => {
                        warn!(%device, "MIG device already gone");
                        execution.refresh_required = true;
                        deleted += 1;
                    }
                    DriverError::Busy { .. } => {
                        warn!(%device, "MIG device is busy, abandoning the rest of the delete: {e:?}");
                        break;
                    }
                    _ => {
                        return Err(e
                            .change_context(ReconcileError::Driver)
                            .attach_printable(format!("deleting {device}")))
                    }
                },
            }
        }

        if (op.resources.len() as u32) < op.quantity {
            execution.record(Report::new(ReconcileError::PartialFailure {
                gpu_index: op.gpu_index,
                profile: op.profile,
                deleted,
                requested: op.quantity,
            }));
        }
        Ok(())
    }
}
