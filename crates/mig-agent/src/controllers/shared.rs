use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tokio::sync::Notify;

/// State shared by the Reporter and the Actuator of one node.
#[derive(Debug)]
pub struct SharedState {
    node_lock: Mutex<()>,
    /// A report happened since the Actuator last applied a plan.
    report_done: AtomicBool,
    /// At least one report succeeded since startup.
    ready: AtomicBool,
    report_requested: Notify,
    apply_requested: Notify,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            node_lock: Mutex::new(()),
            // Nothing was applied yet, so the Actuator may run before the first report.
            report_done: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            report_requested: Notify::new(),
            apply_requested: Notify::new(),
        }
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes Reporter and Actuator runs on the node.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.node_lock.lock().await
    }

    pub fn on_report_done(&self) {
        self.report_done.store(true, Ordering::SeqCst);
    }

    pub fn on_apply_done(&self) {
        self.report_done.store(false, Ordering::SeqCst);
    }

    pub fn at_least_one_report_since_last_apply(&self) -> bool {
        self.report_done.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Wakes the Reporter. Requests made while it is busy coalesce into one.
    pub fn request_report(&self) {
        self.report_requested.notify_one();
    }

    pub fn request_apply(&self) {
        self.apply_requested.notify_one();
    }

    pub async fn report_requested(&self) {
        self.report_requested.notified().await;
    }

    pub async fn apply_requested(&self) {
        self.apply_requested.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use test_log::test;

    use super::*;

    #[test]
    fn apply_closes_report_gate_until_next_report() {
        let shared = SharedState::new();
        assert!(shared.at_least_one_report_since_last_apply());
        shared.on_apply_done();
        assert!(!shared.at_least_one_report_since_last_apply());
        shared.on_report_done();
        assert!(shared.at_least_one_report_since_last_apply());
    }

    #[test(tokio::test)]
    async fn requests_made_before_waiting_are_not_lost() {
        let shared = SharedState::new();
        shared.request_apply();
        shared.request_apply();
        tokio::time::timeout(Duration::from_secs(1), shared.apply_requested())
            .await
            .expect("stored permit wakes the waiter");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), shared.apply_requested())
                .await
                .is_err(),
            "requests coalesce into a single permit"
        );
    }
}
