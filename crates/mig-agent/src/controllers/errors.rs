use core::error::Error;

use mig_core::MigProfile;

/// Why a Reporter or Actuator run failed.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum ReconcileError {
    #[display("Invalid MIG annotation on node")]
    InvalidAnnotation,
    #[display("Requested MIG geometry is not allowed")]
    IllegalGeometry,
    #[display("MIG driver operation failed")]
    Driver,
    #[display("Reconciliation cancelled")]
    Cancelled,
    #[display("Reconciliation timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[display("Kubernetes operation failed")]
    Kubernetes,
    #[display("Deleted only {deleted} of {requested} {profile} devices on GPU {gpu_index}")]
    PartialFailure {
        gpu_index: u32,
        profile: MigProfile,
        deleted: u32,
        requested: u32,
    },
    #[display("Device plugin refresh failed")]
    DevicePlugin,
}

impl Error for ReconcileError {}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn reconcile_error_display_formatting() {
        assert_eq!(
            ReconcileError::PartialFailure {
                gpu_index: 1,
                profile: MigProfile::new(1, 10),
                deleted: 1,
                requested: 3,
            }
            .to_string(),
            "Deleted only 1 of 3 1g.10gb devices on GPU 1"
        );
        assert_eq!(
            ReconcileError::Timeout { seconds: 300 }.to_string(),
            "Reconciliation timed out after 300s"
        );
    }
}
