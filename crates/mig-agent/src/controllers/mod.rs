//! Node-level reconcilers.
//!
//! The [`Reporter`] publishes the observed MIG devices as status annotations,
//! the [`Actuator`] changes the MIG geometry until it matches the spec
//! annotations. Both serialize on the node lock held in [`SharedState`].

pub mod actuator;
pub mod errors;
pub mod predicates;
pub mod reporter;
pub mod shared;
#[cfg(test)]
pub(crate) mod testing;

pub use actuator::Actuator;
pub use actuator::ApplyOutcome;
pub use errors::ReconcileError;
pub use reporter::ReportOutcome;
pub use reporter::Reporter;
pub use shared::SharedState;
