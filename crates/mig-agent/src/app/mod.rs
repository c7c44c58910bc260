//! Agent lifecycle
//!
//! Wires the platform adapters into the controllers and drives their
//! lifecycle.

pub mod agent;
pub mod builder;
pub mod services;
pub mod tasks;

pub use agent::Agent;
pub use builder::ApplicationBuilder;
pub use services::ApplicationServices;
