//! Health endpoints of the agent
//!
//! - `GET /healthz` - the process is up
//! - `GET /readyz` - MIG status has been reported at least once

pub mod errors;
pub mod handlers;
pub mod server;

pub use errors::ApiError;
pub use server::HealthServer;
