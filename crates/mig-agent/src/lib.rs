//! Node agent of the MIG partitioning control plane
//!
//! Reports the MIG devices of the node's GPUs as node annotations and
//! reshapes the GPUs until they match the geometry requested through the
//! spec annotations.

pub mod api;
pub mod app;
pub mod config;
pub mod controllers;
pub mod gpu_init;
pub mod logging;
pub mod platform;
