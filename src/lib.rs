//! backend-pool-reconciler: keeps a cloud load balancer's backend address pool
//! in step with the Kubernetes nodes that should receive a service's traffic.
//!
//! The engine supports two addressing modes for backend pools, NIC
//! IP-configuration references and raw node IP addresses, and migrates a pool
//! between them when the configured mode changes.

pub mod backend_pool;
pub mod config;
pub mod error;
pub mod network;
pub mod nodes;
pub mod vmset;

pub use crate::error::{Error, Result};
