//! Service-chain topology provisioner.
//!
//! Builds networks, trunks, VMs and service function chains through narrow
//! control-plane capability traits, records every created resource in a
//! run-scoped registry and deletes them again in dependency order.

pub mod chain;
pub mod cidr;
pub mod client;
pub mod compute;
pub mod config;
pub mod identity;
pub mod registry;
pub mod remote_exec;
pub mod scenario;
pub mod services;
pub mod simulator;
pub mod teardown;
pub mod topology;
pub mod trunk;
pub mod utils;
