//! Service composition.
//!
//! A [`Provisioner`] wires one instance of every capability service around a
//! single run-scoped [`ResourceRegistry`]. Scenario drivers only ever talk to
//! the services held here, so everything a run creates ends up in the same
//! registry and goes away in the same teardown.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::chain::ChainAssembler;
use crate::cidr::CidrPool;
use crate::client::{ComputeApi, IdentityApi, NetworkApi, Remote};
use crate::compute::ServerManager;
use crate::identity::IdentityManager;
use crate::registry::ResourceRegistry;
use crate::remote_exec::{RemoteExecOrchestrator, RemoteExecutor};
use crate::simulator::Simulator;
use crate::teardown::{TeardownCoordinator, TeardownReport};
use crate::topology::TopologyBuilder;
use crate::trunk::TrunkManager;
use crate::utils::readiness::PollPolicy;

/// Timeouts shared by every service of a provisioner
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionerSettings {
    /// Upper bound for a single control-plane call
    pub call_timeout: Duration,
    /// Wait for a booted VM to become active
    pub readiness: PollPolicy,
    /// Wait for a deleted VM to disappear
    pub server_gone: PollPolicy,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
            readiness: PollPolicy::default(),
            server_gone: PollPolicy::with_deadline(Duration::from_secs(120)),
        }
    }
}

impl ProvisionerSettings {
    /// Tight polling for the in-memory control plane
    pub fn simulated() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            readiness: PollPolicy::immediate(Duration::from_secs(5)),
            server_gone: PollPolicy::immediate(Duration::from_secs(5)),
        }
    }
}

/// Every capability service of one run around one registry
#[derive(Clone)]
pub struct Provisioner {
    pub registry: ResourceRegistry,
    pub topology: TopologyBuilder,
    pub trunks: TrunkManager,
    pub chains: ChainAssembler,
    pub servers: ServerManager,
    pub identity: IdentityManager,
    pub teardown: TeardownCoordinator,
    pub exec: RemoteExecOrchestrator,
}

impl Provisioner {
    pub fn new(
        network: Arc<dyn NetworkApi>,
        compute: Arc<dyn ComputeApi>,
        identity: Arc<dyn IdentityApi>,
        executor: Arc<dyn RemoteExecutor>,
        cidrs: CidrPool,
        settings: ProvisionerSettings,
    ) -> Self {
        let remote = Remote::new(network, compute, identity, settings.call_timeout);
        let registry = ResourceRegistry::new();
        let topology = TopologyBuilder::new(remote.clone(), registry.clone(), cidrs);

        Self {
            trunks: TrunkManager::new(remote.clone(), registry.clone()),
            chains: ChainAssembler::new(topology.clone()),
            servers: ServerManager::new(remote.clone(), registry.clone(), settings.readiness),
            identity: IdentityManager::new(remote.clone(), registry.clone()),
            teardown: TeardownCoordinator::new(remote, settings.server_gone),
            exec: RemoteExecOrchestrator::new(executor),
            topology,
            registry,
        }
    }

    /// Provisioner whose three capabilities are all served by `simulator`
    pub fn simulated(
        simulator: Arc<Simulator>,
        executor: Arc<dyn RemoteExecutor>,
        cidrs: CidrPool,
        settings: ProvisionerSettings,
    ) -> Self {
        Self::new(
            simulator.clone(),
            simulator.clone(),
            simulator,
            executor,
            cidrs,
            settings,
        )
    }

    /// Tear down everything registered so far
    pub async fn teardown(&self) -> TeardownReport {
        info!("Releasing {} registered resource(s)", self.registry.len());
        self.teardown.teardown(&self.registry).await
    }
}
