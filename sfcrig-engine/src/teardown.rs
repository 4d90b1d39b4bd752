//! Best-effort, dependency-ordered teardown of everything a run registered.
//!
//! The registry is drained and its entries are deleted kind by kind following
//! [`ResourceKind::TEARDOWN_ORDER`], newest first within a kind. Every delete
//! is attempted even after earlier ones failed. A resource the remote side
//! no longer knows counts as already reclaimed.

use std::fmt;
use tracing::{debug, info, warn};

use sfcrig_shared::errors::{ProvisionError, ProvisionResult, TeardownFailure};
use sfcrig_shared::resource::{Operation, RegistryEntry, ResourceHandle, ResourceKind};

use crate::client::{Remote, is_remote_not_found};
use crate::compute::wait_until_gone;
use crate::registry::ResourceRegistry;
use crate::utils::readiness::PollPolicy;

/// Outcome of one teardown pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Deleted by this pass, in deletion order
    pub deleted: Vec<RegistryEntry>,
    /// Already gone on the remote side
    pub already_gone: Vec<RegistryEntry>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.deleted.len() + self.already_gone.len() + self.failures.len()
    }

    /// `AggregateTeardown` listing every failed delete, if any
    pub fn into_result(self) -> ProvisionResult<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::AggregateTeardown(self.failures))
        }
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} deleted, {} already gone, {} failed",
            self.deleted.len(),
            self.already_gone.len(),
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "\n  {}", failure)?;
        }
        Ok(())
    }
}

/// Deletes registered resources in reverse dependency order
#[derive(Clone)]
pub struct TeardownCoordinator {
    remote: Remote,
    server_gone: PollPolicy,
}

impl TeardownCoordinator {
    /// `server_gone` bounds the wait for each deleted VM to disappear
    pub fn new(remote: Remote, server_gone: PollPolicy) -> Self {
        Self { remote, server_gone }
    }

    /// Drain `registry` and delete everything it held
    pub async fn teardown(&self, registry: &ResourceRegistry) -> TeardownReport {
        let mut entries = registry.drain();
        // Drained newest first; the stable sort keeps that order within a kind
        entries.sort_by_key(|entry| entry.kind.teardown_rank());
        info!("Tearing down {} resource(s)", entries.len());

        let mut report = TeardownReport::default();
        for entry in entries {
            match self.delete(&entry).await {
                Ok(()) => {
                    debug!("Deleted {} {}", entry.kind, entry.handle);
                    report.deleted.push(entry);
                }
                Err(err) if is_remote_not_found(&err) => {
                    debug!("{} {} was already gone", entry.kind, entry.handle);
                    report.already_gone.push(entry);
                }
                Err(err) => {
                    warn!("Failed to delete {} {}: {}", entry.kind, entry.handle, err);
                    report.failures.push(TeardownFailure {
                        kind: entry.kind,
                        handle: entry.handle,
                        error: err.to_string(),
                    });
                }
            }
        }

        if report.is_clean() {
            info!("Teardown complete: {}", report);
        } else {
            warn!("Teardown incomplete: {}", report);
        }
        report
    }

    async fn delete(&self, entry: &RegistryEntry) -> ProvisionResult<()> {
        let remote = &self.remote;
        let kind = entry.kind;
        let handle = &entry.handle;
        match (kind, handle) {
            (
                ResourceKind::RouterInterface,
                ResourceHandle::RouterInterface {
                    router_id,
                    subnet_id,
                },
            ) => {
                remote
                    .call(
                        Operation::RemoveRouterInterface,
                        kind,
                        handle,
                        remote.network().remove_router_interface(router_id, subnet_id),
                    )
                    .await
            }
            (ResourceKind::TrunkSubport, ResourceHandle::Subport { trunk_id, port_id, .. }) => remote
                .call(
                    Operation::RemoveSubports,
                    kind,
                    handle,
                    remote.network().remove_subports(trunk_id, vec![port_id.clone()]),
                )
                .await
                .map(|_| ()),
            (ResourceKind::Server, ResourceHandle::Id(id)) => {
                remote
                    .call(Operation::Delete, kind, id, remote.compute().delete(id))
                    .await?;
                wait_until_gone(remote, &self.server_gone, id).await
            }
            (ResourceKind::Project, ResourceHandle::Id(id)) => {
                remote
                    .call(Operation::Delete, kind, id, remote.identity().delete_project(id))
                    .await
            }
            (ResourceKind::User, ResourceHandle::Id(id)) => {
                remote
                    .call(Operation::Delete, kind, id, remote.identity().delete_user(id))
                    .await
            }
            (kind, ResourceHandle::Id(id)) if !kind.is_binding() => {
                remote
                    .call(Operation::Delete, kind, id, remote.network().delete(kind, id))
                    .await
            }
            (kind, handle) => Err(ProvisionError::KindHandleMismatch {
                kind,
                handle: handle.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::Simulator;
    use sfcrig_shared::errors::RemoteError;
    use std::sync::Arc;
    use std::time::Duration;

    fn coordinator(sim: &Arc<Simulator>) -> TeardownCoordinator {
        let remote = Remote::new(sim.clone(), sim.clone(), sim.clone(), Duration::from_secs(1));
        TeardownCoordinator::new(remote, PollPolicy::immediate(Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn test_empty_registry_is_clean() {
        let sim = Arc::new(Simulator::new());
        let report = coordinator(&sim).teardown(&ResourceRegistry::new()).await;
        assert_eq!(report.attempted(), 0);
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_resources_count_as_gone() {
        let sim = Arc::new(Simulator::new());
        let registry = ResourceRegistry::new();
        registry.register_id(ResourceKind::Network, "net-x").unwrap();
        registry
            .register(ResourceKind::RouterInterface, ResourceHandle::router_interface("r", "s"))
            .unwrap();
        let report = coordinator(&sim).teardown(&registry).await;
        assert_eq!(report.already_gone.len(), 2);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_ordering_by_kind_then_newest_first() {
        let sim = Arc::new(Simulator::new());
        let registry = ResourceRegistry::new();
        registry.register_id(ResourceKind::Network, "n1").unwrap();
        registry.register_id(ResourceKind::Port, "p1").unwrap();
        registry.register_id(ResourceKind::PortChain, "c1").unwrap();
        registry.register_id(ResourceKind::Port, "p2").unwrap();

        coordinator(&sim).teardown(&registry).await;
        let targets: Vec<String> = sim.calls().into_iter().map(|c| c.target).collect();
        assert_eq!(targets, vec!["c1", "p2", "p1", "n1"]);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_teardown() {
        let sim = Arc::new(Simulator::new());
        let registry = ResourceRegistry::new();
        registry.register_id(ResourceKind::Router, "r1").unwrap();
        registry.register_id(ResourceKind::Router, "r2").unwrap();
        sim.fail_target(
            Operation::Delete,
            ResourceKind::Router,
            "r2",
            RemoteError::Conflict {
                kind: ResourceKind::Router,
                message: "busy".to_string(),
            },
        );

        let report = coordinator(&sim).teardown(&registry).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].handle, ResourceHandle::id("r2"));
        assert_eq!(sim.call_count(), 2);
        assert!(matches!(
            report.into_result(),
            Err(ProvisionError::AggregateTeardown(failures)) if failures.len() == 1
        ));
    }
}
