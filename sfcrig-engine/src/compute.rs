//! Virtual machine boot and readiness.

use tracing::{info, instrument, warn};

use sfcrig_shared::errors::{ProvisionError, ProvisionResult};
use sfcrig_shared::model::{BootRequest, Server, ServerStatus};
use sfcrig_shared::resource::{Operation, ResourceKind};

use crate::client::{Remote, decode, encode, is_remote_not_found};
use crate::registry::ResourceRegistry;
use crate::utils::readiness::{PollPolicy, Probe, poll_until};

fn status_name(status: &ServerStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{status:?}"))
}

/// Current record of a server
pub async fn show_server(remote: &Remote, server_id: &str) -> ProvisionResult<Server> {
    let record = remote
        .call(
            Operation::Show,
            ResourceKind::Server,
            server_id,
            remote.compute().show(server_id),
        )
        .await?;
    decode(Operation::Show, ResourceKind::Server, record)
}

/// Poll until the compute service no longer knows the server
pub async fn wait_until_gone(remote: &Remote, policy: &PollPolicy, server_id: &str) -> ProvisionResult<()> {
    poll_until(policy, ResourceKind::Server, server_id, move || async move {
        match show_server(remote, server_id).await {
            Ok(server) => Ok(Probe::Pending(status_name(&server.status))),
            Err(err) if is_remote_not_found(&err) => Ok(Probe::Ready(())),
            Err(err) => Err(err),
        }
    })
    .await
}

/// Boots VMs and waits for them to become active
#[derive(Clone)]
pub struct ServerManager {
    remote: Remote,
    registry: ResourceRegistry,
    readiness: PollPolicy,
}

impl ServerManager {
    pub fn new(remote: Remote, registry: ResourceRegistry, readiness: PollPolicy) -> Self {
        Self {
            remote,
            registry,
            readiness,
        }
    }

    /// Boot a VM on already created ports and wait until it is `ACTIVE`.
    ///
    /// The server is registered as soon as the boot request is accepted, so a
    /// VM that never becomes active is still torn down.
    #[instrument(skip(self, request), fields(name = ?request.name, image = %request.image))]
    pub async fn boot_server(&self, request: BootRequest) -> ProvisionResult<Server> {
        for port_id in &request.port_ids {
            self.registry.require(ResourceKind::Port, port_id)?;
        }

        let body = encode(Operation::Create, ResourceKind::Server, &request)?;
        let record = self
            .remote
            .call(
                Operation::Create,
                ResourceKind::Server,
                request.name.as_deref().unwrap_or(&request.image),
                self.remote.compute().boot(body),
            )
            .await?;
        let server: Server = decode(Operation::Create, ResourceKind::Server, record)?;
        self.registry.register_id(ResourceKind::Server, &server.id)?;
        info!("Booting server {} ({})", server.name, server.id);

        let started = tokio::time::Instant::now();
        let remote = &self.remote;
        let server_id = server.id.as_str();
        let server = poll_until(&self.readiness, ResourceKind::Server, server_id, move || async move {
            let current = show_server(remote, server_id).await?;
            let status = current.status.clone();
            match status {
                ServerStatus::Active => Ok(Probe::Ready(current)),
                ServerStatus::Error => {
                    warn!("Server {} went to ERROR", current.id);
                    Err(ProvisionError::NotReady {
                        kind: ResourceKind::Server,
                        handle: current.id.clone(),
                        waited: started.elapsed(),
                        last_state: status_name(&current.status),
                    })
                }
                other => Ok(Probe::Pending(status_name(&other))),
            }
        })
        .await?;

        info!("Server {} is active", server.id);
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cidr::CidrPool;
    use crate::simulator::Simulator;
    use crate::topology::TopologyBuilder;
    use sfcrig_shared::model::{NetworkOptions, PortOptions, SubnetOptions};
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup(sim: Simulator) -> (TopologyBuilder, ServerManager, String) {
        let sim = Arc::new(sim);
        let remote = Remote::new(sim.clone(), sim.clone(), sim, Duration::from_secs(1));
        let registry = ResourceRegistry::new();
        let cidrs = CidrPool::isolated("10.80.0.0/24".parse().unwrap(), "fd00:80::/64".parse().unwrap());
        let topo = TopologyBuilder::new(remote.clone(), registry.clone(), cidrs);
        let servers = ServerManager::new(remote, registry, PollPolicy::immediate(Duration::from_secs(2)));
        let (network, _) = topo
            .create_network_and_subnets(NetworkOptions::vlan(), SubnetOptions::default(), 1, false)
            .await
            .unwrap();
        let port = topo.create_port(&network.id, PortOptions::default()).await.unwrap();
        (topo, servers, port.id)
    }

    fn request(image: &str, port_id: String) -> BootRequest {
        BootRequest {
            name: Some("src-vm".to_string()),
            image: image.to_string(),
            flavor: "m1.small".to_string(),
            port_ids: vec![port_id],
            key_name: None,
        }
    }

    #[tokio::test]
    async fn test_boot_waits_for_active() {
        let (topo, servers, port_id) = setup(Simulator::new().with_boot_polls(3)).await;
        let server = servers.boot_server(request("cirros", port_id)).await.unwrap();
        assert_eq!(server.status, ServerStatus::Active);
        assert!(topo.registry().contains(ResourceKind::Server, &server.id));
    }

    #[tokio::test]
    async fn test_error_status_fails_but_stays_registered() {
        let sim = Simulator::new();
        sim.mark_image_broken("broken");
        let (topo, servers, port_id) = setup(sim).await;
        let err = servers.boot_server(request("broken", port_id)).await.unwrap_err();
        match err {
            ProvisionError::NotReady { last_state, .. } => assert_eq!(last_state, "ERROR"),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(topo.registry().all_of(ResourceKind::Server).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_port_is_dangling() {
        let (_topo, servers, _) = setup(Simulator::new()).await;
        let err = servers
            .boot_server(request("cirros", "ghost".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::DanglingReference { .. }));
    }
}
