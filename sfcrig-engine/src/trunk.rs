//! VLAN trunks and their subport bindings.

use mac_address::MacAddress;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use sfcrig_shared::errors::{ProvisionError, ProvisionResult};
use sfcrig_shared::model::{Port, PortOptions, SegmentationType, SubportBinding, Trunk};
use sfcrig_shared::resource::{Operation, ResourceHandle, ResourceId, ResourceKind};

use crate::client::records::TrunkRequest;
use crate::client::{Remote, decode, encode};
use crate::registry::ResourceRegistry;
use crate::topology::TopologyBuilder;

/// Valid 802.1Q VLAN ids
pub const VLAN_RANGE: std::ops::RangeInclusive<u16> = 1..=4094;

/// OUI used for generated subport MACs
const MAC_PREFIX: [u8; 3] = [0xfa, 0x16, 0x3e];

/// Random MAC under the locally administered prefix
pub fn generate_mac() -> MacAddress {
    MacAddress::new([
        MAC_PREFIX[0],
        MAC_PREFIX[1],
        MAC_PREFIX[2],
        fastrand::u8(..),
        fastrand::u8(..),
        fastrand::u8(..),
    ])
}

/// Creates trunks and keeps their bindings in sync with the remote side
#[derive(Clone)]
pub struct TrunkManager {
    remote: Remote,
    registry: ResourceRegistry,
    trunks: Arc<Mutex<HashMap<ResourceId, Trunk>>>,
}

impl TrunkManager {
    pub fn new(remote: Remote, registry: ResourceRegistry) -> Self {
        Self {
            remote,
            registry,
            trunks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceId, Trunk>> {
        self.trunks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Turn `parent` into the parent port of a new trunk
    pub async fn create_trunk(&self, parent: &Port, name: Option<String>) -> ProvisionResult<Trunk> {
        self.registry.require(ResourceKind::Port, &parent.id)?;
        let request = TrunkRequest {
            port_id: parent.id.clone(),
            name,
        };
        let body = encode(Operation::Create, ResourceKind::Trunk, &request)?;
        let record = self
            .remote
            .call(
                Operation::Create,
                ResourceKind::Trunk,
                &parent.id,
                self.remote.network().create(ResourceKind::Trunk, body),
            )
            .await?;
        let trunk: Trunk = decode(Operation::Create, ResourceKind::Trunk, record)?;
        self.registry.register_id(ResourceKind::Trunk, &trunk.id)?;
        info!("Created trunk {} on parent port {}", trunk.id, parent.id);
        self.lock().insert(trunk.id.clone(), trunk.clone());
        Ok(trunk)
    }

    /// Local checks of a new binding; `port_id` is `None` for a port not created yet
    fn check_binding(
        &self,
        trunk_id: &str,
        network_id: &str,
        port_id: Option<&str>,
        vlan_id: u16,
    ) -> ProvisionResult<()> {
        if !VLAN_RANGE.contains(&vlan_id) {
            return Err(ProvisionError::InvalidVlan { vlan_id });
        }
        let trunks = self.lock();
        if let Some(port_id) = port_id {
            let holder = trunks.values().find(|trunk| {
                trunk.parent_port_id == port_id || trunk.subports.iter().any(|s| s.port_id == port_id)
            });
            if let Some(holder) = holder {
                return Err(ProvisionError::ResourceInUse {
                    kind: ResourceKind::Port,
                    id: port_id.to_string(),
                    holder: holder.id.clone(),
                });
            }
        }
        let trunk = trunks
            .get(trunk_id)
            .ok_or_else(|| ProvisionError::dangling(ResourceKind::Trunk, trunk_id))?;
        if trunk.subports.iter().any(|s| s.segmentation_id == vlan_id) {
            return Err(ProvisionError::VlanCollision {
                trunk: trunk_id.to_string(),
                vlan_id,
            });
        }
        if trunk.parent_network_id == network_id {
            return Err(ProvisionError::SubportNetworkConflict {
                trunk: trunk_id.to_string(),
                network: network_id.to_string(),
            });
        }
        Ok(())
    }

    /// Create a port on `network_id` and bind it to the trunk at `vlan_id`.
    ///
    /// VLAN range, VLAN uniqueness and the parent-network rule are checked
    /// before any remote call. Returns the port and the MAC the guest must
    /// put on its VLAN interface.
    pub async fn add_subport(
        &self,
        topology: &TopologyBuilder,
        trunk_id: &str,
        network_id: &str,
        mut opts: PortOptions,
        vlan_id: u16,
    ) -> ProvisionResult<(Port, MacAddress)> {
        self.check_binding(trunk_id, network_id, None, vlan_id)?;

        let mac = *opts.mac_address.get_or_insert_with(generate_mac);
        let port = topology.create_port(network_id, opts).await?;
        self.bind_port(trunk_id, &port, vlan_id).await?;
        Ok((port, mac))
    }

    /// Bind an existing port to the trunk at `vlan_id`.
    ///
    /// A port already serving as a subport or trunk parent is refused locally.
    pub async fn bind_port(&self, trunk_id: &str, port: &Port, vlan_id: u16) -> ProvisionResult<()> {
        self.check_binding(trunk_id, &port.network_id, Some(&port.id), vlan_id)?;
        let binding = SubportBinding {
            port_id: port.id.clone(),
            segmentation_type: SegmentationType::Vlan,
            segmentation_id: vlan_id,
        };
        let handle = ResourceHandle::subport(trunk_id, &port.id, vlan_id);
        self.remote
            .call(
                Operation::AddSubports,
                ResourceKind::TrunkSubport,
                &handle,
                self.remote.network().add_subports(trunk_id, vec![binding.clone()]),
            )
            .await?;
        self.registry.register(ResourceKind::TrunkSubport, handle)?;
        if let Some(trunk) = self.lock().get_mut(trunk_id) {
            trunk.subports.push(binding);
        }
        info!("Bound port {} to trunk {} on VLAN {}", port.id, trunk_id, vlan_id);
        Ok(())
    }

    /// Unbind a subport. The port itself is left for teardown.
    pub async fn remove_subport(&self, trunk_id: &str, port_id: &str) -> ProvisionResult<()> {
        let vlan_id = self
            .lock()
            .get(trunk_id)
            .and_then(|trunk| trunk.subports.iter().find(|s| s.port_id == port_id))
            .map(|binding| binding.segmentation_id)
            .ok_or_else(|| {
                ProvisionError::dangling(ResourceKind::TrunkSubport, format!("{}<-{}", trunk_id, port_id))
            })?;

        let handle = ResourceHandle::subport(trunk_id, port_id, vlan_id);
        self.remote
            .call(
                Operation::RemoveSubports,
                ResourceKind::TrunkSubport,
                &handle,
                self.remote
                    .network()
                    .remove_subports(trunk_id, vec![port_id.to_string()]),
            )
            .await?;
        if let Some(trunk) = self.lock().get_mut(trunk_id) {
            trunk.subports.retain(|s| s.port_id != port_id);
        }
        debug!("Unbound port {} from trunk {}", port_id, trunk_id);
        Ok(())
    }

    /// Current bindings of a trunk, in binding order
    pub fn subports(&self, trunk_id: &str) -> Vec<SubportBinding> {
        self.lock()
            .get(trunk_id)
            .map(|trunk| trunk.subports.clone())
            .unwrap_or_default()
    }

    pub fn trunk(&self, trunk_id: &str) -> Option<Trunk> {
        self.lock().get(trunk_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cidr::CidrPool;
    use crate::simulator::Simulator;
    use sfcrig_shared::model::{NetworkOptions, SubnetOptions};
    use std::time::Duration;

    struct Fixture {
        sim: Arc<Simulator>,
        topo: TopologyBuilder,
        trunks: TrunkManager,
        trunk: Trunk,
        parent: Port,
        parent_network: String,
        other_network: String,
    }

    async fn fixture() -> Fixture {
        let sim = Arc::new(Simulator::new());
        let remote = Remote::new(sim.clone(), sim.clone(), sim.clone(), Duration::from_secs(1));
        let registry = ResourceRegistry::new();
        let cidrs = CidrPool::isolated("10.60.0.0/24".parse().unwrap(), "fd00:60::/64".parse().unwrap());
        let topo = TopologyBuilder::new(remote.clone(), registry.clone(), cidrs);
        let trunks = TrunkManager::new(remote, registry);

        let (parent_net, _) = topo
            .create_network_and_subnets(NetworkOptions::vlan(), SubnetOptions::default(), 1, false)
            .await
            .unwrap();
        let (other_net, _) = topo
            .create_network_and_subnets(NetworkOptions::vlan(), SubnetOptions::default(), 1, false)
            .await
            .unwrap();
        let parent = topo.create_port(&parent_net.id, PortOptions::insecure()).await.unwrap();
        let trunk = trunks.create_trunk(&parent, None).await.unwrap();
        Fixture {
            sim,
            topo,
            trunks,
            trunk,
            parent,
            parent_network: parent_net.id,
            other_network: other_net.id,
        }
    }

    #[tokio::test]
    async fn test_add_subport_assigns_mac_and_registers_binding() {
        let f = fixture().await;
        let (port, mac) = f
            .trunks
            .add_subport(&f.topo, &f.trunk.id, &f.other_network, PortOptions::insecure(), 10)
            .await
            .unwrap();
        assert_eq!(port.mac_address, mac);
        assert_eq!(mac.bytes()[..3], MAC_PREFIX);
        assert_eq!(f.trunks.subports(&f.trunk.id).len(), 1);
        assert_eq!(
            f.topo.registry().all_of(ResourceKind::TrunkSubport),
            vec![ResourceHandle::subport(&f.trunk.id, &port.id, 10)]
        );
    }

    #[tokio::test]
    async fn test_vlan_collision_makes_no_remote_call() {
        let f = fixture().await;
        f.trunks
            .add_subport(&f.topo, &f.trunk.id, &f.other_network, PortOptions::insecure(), 10)
            .await
            .unwrap();
        let before = f.trunks.subports(&f.trunk.id);
        let calls = f.sim.call_count();

        let err = f
            .trunks
            .add_subport(&f.topo, &f.trunk.id, &f.other_network, PortOptions::insecure(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::VlanCollision { vlan_id: 10, .. }));
        assert_eq!(f.sim.call_count(), calls);
        assert_eq!(f.trunks.subports(&f.trunk.id), before);
    }

    #[tokio::test]
    async fn test_invalid_vlan_and_parent_network() {
        let f = fixture().await;
        for vlan in [0, 4095] {
            assert!(matches!(
                f.trunks
                    .add_subport(&f.topo, &f.trunk.id, &f.other_network, PortOptions::insecure(), vlan)
                    .await,
                Err(ProvisionError::InvalidVlan { .. })
            ));
        }
        assert!(matches!(
            f.trunks
                .add_subport(&f.topo, &f.trunk.id, &f.parent_network, PortOptions::insecure(), 20)
                .await,
            Err(ProvisionError::SubportNetworkConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_bound_port_cannot_be_bound_again() {
        let f = fixture().await;
        let (port, _) = f
            .trunks
            .add_subport(&f.topo, &f.trunk.id, &f.other_network, PortOptions::insecure(), 10)
            .await
            .unwrap();
        let (third_net, _) = f
            .topo
            .create_network_and_subnets(NetworkOptions::vlan(), SubnetOptions::default(), 1, false)
            .await
            .unwrap();
        let second_parent = f.topo.create_port(&third_net.id, PortOptions::insecure()).await.unwrap();
        let second = f.trunks.create_trunk(&second_parent, None).await.unwrap();
        let calls = f.sim.call_count();

        for (trunk_id, vlan) in [(&f.trunk.id, 11), (&second.id, 10)] {
            let err = f.trunks.bind_port(trunk_id, &port, vlan).await.unwrap_err();
            assert!(
                matches!(&err, ProvisionError::ResourceInUse { kind: ResourceKind::Port, holder, .. } if *holder == f.trunk.id)
            );
        }
        assert!(matches!(
            f.trunks.bind_port(&second.id, &f.parent, 12).await,
            Err(ProvisionError::ResourceInUse { .. })
        ));
        assert_eq!(f.sim.call_count(), calls);
        assert!(f.trunks.subports(&second.id).is_empty());
    }

    #[tokio::test]
    async fn test_remove_subport_keeps_port() {
        let f = fixture().await;
        let (port, _) = f
            .trunks
            .add_subport(&f.topo, &f.trunk.id, &f.other_network, PortOptions::insecure(), 30)
            .await
            .unwrap();
        f.trunks.remove_subport(&f.trunk.id, &port.id).await.unwrap();
        assert!(f.trunks.subports(&f.trunk.id).is_empty());
        assert!(f.sim.record_of(ResourceKind::Port, &port.id).is_some());

        // The VLAN is free again once unbound
        f.trunks.bind_port(&f.trunk.id, &port, 30).await.unwrap();
        assert!(matches!(
            f.trunks.remove_subport(&f.trunk.id, "ghost").await,
            Err(ProvisionError::DanglingReference { .. })
        ));
    }
}
