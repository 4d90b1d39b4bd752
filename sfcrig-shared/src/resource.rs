//! Resource kinds, handles and registry entries.
//!
//! Every remote object a scenario creates is tracked by a `(kind, handle)` pair.
//! Most handles are plain remote identifiers, but router interfaces and trunk
//! subport bindings are relationships rather than objects, so their handles
//! carry both endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ProvisionError;

/// Identifier assigned by the remote control plane
pub type ResourceId = String;

/// Kind of a remote resource tracked for teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    Subnet,
    Router,
    RouterInterface,
    Port,
    Trunk,
    TrunkSubport,
    Server,
    PortPair,
    PortPairGroup,
    FlowClassifier,
    PortChain,
    Project,
    User,
}

impl ResourceKind {
    /// Deletion order used by teardown. A kind is always deleted before
    /// every kind listed after it.
    pub const TEARDOWN_ORDER: [ResourceKind; 14] = [
        ResourceKind::PortChain,
        ResourceKind::PortPairGroup,
        ResourceKind::PortPair,
        ResourceKind::FlowClassifier,
        ResourceKind::TrunkSubport,
        ResourceKind::Server,
        ResourceKind::Trunk,
        ResourceKind::Port,
        ResourceKind::RouterInterface,
        ResourceKind::Router,
        ResourceKind::Subnet,
        ResourceKind::Network,
        ResourceKind::User,
        ResourceKind::Project,
    ];

    /// Position of this kind in [`ResourceKind::TEARDOWN_ORDER`]
    pub fn teardown_rank(self) -> usize {
        Self::TEARDOWN_ORDER
            .iter()
            .position(|kind| *kind == self)
            .unwrap_or(Self::TEARDOWN_ORDER.len())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::Router => "router",
            ResourceKind::RouterInterface => "router_interface",
            ResourceKind::Port => "port",
            ResourceKind::Trunk => "trunk",
            ResourceKind::TrunkSubport => "trunk_subport",
            ResourceKind::Server => "server",
            ResourceKind::PortPair => "port_pair",
            ResourceKind::PortPairGroup => "port_pair_group",
            ResourceKind::FlowClassifier => "flow_classifier",
            ResourceKind::PortChain => "port_chain",
            ResourceKind::Project => "project",
            ResourceKind::User => "user",
        }
    }

    /// Whether resources of this kind are relationships between two objects
    pub fn is_binding(self) -> bool {
        matches!(
            self,
            ResourceKind::RouterInterface | ResourceKind::TrunkSubport
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::TEARDOWN_ORDER
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ProvisionError::UnknownResourceKind(s.to_string()))
    }
}

/// Reference to a created remote resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceHandle {
    /// A standalone object addressed by its id
    Id(ResourceId),
    /// A subnet attached to a router
    RouterInterface {
        router_id: ResourceId,
        subnet_id: ResourceId,
    },
    /// A port bound to a trunk at a VLAN
    Subport {
        trunk_id: ResourceId,
        port_id: ResourceId,
        vlan_id: u16,
    },
}

impl ResourceHandle {
    pub fn id(id: impl Into<ResourceId>) -> Self {
        ResourceHandle::Id(id.into())
    }

    pub fn router_interface(router_id: impl Into<ResourceId>, subnet_id: impl Into<ResourceId>) -> Self {
        ResourceHandle::RouterInterface {
            router_id: router_id.into(),
            subnet_id: subnet_id.into(),
        }
    }

    pub fn subport(trunk_id: impl Into<ResourceId>, port_id: impl Into<ResourceId>, vlan_id: u16) -> Self {
        ResourceHandle::Subport {
            trunk_id: trunk_id.into(),
            port_id: port_id.into(),
            vlan_id,
        }
    }

    /// Remote id for standalone objects
    pub fn as_id(&self) -> Option<&str> {
        match self {
            ResourceHandle::Id(id) => Some(id),
            _ => None,
        }
    }

    /// Whether this handle shape can describe a resource of `kind`
    pub fn fits(&self, kind: ResourceKind) -> bool {
        match self {
            ResourceHandle::Id(id) => !id.is_empty() && !kind.is_binding(),
            ResourceHandle::RouterInterface {
                router_id,
                subnet_id,
            } => kind == ResourceKind::RouterInterface && !router_id.is_empty() && !subnet_id.is_empty(),
            ResourceHandle::Subport {
                trunk_id, port_id, ..
            } => kind == ResourceKind::TrunkSubport && !trunk_id.is_empty() && !port_id.is_empty(),
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceHandle::Id(id) => f.write_str(id),
            ResourceHandle::RouterInterface {
                router_id,
                subnet_id,
            } => write!(f, "{router_id}<-{subnet_id}"),
            ResourceHandle::Subport {
                trunk_id,
                port_id,
                vlan_id,
            } => write!(f, "{trunk_id}[vlan {vlan_id}]<-{port_id}"),
        }
    }
}

/// One line of the resource registry log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub kind: ResourceKind,
    pub handle: ResourceHandle,
    pub creation_order: u64,
}

/// Remote operations the provisioner issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Show,
    Update,
    Delete,
    AddRouterInterface,
    RemoveRouterInterface,
    AddSubports,
    RemoveSubports,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Show => "show",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::AddRouterInterface => "add_router_interface",
            Operation::RemoveRouterInterface => "remove_router_interface",
            Operation::AddSubports => "add_subports",
            Operation::RemoveSubports => "remove_subports",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_order_covers_every_kind_once() {
        let mut kinds = ResourceKind::TEARDOWN_ORDER.to_vec();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), ResourceKind::TEARDOWN_ORDER.len());
    }

    #[test]
    fn test_teardown_rank_follows_dependencies() {
        assert!(ResourceKind::PortChain.teardown_rank() < ResourceKind::PortPairGroup.teardown_rank());
        assert!(ResourceKind::PortPairGroup.teardown_rank() < ResourceKind::PortPair.teardown_rank());
        assert!(ResourceKind::PortPair.teardown_rank() < ResourceKind::Port.teardown_rank());
        assert!(ResourceKind::TrunkSubport.teardown_rank() < ResourceKind::Trunk.teardown_rank());
        assert!(ResourceKind::Trunk.teardown_rank() < ResourceKind::Port.teardown_rank());
        assert!(ResourceKind::RouterInterface.teardown_rank() < ResourceKind::Router.teardown_rank());
        assert!(ResourceKind::Subnet.teardown_rank() < ResourceKind::Network.teardown_rank());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("port_chain".parse::<ResourceKind>().unwrap(), ResourceKind::PortChain);
        assert_eq!("Port-Pair-Group".parse::<ResourceKind>().unwrap(), ResourceKind::PortPairGroup);
        assert!(matches!(
            "floating_ip".parse::<ResourceKind>(),
            Err(ProvisionError::UnknownResourceKind(_))
        ));
    }

    #[test]
    fn test_handle_shapes() {
        assert!(ResourceHandle::id("net-1").fits(ResourceKind::Network));
        assert!(!ResourceHandle::id("").fits(ResourceKind::Network));
        assert!(!ResourceHandle::id("x").fits(ResourceKind::RouterInterface));
        assert!(ResourceHandle::router_interface("r", "s").fits(ResourceKind::RouterInterface));
        assert!(!ResourceHandle::router_interface("r", "s").fits(ResourceKind::Router));
        assert!(ResourceHandle::subport("t", "p", 10).fits(ResourceKind::TrunkSubport));
        assert!(!ResourceHandle::subport("t", "p", 10).fits(ResourceKind::Trunk));
    }
}
