//! Request bodies exchanged with the control plane.
//!
//! Responses decode straight into the types of `sfcrig_shared::model`; only
//! requests whose shape differs from an option type live here.

use ipnet::IpNet;
use mac_address::MacAddress;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use sfcrig_shared::model::{FixedIpRequest, HostRoute, PortOptions};
use sfcrig_shared::resource::ResourceId;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetRequest {
    pub network_id: ResourceId,
    pub cidr: IpNet,
    pub ip_version: u8,
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub host_routes: Vec<HostRoute>,
    #[serde(default = "default_true")]
    pub enable_dhcp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRequest {
    pub network_id: ResourceId,
    pub name: Option<String>,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIpRequest>,
    pub mac_address: Option<MacAddress>,
    pub port_security_enabled: Option<bool>,
    #[serde(default)]
    pub security_groups: Vec<ResourceId>,
    pub device_owner: Option<String>,
}

impl PortRequest {
    pub fn new(network_id: impl Into<ResourceId>, options: PortOptions) -> Self {
        Self {
            network_id: network_id.into(),
            name: options.name,
            fixed_ips: options.fixed_ips,
            mac_address: options.mac_address,
            port_security_enabled: options.port_security_enabled,
            security_groups: options.security_groups,
            device_owner: options.device_owner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrunkRequest {
    pub port_id: ResourceId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPairRequest {
    pub ingress: ResourceId,
    pub egress: ResourceId,
}

/// Create and full-replace body of a port pair group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPairGroupRequest {
    pub port_pairs: Vec<ResourceId>,
}

/// Body of a port chain create or full-replace update; both lists are always sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortChainRequest {
    pub port_pair_groups: Vec<ResourceId>,
    pub flow_classifiers: Vec<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRequest {
    pub name: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRequest {
    pub name: String,
    pub password: Option<String>,
    pub project_id: ResourceId,
    pub domain: String,
    pub role: String,
}
