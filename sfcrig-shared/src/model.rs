//! Typed resource model.
//!
//! These are the local mirrors of remote objects. The remote control plane
//! speaks opaque JSON records; the engine converts between those records and
//! the structs below, filling in whatever the remote side does not echo back.

use ipnet::IpNet;
use mac_address::MacAddress;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::resource::ResourceId;

/// Address family of a subnet, prefix or classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ethertype {
    IPv4,
    IPv6,
}

impl Ethertype {
    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Ethertype::IPv4,
            IpNet::V6(_) => Ethertype::IPv6,
        }
    }

    pub fn of_addr(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Ethertype::IPv4,
            IpAddr::V6(_) => Ethertype::IPv6,
        }
    }

    pub fn ip_version(self) -> u8 {
        match self {
            Ethertype::IPv4 => 4,
            Ethertype::IPv6 => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Ethertype::IPv4 => "IPv4",
            Ethertype::IPv6 => "IPv6",
        }
    }
}

/// Static route pushed to hosts on a subnet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRoute {
    pub destination: IpNet,
    pub nexthop: IpAddr,
}

/// Options for creating a network
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkOptions {
    pub name: Option<String>,
    /// Provider network type, e.g. `vlan`
    pub provider_network_type: Option<String>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub external: bool,
    /// Extension attributes set at creation time (SVI, BGP, DN mappings)
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,
}

impl NetworkOptions {
    /// VLAN-backed tenant network, the default for every scenario
    pub fn vlan() -> Self {
        Self {
            provider_network_type: Some("vlan".to_string()),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }
}

/// Options for creating the subnets of a network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetOptions {
    /// Explicit IPv4 (or single-stack) CIDR; generated when absent
    pub cidr: Option<IpNet>,
    /// Explicit IPv6 CIDR for dual-stack networks; generated when absent
    pub ipv6_cidr: Option<IpNet>,
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub host_routes: Vec<HostRoute>,
    #[serde(default = "default_true")]
    pub enable_dhcp: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SubnetOptions {
    fn default() -> Self {
        Self {
            cidr: None,
            ipv6_cidr: None,
            gateway: None,
            host_routes: Vec::new(),
            enable_dhcp: true,
        }
    }
}

impl SubnetOptions {
    pub fn with_cidr(cidr: IpNet) -> Self {
        Self {
            cidr: Some(cidr),
            ..Self::default()
        }
    }

    pub fn host_route(mut self, destination: IpNet, nexthop: IpAddr) -> Self {
        self.host_routes.push(HostRoute {
            destination,
            nexthop,
        });
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterOptions {
    pub name: Option<String>,
    /// External network used as the router gateway
    pub external_gateway: Option<ResourceId>,
}

/// Fixed IP requested for a new port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIpRequest {
    pub subnet_id: Option<ResourceId>,
    pub ip_address: Option<IpAddr>,
}

/// Options for creating a port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOptions {
    pub name: Option<String>,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIpRequest>,
    pub mac_address: Option<MacAddress>,
    pub port_security_enabled: Option<bool>,
    #[serde(default)]
    pub security_groups: Vec<ResourceId>,
    pub device_owner: Option<String>,
}

impl PortOptions {
    /// Port without anti-spoofing, required for VNF and trunk ports
    pub fn insecure() -> Self {
        Self {
            port_security_enabled: Some(false),
            ..Self::default()
        }
    }

    pub fn with_security_group(mut self, group: impl Into<ResourceId>) -> Self {
        self.security_groups.push(group.into());
        self
    }

    pub fn with_fixed_ip(mut self, subnet_id: Option<ResourceId>, ip_address: IpAddr) -> Self {
        self.fixed_ips.push(FixedIpRequest {
            subnet_id,
            ip_address: Some(ip_address),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub id: ResourceId,
    pub name: String,
    pub cidrs: Vec<IpNet>,
    pub provider_network_type: Option<String>,
    pub external: bool,
    pub subnet_ids: Vec<ResourceId>,
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: ResourceId,
    pub network_id: ResourceId,
    pub cidr: IpNet,
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub host_routes: Vec<HostRoute>,
}

impl Subnet {
    pub fn ethertype(&self) -> Ethertype {
        Ethertype::of(&self.cidr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: ResourceId,
    pub name: String,
    /// Subnets with an interface on this router
    pub interfaces: Vec<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: ResourceId,
    pub ip_address: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: ResourceId,
    pub network_id: ResourceId,
    pub fixed_ips: Vec<FixedIp>,
    pub mac_address: MacAddress,
    pub trunk_id: Option<ResourceId>,
    pub port_security_enabled: bool,
    #[serde(default)]
    pub security_groups: Vec<ResourceId>,
}

impl Port {
    /// First address of the given family
    pub fn address(&self, ethertype: Ethertype) -> Option<IpAddr> {
        self.fixed_ips
            .iter()
            .map(|ip| ip.ip_address)
            .find(|addr| Ethertype::of_addr(addr) == ethertype)
    }

    /// Management address, IPv4 preferred
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.address(Ethertype::IPv4)
            .or_else(|| self.fixed_ips.first().map(|ip| ip.ip_address))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationType {
    Vlan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubportBinding {
    pub port_id: ResourceId,
    pub segmentation_type: SegmentationType,
    pub segmentation_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trunk {
    pub id: ResourceId,
    pub parent_port_id: ResourceId,
    pub parent_network_id: ResourceId,
    pub subports: Vec<SubportBinding>,
}

/// Lifecycle status reported by the compute service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerStatus {
    Build,
    Active,
    Error,
    Deleted,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootRequest {
    pub name: Option<String>,
    pub image: String,
    pub flavor: String,
    /// NICs in attachment order
    pub port_ids: Vec<ResourceId>,
    pub key_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: ResourceId,
    pub name: String,
    pub port_ids: Vec<ResourceId>,
    pub status: ServerStatus,
}

/// One inline traffic-processing instance (chain node)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    pub id: ResourceId,
    pub ingress: ResourceId,
    pub egress: ResourceId,
}

/// Equivalent port pairs at one chain position (chain stage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPairGroup {
    pub id: ResourceId,
    pub port_pairs: Vec<ResourceId>,
}

/// Traffic selection predicate for a flow classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierSpec {
    pub source_prefix: IpNet,
    pub destination_prefix: IpNet,
    pub logical_source_network: ResourceId,
    pub logical_destination_network: ResourceId,
    /// Derived from the prefixes when absent
    pub ethertype: Option<Ethertype>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowClassifier {
    pub id: ResourceId,
    pub source_prefix: IpNet,
    pub destination_prefix: IpNet,
    pub logical_source_network: ResourceId,
    pub logical_destination_network: ResourceId,
    pub ethertype: Ethertype,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortChain {
    pub id: ResourceId,
    pub port_pair_groups: Vec<ResourceId>,
    pub flow_classifiers: Vec<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ResourceId,
    pub name: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: ResourceId,
    pub name: String,
    pub project_id: ResourceId,
    pub role: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_addresses() {
        let port = Port {
            id: "p".to_string(),
            network_id: "n".to_string(),
            fixed_ips: vec![
                FixedIp {
                    subnet_id: "s6".to_string(),
                    ip_address: "2001:db8::5".parse().unwrap(),
                },
                FixedIp {
                    subnet_id: "s4".to_string(),
                    ip_address: "10.0.0.5".parse().unwrap(),
                },
            ],
            mac_address: MacAddress::new([0xfa, 0x16, 0x3e, 0, 0, 1]),
            trunk_id: None,
            port_security_enabled: true,
            security_groups: vec![],
        };
        assert_eq!(port.primary_address(), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(
            port.address(Ethertype::IPv6),
            Some("2001:db8::5".parse().unwrap())
        );
    }

    #[test]
    fn test_server_status_parsing() {
        let status: ServerStatus = serde_json::from_str("\"ACTIVE\"").unwrap();
        assert_eq!(status, ServerStatus::Active);
        let status: ServerStatus = serde_json::from_str("\"SHUTOFF\"").unwrap();
        assert_eq!(status, ServerStatus::Unknown);
    }

    #[test]
    fn test_ethertype_of_prefix() {
        assert_eq!(Ethertype::of(&"10.0.0.0/16".parse().unwrap()), Ethertype::IPv4);
        assert_eq!(Ethertype::of(&"2001:db8::/32".parse().unwrap()), Ethertype::IPv6);
    }
}
