//! Scenario definitions.
//!
//! A scenario is one parameterized provisioning run: which topology to build,
//! how to assemble and mutate the chain, which traffic checks to run between
//! steps. The flow itself lives in the engine; this module only describes the
//! inputs a host framework or a JSON5 file supplies.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::resource::ResourceId;

/// Unique identifier for scenarios
pub type ScenarioId = String;

/// Flow executed by a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Grow a parallel stage by one port pair on a live chain
    SfcAddPortpair,
    /// Remove a whole service stage from a two-stage chain
    SfcRemoveService,
    /// Bind an additional classifier to a live chain
    SfcAddFlowclassifier,
    /// Several single-node stages traversed in series
    SfcMultiSeries,
    /// One stage with several equivalent nodes
    SfcSingleParallel,
    /// VLAN subports attached, validated, moved between trunks
    TrunkSubportLifecycle,
    /// Fabric-facing SVI ports on a BGP-enabled network
    SviUplink,
    /// Per-tenant projects each with their own chain
    MultiTenantSfc,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 8] = [
        ScenarioKind::SfcAddPortpair,
        ScenarioKind::SfcRemoveService,
        ScenarioKind::SfcAddFlowclassifier,
        ScenarioKind::SfcMultiSeries,
        ScenarioKind::SfcSingleParallel,
        ScenarioKind::TrunkSubportLifecycle,
        ScenarioKind::SviUplink,
        ScenarioKind::MultiTenantSfc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScenarioKind::SfcAddPortpair => "sfc-add-portpair",
            ScenarioKind::SfcRemoveService => "sfc-remove-service",
            ScenarioKind::SfcAddFlowclassifier => "sfc-add-flowclassifier",
            ScenarioKind::SfcMultiSeries => "sfc-multi-series",
            ScenarioKind::SfcSingleParallel => "sfc-single-parallel",
            ScenarioKind::TrunkSubportLifecycle => "trunk-subport-lifecycle",
            ScenarioKind::SviUplink => "svi-uplink",
            ScenarioKind::MultiTenantSfc => "multi-tenant-sfc",
        }
    }

    /// Whether the flow builds a service chain
    pub fn uses_chain(self) -> bool {
        !matches!(
            self,
            ScenarioKind::TrunkSubportLifecycle | ScenarioKind::SviUplink
        )
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Login used by the remote-exec orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "cirros".to_string(),
            password: None,
        }
    }
}

/// Flat scenario input parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioParams {
    pub src_cidr: IpNet,
    pub dest_cidr: IpNet,
    pub ipv6_src_cidr: Option<IpNet>,
    pub ipv6_dest_cidr: Option<IpNet>,
    pub dual_stack: bool,
    pub vm_image: String,
    pub service_image: String,
    pub flavor: String,
    /// Pre-existing network used for management access, never torn down
    pub public_network: Option<ResourceId>,
    pub key_name: Option<String>,
    /// Number of service VMs (parallel nodes or series stages)
    pub service_functions: usize,
    /// Networks behind the trunk scenario's subports
    pub trunk_cidrs: Vec<IpNet>,
    /// Fabric nodes receiving an SVI uplink port
    pub fabric_nodes: Vec<String>,
    pub svi_prefix: Option<IpNet>,
    pub bgp_asn: Option<u32>,
    /// Tenant names for the multi-tenant flow
    pub tenants: Vec<String>,
    pub credentials: Credentials,
    /// Addresses pinged from the source VM during traffic validation
    pub probe_addresses: Vec<IpAddr>,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            src_cidr: IpNet::V4("10.0.1.0/24".parse().expect("valid literal")),
            dest_cidr: IpNet::V4("192.168.200.0/24".parse().expect("valid literal")),
            ipv6_src_cidr: None,
            ipv6_dest_cidr: None,
            dual_stack: false,
            vm_image: "cirros".to_string(),
            service_image: "vnf-router".to_string(),
            flavor: "m1.small".to_string(),
            public_network: None,
            key_name: None,
            service_functions: 1,
            trunk_cidrs: Vec::new(),
            fabric_nodes: Vec::new(),
            svi_prefix: None,
            bgp_asn: None,
            tenants: Vec::new(),
            credentials: Credentials::default(),
            probe_addresses: vec![
                "192.168.200.101".parse().expect("valid literal"),
                "192.168.200.102".parse().expect("valid literal"),
                "192.168.200.103".parse().expect("valid literal"),
            ],
        }
    }
}

/// Metadata for scenario organization and searching
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetadata {
    pub tags: Vec<String>,
    pub author: Option<String>,
    pub version: String,
}

/// Full scenario definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub id: ScenarioId,
    pub name: String,
    pub description: String,
    pub kind: ScenarioKind,
    pub params: ScenarioParams,
    /// Wait after chain mutations, for state with no readiness signal
    pub settle_ms: u64,
    pub metadata: ScenarioMetadata,
}

impl ScenarioDefinition {
    /// Validate parameter combinations the selected flow depends on
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Scenario id cannot be empty".to_string());
        }

        let params = &self.params;
        if params.dual_stack && (params.ipv6_src_cidr.is_none() || params.ipv6_dest_cidr.is_none()) {
            return Err("Dual-stack scenarios need ipv6_src_cidr and ipv6_dest_cidr".to_string());
        }
        if let (Some(src), Some(dest)) = (params.ipv6_src_cidr, params.ipv6_dest_cidr) {
            if matches!(src, IpNet::V4(_)) || matches!(dest, IpNet::V4(_)) {
                return Err("IPv6 CIDRs must be IPv6 prefixes".to_string());
            }
        }
        if matches!(params.src_cidr, IpNet::V6(_)) || matches!(params.dest_cidr, IpNet::V6(_)) {
            return Err("src_cidr and dest_cidr must be IPv4 prefixes".to_string());
        }
        if params.src_cidr.contains(&params.dest_cidr) || params.dest_cidr.contains(&params.src_cidr) {
            return Err(format!(
                "Source {} and destination {} overlap",
                params.src_cidr, params.dest_cidr
            ));
        }

        match self.kind {
            ScenarioKind::SfcAddPortpair
            | ScenarioKind::SfcMultiSeries
            | ScenarioKind::SfcSingleParallel
                if params.service_functions == 0 =>
            {
                Err(format!("{} needs at least one service function", self.kind))
            }
            ScenarioKind::TrunkSubportLifecycle if params.trunk_cidrs.len() < 3 => Err(format!(
                "{} needs three trunk_cidrs, got {}",
                self.kind,
                params.trunk_cidrs.len()
            )),
            ScenarioKind::SviUplink if params.fabric_nodes.is_empty() => {
                Err(format!("{} needs at least one fabric node", self.kind))
            }
            ScenarioKind::SviUplink if params.svi_prefix.is_none() => {
                Err(format!("{} needs svi_prefix", self.kind))
            }
            ScenarioKind::MultiTenantSfc if params.tenants.is_empty() => {
                Err(format!("{} needs at least one tenant", self.kind))
            }
            _ => Ok(()),
        }
    }
}
