//! In-memory control plane.
//!
//! [`Simulator`] implements every capability trait against local state and
//! enforces the referential rules a real control plane applies: subnets need
//! their network, deletes are refused while something still depends on the
//! object, VLAN ids are unique per trunk, chain objects can only be deleted
//! once nothing references them. It backs the dry-run CLI and every test.
//!
//! Faults and delays can be injected per operation and kind, and every call is
//! recorded so tests can assert that a rejected step made no remote call.

use futures_util::FutureExt;
use ipnet::IpNet;
use mac_address::MacAddress;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

use sfcrig_shared::errors::{RemoteError, RemoteResult};
use sfcrig_shared::model::{
    BootRequest, ClassifierSpec, Ethertype, FixedIp, FlowClassifier, Network, NetworkOptions, Port, PortChain,
    PortPair, PortPairGroup, Project, Router, RouterOptions, SegmentationType, Server, ServerStatus, Subnet,
    SubportBinding, Trunk, User,
};
use sfcrig_shared::resource::{Operation, ResourceKind};

use crate::cidr::{block_size, host_at};
use crate::client::records::{
    PortChainRequest, PortPairGroupRequest, PortPairRequest, PortRequest, ProjectRequest,
    SubnetRequest, TrunkRequest, UserRequest,
};
use crate::client::{ApiFuture, ComputeApi, IdentityApi, NetworkApi};

/// Id of the pre-existing external network
pub const EXTERNAL_NETWORK_ID: &str = "public";
/// Id of the subnet of the pre-existing external network
pub const EXTERNAL_SUBNET_ID: &str = "public-subnet";
const EXTERNAL_CIDR: &str = "172.24.4.0/24";

/// First host offset handed out by the allocator; .1 is the gateway
const FIRST_ALLOCATED_HOST: u128 = 2;

/// One call received by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    pub operation: Operation,
    pub kind: ResourceKind,
    pub target: String,
}

#[derive(Debug, Clone)]
struct Fault {
    operation: Operation,
    kind: ResourceKind,
    target: Option<String>,
    error: RemoteError,
    remaining: Option<u32>,
}

impl Fault {
    fn matches(&self, call: &SimCall) -> bool {
        self.operation == call.operation
            && self.kind == call.kind
            && self.remaining != Some(0)
            && self.target.as_ref().is_none_or(|target| *target == call.target)
    }
}

#[derive(Debug, Clone)]
struct SimServer {
    server: Server,
    polls_until_active: u32,
    polls_until_gone: Option<u32>,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    next_mac: u32,
    networks: BTreeMap<String, Network>,
    subnets: BTreeMap<String, Subnet>,
    allocations: BTreeMap<String, BTreeSet<IpAddr>>,
    routers: BTreeMap<String, Router>,
    ports: BTreeMap<String, Port>,
    port_devices: BTreeMap<String, String>,
    trunks: BTreeMap<String, Trunk>,
    servers: BTreeMap<String, SimServer>,
    port_pairs: BTreeMap<String, PortPair>,
    port_pair_groups: BTreeMap<String, PortPairGroup>,
    flow_classifiers: BTreeMap<String, FlowClassifier>,
    port_chains: BTreeMap<String, PortChain>,
    projects: BTreeMap<String, Project>,
    users: BTreeMap<String, User>,
    preexisting: BTreeSet<String>,
    broken_images: BTreeSet<String>,
    boot_polls: u32,
    delete_polls: u32,
    faults: Vec<Fault>,
    delays: Vec<(Operation, ResourceKind, Duration)>,
    calls: Vec<SimCall>,
    updates: Vec<(ResourceKind, String, Value)>,
}

fn not_found(kind: ResourceKind, id: &str) -> RemoteError {
    RemoteError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn conflict(kind: ResourceKind, message: impl Into<String>) -> RemoteError {
    RemoteError::Conflict {
        kind,
        message: message.into(),
    }
}

fn parse<T: DeserializeOwned>(kind: ResourceKind, body: Value) -> RemoteResult<T> {
    serde_json::from_value(body).map_err(|e| RemoteError::rejected(format!("invalid {} body: {}", kind, e)))
}

fn record<T: Serialize>(value: &T) -> RemoteResult<Value> {
    serde_json::to_value(value).map_err(|e| RemoteError::transport(e.to_string()))
}

impl SimState {
    fn new() -> Self {
        let mut state = SimState {
            boot_polls: 1,
            delete_polls: 1,
            ..SimState::default()
        };
        state.seed_external_network();
        state
    }

    fn seed_external_network(&mut self) {
        let cidr: IpNet = EXTERNAL_CIDR
            .parse()
            .expect("External network prefix is a valid literal");
        self.networks.insert(
            EXTERNAL_NETWORK_ID.to_string(),
            Network {
                id: EXTERNAL_NETWORK_ID.to_string(),
                name: EXTERNAL_NETWORK_ID.to_string(),
                cidrs: vec![cidr],
                provider_network_type: Some("flat".to_string()),
                external: true,
                subnet_ids: vec![EXTERNAL_SUBNET_ID.to_string()],
                extensions: BTreeMap::new(),
            },
        );
        self.subnets.insert(
            EXTERNAL_SUBNET_ID.to_string(),
            Subnet {
                id: EXTERNAL_SUBNET_ID.to_string(),
                network_id: EXTERNAL_NETWORK_ID.to_string(),
                cidr,
                gateway: host_at(&cidr, 1),
                host_routes: Vec::new(),
            },
        );
        self.allocations.insert(EXTERNAL_SUBNET_ID.to_string(), BTreeSet::new());
        self.preexisting.insert(EXTERNAL_NETWORK_ID.to_string());
        self.preexisting.insert(EXTERNAL_SUBNET_ID.to_string());
    }

    fn new_id(&mut self, kind: ResourceKind) -> String {
        self.next_id += 1;
        format!("{}-{}", kind.as_str().replace('_', "-"), self.next_id)
    }

    fn new_mac(&mut self) -> MacAddress {
        self.next_mac += 1;
        let [_, a, b, c] = self.next_mac.to_be_bytes();
        MacAddress::new([0xfa, 0x16, 0x3e, a, b, c])
    }

    // ---- allocation ----

    fn allocate(&mut self, subnet_id: &str, requested: Option<IpAddr>) -> RemoteResult<IpAddr> {
        let subnet = self
            .subnets
            .get(subnet_id)
            .ok_or_else(|| not_found(ResourceKind::Subnet, subnet_id))?;
        let cidr = subnet.cidr;
        let gateway = subnet.gateway;
        let used = self.allocations.entry(subnet_id.to_string()).or_default();

        if let Some(addr) = requested {
            if !cidr.contains(&addr) {
                return Err(RemoteError::rejected(format!(
                    "address {} is outside subnet {} ({})",
                    addr, subnet_id, cidr
                )));
            }
            if used.contains(&addr) || Some(addr) == gateway {
                return Err(conflict(
                    ResourceKind::Port,
                    format!("address {} is already in use on subnet {}", addr, subnet_id),
                ));
            }
            used.insert(addr);
            return Ok(addr);
        }

        let last = block_size(&cidr).saturating_sub(1);
        let mut offset = FIRST_ALLOCATED_HOST;
        while offset < last {
            if let Some(addr) = host_at(&cidr, offset) {
                if !used.contains(&addr) && Some(addr) != gateway {
                    used.insert(addr);
                    return Ok(addr);
                }
            }
            offset += 1;
        }
        Err(conflict(
            ResourceKind::Subnet,
            format!("no addresses left on subnet {}", subnet_id),
        ))
    }

    fn release(&mut self, fixed_ips: &[FixedIp]) {
        for ip in fixed_ips {
            if let Some(used) = self.allocations.get_mut(&ip.subnet_id) {
                used.remove(&ip.ip_address);
            }
        }
    }

    // ---- create ----

    fn create(&mut self, kind: ResourceKind, body: Value) -> RemoteResult<Value> {
        match kind {
            ResourceKind::Network => self.create_network(parse(kind, body)?),
            ResourceKind::Subnet => self.create_subnet(parse(kind, body)?),
            ResourceKind::Router => self.create_router(parse(kind, body)?),
            ResourceKind::Port => self.create_port(parse(kind, body)?),
            ResourceKind::Trunk => self.create_trunk(parse(kind, body)?),
            ResourceKind::PortPair => self.create_port_pair(parse(kind, body)?),
            ResourceKind::PortPairGroup => self.create_port_pair_group(parse(kind, body)?),
            ResourceKind::FlowClassifier => self.create_flow_classifier(parse(kind, body)?),
            ResourceKind::PortChain => self.create_port_chain(parse(kind, body)?),
            other => Err(RemoteError::rejected(format!(
                "{} cannot be created through the network service",
                other
            ))),
        }
    }

    fn create_network(&mut self, options: NetworkOptions) -> RemoteResult<Value> {
        let id = self.new_id(ResourceKind::Network);
        let network = Network {
            name: options.name.unwrap_or_else(|| id.clone()),
            id: id.clone(),
            cidrs: Vec::new(),
            provider_network_type: options.provider_network_type,
            external: options.external,
            subnet_ids: Vec::new(),
            extensions: options.extensions,
        };
        let value = record(&network)?;
        self.networks.insert(id, network);
        Ok(value)
    }

    fn create_subnet(&mut self, request: SubnetRequest) -> RemoteResult<Value> {
        let network = self
            .networks
            .get(&request.network_id)
            .ok_or_else(|| not_found(ResourceKind::Network, &request.network_id))?;
        if request.ip_version != Ethertype::of(&request.cidr).ip_version() {
            return Err(RemoteError::rejected(format!(
                "ip_version {} does not match {}",
                request.ip_version, request.cidr
            )));
        }
        if let Some(existing) = network
            .cidrs
            .iter()
            .find(|cidr| cidr.contains(&request.cidr) || request.cidr.contains(*cidr))
        {
            return Err(conflict(
                ResourceKind::Subnet,
                format!("{} overlaps {} on network {}", request.cidr, existing, network.id),
            ));
        }
        if let Some(gateway) = request.gateway {
            if !request.cidr.contains(&gateway) {
                return Err(RemoteError::rejected(format!(
                    "gateway {} is outside {}",
                    gateway, request.cidr
                )));
            }
        }

        let id = self.new_id(ResourceKind::Subnet);
        let subnet = Subnet {
            id: id.clone(),
            network_id: request.network_id.clone(),
            cidr: request.cidr,
            gateway: request.gateway.or_else(|| host_at(&request.cidr, 1)),
            host_routes: request.host_routes,
        };
        let value = record(&subnet)?;
        if let Some(network) = self.networks.get_mut(&request.network_id) {
            network.cidrs.push(request.cidr);
            network.subnet_ids.push(id.clone());
        }
        self.allocations.insert(id.clone(), BTreeSet::new());
        self.subnets.insert(id, subnet);
        Ok(value)
    }

    fn create_router(&mut self, options: RouterOptions) -> RemoteResult<Value> {
        if let Some(gateway) = &options.external_gateway {
            let network = self
                .networks
                .get(gateway)
                .ok_or_else(|| not_found(ResourceKind::Network, gateway))?;
            if !network.external {
                return Err(RemoteError::rejected(format!(
                    "network {} is not external",
                    gateway
                )));
            }
        }
        let id = self.new_id(ResourceKind::Router);
        let router = Router {
            name: options.name.unwrap_or_else(|| id.clone()),
            id: id.clone(),
            interfaces: Vec::new(),
        };
        let value = record(&router)?;
        self.routers.insert(id, router);
        Ok(value)
    }

    fn create_port(&mut self, request: PortRequest) -> RemoteResult<Value> {
        let network = self
            .networks
            .get(&request.network_id)
            .ok_or_else(|| not_found(ResourceKind::Network, &request.network_id))?;
        let subnet_ids = network.subnet_ids.clone();

        let port_security_enabled = request.port_security_enabled.unwrap_or(true);
        if !port_security_enabled && !request.security_groups.is_empty() {
            return Err(RemoteError::rejected(
                "security groups require port security".to_string(),
            ));
        }
        if let Some(mac) = request.mac_address {
            let taken = self
                .ports
                .values()
                .any(|port| port.network_id == request.network_id && port.mac_address == mac);
            if taken {
                return Err(conflict(
                    ResourceKind::Port,
                    format!("MAC {} is already in use on network {}", mac, request.network_id),
                ));
            }
        }

        let mut wanted: Vec<(String, Option<IpAddr>)> = Vec::new();
        if request.fixed_ips.is_empty() {
            wanted.extend(subnet_ids.iter().map(|id| (id.clone(), None)));
        } else {
            for fixed in &request.fixed_ips {
                let subnet_id = match (&fixed.subnet_id, fixed.ip_address) {
                    (Some(id), _) => {
                        if !subnet_ids.contains(id) {
                            return Err(not_found(ResourceKind::Subnet, id));
                        }
                        id.clone()
                    }
                    (None, Some(addr)) => subnet_ids
                        .iter()
                        .find(|id| self.subnets.get(*id).is_some_and(|s| s.cidr.contains(&addr)))
                        .cloned()
                        .ok_or_else(|| {
                            RemoteError::rejected(format!(
                                "no subnet on network {} holds {}",
                                request.network_id, addr
                            ))
                        })?,
                    (None, None) => {
                        return Err(RemoteError::rejected(
                            "fixed IP request needs a subnet or an address".to_string(),
                        ));
                    }
                };
                wanted.push((subnet_id, fixed.ip_address));
            }
        }

        let mut fixed_ips = Vec::with_capacity(wanted.len());
        for (subnet_id, requested) in wanted {
            match self.allocate(&subnet_id, requested) {
                Ok(ip_address) => fixed_ips.push(FixedIp {
                    subnet_id,
                    ip_address,
                }),
                Err(err) => {
                    self.release(&fixed_ips);
                    return Err(err);
                }
            }
        }

        let id = self.new_id(ResourceKind::Port);
        let mac_address = match request.mac_address {
            Some(mac) => mac,
            None => self.new_mac(),
        };
        let port = Port {
            id: id.clone(),
            network_id: request.network_id,
            fixed_ips,
            mac_address,
            trunk_id: None,
            port_security_enabled,
            security_groups: request.security_groups,
        };
        let value = record(&port)?;
        self.ports.insert(id, port);
        Ok(value)
    }

    fn create_trunk(&mut self, request: TrunkRequest) -> RemoteResult<Value> {
        let port = self
            .ports
            .get(&request.port_id)
            .ok_or_else(|| not_found(ResourceKind::Port, &request.port_id))?;
        if let Some(trunk_id) = &port.trunk_id {
            return Err(conflict(
                ResourceKind::Trunk,
                format!("port {} already belongs to trunk {}", port.id, trunk_id),
            ));
        }
        let parent_network_id = port.network_id.clone();

        let id = self.new_id(ResourceKind::Trunk);
        let trunk = Trunk {
            id: id.clone(),
            parent_port_id: request.port_id.clone(),
            parent_network_id,
            subports: Vec::new(),
        };
        let value = record(&trunk)?;
        if let Some(port) = self.ports.get_mut(&request.port_id) {
            port.trunk_id = Some(id.clone());
        }
        self.trunks.insert(id, trunk);
        Ok(value)
    }

    fn create_port_pair(&mut self, request: PortPairRequest) -> RemoteResult<Value> {
        for port_id in [&request.ingress, &request.egress] {
            if !self.ports.contains_key(port_id) {
                return Err(not_found(ResourceKind::Port, port_id));
            }
        }
        let id = self.new_id(ResourceKind::PortPair);
        let pair = PortPair {
            id: id.clone(),
            ingress: request.ingress,
            egress: request.egress,
        };
        let value = record(&pair)?;
        self.port_pairs.insert(id, pair);
        Ok(value)
    }

    fn check_group_members(&self, group_id: Option<&str>, port_pairs: &[String]) -> RemoteResult<()> {
        if port_pairs.is_empty() {
            return Err(RemoteError::rejected(
                "port pair group needs at least one port pair".to_string(),
            ));
        }
        for pair_id in port_pairs {
            if !self.port_pairs.contains_key(pair_id) {
                return Err(not_found(ResourceKind::PortPair, pair_id));
            }
            let owner = self
                .port_pair_groups
                .values()
                .find(|group| Some(group.id.as_str()) != group_id && group.port_pairs.contains(pair_id));
            if let Some(owner) = owner {
                return Err(conflict(
                    ResourceKind::PortPair,
                    format!("port pair {} is already in group {}", pair_id, owner.id),
                ));
            }
        }
        Ok(())
    }

    fn create_port_pair_group(&mut self, request: PortPairGroupRequest) -> RemoteResult<Value> {
        self.check_group_members(None, &request.port_pairs)?;
        let id = self.new_id(ResourceKind::PortPairGroup);
        let group = PortPairGroup {
            id: id.clone(),
            port_pairs: request.port_pairs,
        };
        let value = record(&group)?;
        self.port_pair_groups.insert(id, group);
        Ok(value)
    }

    fn create_flow_classifier(&mut self, spec: ClassifierSpec) -> RemoteResult<Value> {
        let source_type = Ethertype::of(&spec.source_prefix);
        let ethertype = spec.ethertype.unwrap_or(source_type);
        if source_type != ethertype || Ethertype::of(&spec.destination_prefix) != ethertype {
            return Err(RemoteError::rejected(format!(
                "prefixes {} and {} do not match ethertype {}",
                spec.source_prefix,
                spec.destination_prefix,
                ethertype.as_str()
            )));
        }
        for network_id in [&spec.logical_source_network, &spec.logical_destination_network] {
            if !self.networks.contains_key(network_id) {
                return Err(not_found(ResourceKind::Network, network_id));
            }
        }
        let id = self.new_id(ResourceKind::FlowClassifier);
        let classifier = FlowClassifier {
            id: id.clone(),
            source_prefix: spec.source_prefix,
            destination_prefix: spec.destination_prefix,
            logical_source_network: spec.logical_source_network,
            logical_destination_network: spec.logical_destination_network,
            ethertype,
        };
        let value = record(&classifier)?;
        self.flow_classifiers.insert(id, classifier);
        Ok(value)
    }

    fn check_chain_members(&self, chain_id: Option<&str>, groups: &[String], classifiers: &[String]) -> RemoteResult<()> {
        if groups.is_empty() {
            return Err(RemoteError::rejected(
                "port chain needs at least one port pair group".to_string(),
            ));
        }
        let others = move || {
            self.port_chains
                .values()
                .filter(move |chain| Some(chain.id.as_str()) != chain_id)
        };
        for group_id in groups {
            if !self.port_pair_groups.contains_key(group_id) {
                return Err(not_found(ResourceKind::PortPairGroup, group_id));
            }
            if let Some(owner) = others().find(|chain| chain.port_pair_groups.contains(group_id)) {
                return Err(conflict(
                    ResourceKind::PortPairGroup,
                    format!("group {} is already in chain {}", group_id, owner.id),
                ));
            }
        }
        for classifier_id in classifiers {
            if !self.flow_classifiers.contains_key(classifier_id) {
                return Err(not_found(ResourceKind::FlowClassifier, classifier_id));
            }
            if let Some(owner) = others().find(|chain| chain.flow_classifiers.contains(classifier_id)) {
                return Err(conflict(
                    ResourceKind::FlowClassifier,
                    format!("classifier {} is already in chain {}", classifier_id, owner.id),
                ));
            }
        }
        Ok(())
    }

    fn create_port_chain(&mut self, request: PortChainRequest) -> RemoteResult<Value> {
        self.check_chain_members(None, &request.port_pair_groups, &request.flow_classifiers)?;
        let id = self.new_id(ResourceKind::PortChain);
        let chain = PortChain {
            id: id.clone(),
            port_pair_groups: request.port_pair_groups,
            flow_classifiers: request.flow_classifiers,
        };
        let value = record(&chain)?;
        self.port_chains.insert(id, chain);
        Ok(value)
    }

    // ---- show / update ----

    fn show(&self, kind: ResourceKind, id: &str) -> RemoteResult<Value> {
        let found = match kind {
            ResourceKind::Network => self.networks.get(id).map(record),
            ResourceKind::Subnet => self.subnets.get(id).map(record),
            ResourceKind::Router => self.routers.get(id).map(record),
            ResourceKind::Port => self.ports.get(id).map(record),
            ResourceKind::Trunk => self.trunks.get(id).map(record),
            ResourceKind::PortPair => self.port_pairs.get(id).map(record),
            ResourceKind::PortPairGroup => self.port_pair_groups.get(id).map(record),
            ResourceKind::FlowClassifier => self.flow_classifiers.get(id).map(record),
            ResourceKind::PortChain => self.port_chains.get(id).map(record),
            ResourceKind::Project => self.projects.get(id).map(record),
            ResourceKind::User => self.users.get(id).map(record),
            other => {
                return Err(RemoteError::rejected(format!(
                    "{} cannot be shown through the network service",
                    other
                )));
            }
        };
        found.unwrap_or_else(|| Err(not_found(kind, id)))
    }

    fn update(&mut self, kind: ResourceKind, id: &str, body: Value) -> RemoteResult<Value> {
        match kind {
            ResourceKind::PortPairGroup => {
                let request: PortPairGroupRequest = parse(kind, body)?;
                if !self.port_pair_groups.contains_key(id) {
                    return Err(not_found(kind, id));
                }
                self.check_group_members(Some(id), &request.port_pairs)?;
                let group = self
                    .port_pair_groups
                    .get_mut(id)
                    .ok_or_else(|| not_found(kind, id))?;
                group.port_pairs = request.port_pairs;
                record(group)
            }
            ResourceKind::PortChain => {
                let request: PortChainRequest = parse(kind, body)?;
                if !self.port_chains.contains_key(id) {
                    return Err(not_found(kind, id));
                }
                self.check_chain_members(Some(id), &request.port_pair_groups, &request.flow_classifiers)?;
                let chain = self.port_chains.get_mut(id).ok_or_else(|| not_found(kind, id))?;
                chain.port_pair_groups = request.port_pair_groups;
                chain.flow_classifiers = request.flow_classifiers;
                record(chain)
            }
            other => Err(RemoteError::rejected(format!(
                "updating {} is not supported",
                other
            ))),
        }
    }

    // ---- delete ----

    fn delete(&mut self, kind: ResourceKind, id: &str) -> RemoteResult<()> {
        if self.preexisting.contains(id) {
            return Err(RemoteError::rejected(format!("{} {} is not owned by this tenant", kind, id)));
        }
        match kind {
            ResourceKind::Network => {
                let network = self.networks.get(id).ok_or_else(|| not_found(kind, id))?;
                if !network.subnet_ids.is_empty() {
                    return Err(conflict(kind, format!("network {} still has subnets", id)));
                }
                if self.ports.values().any(|port| port.network_id == id) {
                    return Err(conflict(kind, format!("network {} still has ports", id)));
                }
                self.networks.remove(id);
            }
            ResourceKind::Subnet => {
                let subnet = self.subnets.get(id).ok_or_else(|| not_found(kind, id))?;
                if let Some(router) = self.routers.values().find(|r| r.interfaces.iter().any(|s| s == id)) {
                    return Err(conflict(
                        kind,
                        format!("subnet {} has an interface on router {}", id, router.id),
                    ));
                }
                if self
                    .ports
                    .values()
                    .any(|port| port.fixed_ips.iter().any(|ip| ip.subnet_id == id))
                {
                    return Err(conflict(kind, format!("subnet {} still has allocated addresses", id)));
                }
                let network_id = subnet.network_id.clone();
                let cidr = subnet.cidr;
                if let Some(network) = self.networks.get_mut(&network_id) {
                    network.subnet_ids.retain(|s| s != id);
                    network.cidrs.retain(|c| *c != cidr);
                }
                self.allocations.remove(id);
                self.subnets.remove(id);
            }
            ResourceKind::Router => {
                let router = self.routers.get(id).ok_or_else(|| not_found(kind, id))?;
                if !router.interfaces.is_empty() {
                    return Err(conflict(kind, format!("router {} still has interfaces", id)));
                }
                self.routers.remove(id);
            }
            ResourceKind::Port => {
                let port = self.ports.get(id).ok_or_else(|| not_found(kind, id))?;
                if let Some(trunk_id) = &port.trunk_id {
                    if self.trunks.contains_key(trunk_id) {
                        return Err(conflict(kind, format!("port {} is in use by trunk {}", id, trunk_id)));
                    }
                }
                if let Some(server) = self.port_devices.get(id) {
                    return Err(conflict(kind, format!("port {} is attached to server {}", id, server)));
                }
                if let Some(pair) = self
                    .port_pairs
                    .values()
                    .find(|pair| pair.ingress == id || pair.egress == id)
                {
                    return Err(conflict(kind, format!("port {} is used by port pair {}", id, pair.id)));
                }
                let fixed_ips = port.fixed_ips.clone();
                self.release(&fixed_ips);
                self.ports.remove(id);
            }
            ResourceKind::Trunk => {
                let trunk = self.trunks.get(id).ok_or_else(|| not_found(kind, id))?;
                if !trunk.subports.is_empty() {
                    return Err(conflict(kind, format!("trunk {} still has subports", id)));
                }
                if let Some(server) = self.port_devices.get(&trunk.parent_port_id) {
                    return Err(conflict(kind, format!("trunk {} is in use by server {}", id, server)));
                }
                let parent = trunk.parent_port_id.clone();
                if let Some(port) = self.ports.get_mut(&parent) {
                    port.trunk_id = None;
                }
                self.trunks.remove(id);
            }
            ResourceKind::PortPair => {
                if !self.port_pairs.contains_key(id) {
                    return Err(not_found(kind, id));
                }
                if let Some(group) = self.port_pair_groups.values().find(|g| g.port_pairs.iter().any(|p| p == id)) {
                    return Err(conflict(kind, format!("port pair {} is in group {}", id, group.id)));
                }
                self.port_pairs.remove(id);
            }
            ResourceKind::PortPairGroup => {
                if !self.port_pair_groups.contains_key(id) {
                    return Err(not_found(kind, id));
                }
                if let Some(chain) = self.port_chains.values().find(|c| c.port_pair_groups.iter().any(|g| g == id)) {
                    return Err(conflict(kind, format!("group {} is in chain {}", id, chain.id)));
                }
                self.port_pair_groups.remove(id);
            }
            ResourceKind::FlowClassifier => {
                if !self.flow_classifiers.contains_key(id) {
                    return Err(not_found(kind, id));
                }
                if let Some(chain) = self.port_chains.values().find(|c| c.flow_classifiers.iter().any(|f| f == id)) {
                    return Err(conflict(kind, format!("classifier {} is in chain {}", id, chain.id)));
                }
                self.flow_classifiers.remove(id);
            }
            ResourceKind::PortChain => {
                self.port_chains.remove(id).ok_or_else(|| not_found(kind, id))?;
            }
            other => {
                return Err(RemoteError::rejected(format!(
                    "{} cannot be deleted through the network service",
                    other
                )));
            }
        }
        Ok(())
    }

    // ---- router interfaces and trunks ----

    fn add_router_interface(&mut self, router_id: &str, subnet_id: &str) -> RemoteResult<()> {
        let router = self
            .routers
            .get(router_id)
            .ok_or_else(|| not_found(ResourceKind::Router, router_id))?;
        let subnet = self
            .subnets
            .get(subnet_id)
            .ok_or_else(|| not_found(ResourceKind::Subnet, subnet_id))?;
        if let Some(owner) = self
            .routers
            .values()
            .find(|r| r.interfaces.iter().any(|s| s == subnet_id))
        {
            return Err(conflict(
                ResourceKind::RouterInterface,
                format!("subnet {} already has an interface on router {}", subnet_id, owner.id),
            ));
        }
        let overlapping = router.interfaces.iter().find_map(|attached| {
            self.subnets
                .get(attached)
                .filter(|other| other.cidr.contains(&subnet.cidr) || subnet.cidr.contains(&other.cidr))
        });
        if let Some(other) = overlapping {
            return Err(conflict(
                ResourceKind::RouterInterface,
                format!("{} overlaps {} on router {}", subnet.cidr, other.cidr, router_id),
            ));
        }
        if let Some(router) = self.routers.get_mut(router_id) {
            router.interfaces.push(subnet_id.to_string());
        }
        Ok(())
    }

    fn remove_router_interface(&mut self, router_id: &str, subnet_id: &str) -> RemoteResult<()> {
        let router = self
            .routers
            .get_mut(router_id)
            .ok_or_else(|| not_found(ResourceKind::Router, router_id))?;
        let before = router.interfaces.len();
        router.interfaces.retain(|s| s != subnet_id);
        if router.interfaces.len() == before {
            return Err(not_found(
                ResourceKind::RouterInterface,
                &format!("{}<-{}", router_id, subnet_id),
            ));
        }
        Ok(())
    }

    fn add_subports(&mut self, trunk_id: &str, subports: Vec<SubportBinding>) -> RemoteResult<Value> {
        let trunk = self
            .trunks
            .get(trunk_id)
            .ok_or_else(|| not_found(ResourceKind::Trunk, trunk_id))?;
        let mut vlans: BTreeSet<u16> = trunk.subports.iter().map(|s| s.segmentation_id).collect();
        for binding in &subports {
            if binding.segmentation_type != SegmentationType::Vlan || !(1..=4094).contains(&binding.segmentation_id) {
                return Err(RemoteError::rejected(format!(
                    "invalid segmentation id {}",
                    binding.segmentation_id
                )));
            }
            let port = self
                .ports
                .get(&binding.port_id)
                .ok_or_else(|| not_found(ResourceKind::Port, &binding.port_id))?;
            if let Some(owner) = &port.trunk_id {
                return Err(conflict(
                    ResourceKind::TrunkSubport,
                    format!("port {} already belongs to trunk {}", port.id, owner),
                ));
            }
            if port.network_id == trunk.parent_network_id {
                return Err(RemoteError::rejected(format!(
                    "subport {} is on the parent network {}",
                    port.id, trunk.parent_network_id
                )));
            }
            if !vlans.insert(binding.segmentation_id) {
                return Err(conflict(
                    ResourceKind::TrunkSubport,
                    format!("VLAN {} is already in use on trunk {}", binding.segmentation_id, trunk_id),
                ));
            }
        }

        for binding in &subports {
            if let Some(port) = self.ports.get_mut(&binding.port_id) {
                port.trunk_id = Some(trunk_id.to_string());
            }
        }
        let trunk = self
            .trunks
            .get_mut(trunk_id)
            .ok_or_else(|| not_found(ResourceKind::Trunk, trunk_id))?;
        trunk.subports.extend(subports);
        record(trunk)
    }

    fn remove_subports(&mut self, trunk_id: &str, port_ids: Vec<String>) -> RemoteResult<Value> {
        let trunk = self
            .trunks
            .get(trunk_id)
            .ok_or_else(|| not_found(ResourceKind::Trunk, trunk_id))?;
        for port_id in &port_ids {
            if !trunk.subports.iter().any(|s| s.port_id == *port_id) {
                return Err(not_found(
                    ResourceKind::TrunkSubport,
                    &format!("{}<-{}", trunk_id, port_id),
                ));
            }
        }
        for port_id in &port_ids {
            if let Some(port) = self.ports.get_mut(port_id) {
                port.trunk_id = None;
            }
        }
        let trunk = self
            .trunks
            .get_mut(trunk_id)
            .ok_or_else(|| not_found(ResourceKind::Trunk, trunk_id))?;
        trunk.subports.retain(|s| !port_ids.contains(&s.port_id));
        record(trunk)
    }

    // ---- compute ----

    fn boot(&mut self, request: BootRequest) -> RemoteResult<Value> {
        if request.image.is_empty() || request.flavor.is_empty() {
            return Err(RemoteError::rejected("image and flavor are required".to_string()));
        }
        if request.port_ids.is_empty() {
            return Err(RemoteError::rejected("server needs at least one port".to_string()));
        }
        for port_id in &request.port_ids {
            if !self.ports.contains_key(port_id) {
                return Err(not_found(ResourceKind::Port, port_id));
            }
            if let Some(owner) = self.port_devices.get(port_id) {
                return Err(conflict(
                    ResourceKind::Server,
                    format!("port {} is already attached to server {}", port_id, owner),
                ));
            }
        }

        let id = self.new_id(ResourceKind::Server);
        let broken = self.broken_images.contains(&request.image);
        let server = Server {
            id: id.clone(),
            name: request.name.unwrap_or_else(|| id.clone()),
            port_ids: request.port_ids.clone(),
            status: ServerStatus::Build,
        };
        let value = record(&server)?;
        for port_id in &request.port_ids {
            self.port_devices.insert(port_id.clone(), id.clone());
        }
        let polls_until_active = if broken { 0 } else { self.boot_polls };
        let mut sim_server = SimServer {
            server,
            polls_until_active,
            polls_until_gone: None,
        };
        if broken {
            sim_server.server.status = ServerStatus::Error;
        }
        self.servers.insert(id, sim_server);
        Ok(value)
    }

    fn show_server(&mut self, id: &str) -> RemoteResult<Value> {
        let entry = self
            .servers
            .get_mut(id)
            .ok_or_else(|| not_found(ResourceKind::Server, id))?;

        if let Some(remaining) = entry.polls_until_gone {
            if remaining == 0 {
                let port_ids = entry.server.port_ids.clone();
                self.servers.remove(id);
                for port_id in port_ids {
                    self.port_devices.remove(&port_id);
                }
                return Err(not_found(ResourceKind::Server, id));
            }
            entry.polls_until_gone = Some(remaining - 1);
            entry.server.status = ServerStatus::Deleted;
        } else if entry.server.status == ServerStatus::Build {
            if entry.polls_until_active == 0 {
                entry.server.status = ServerStatus::Active;
            } else {
                entry.polls_until_active -= 1;
            }
        }
        record(&entry.server)
    }

    fn delete_server(&mut self, id: &str) -> RemoteResult<()> {
        let delete_polls = self.delete_polls;
        let entry = self
            .servers
            .get_mut(id)
            .ok_or_else(|| not_found(ResourceKind::Server, id))?;
        if entry.polls_until_gone.is_none() {
            entry.polls_until_gone = Some(delete_polls);
        }
        Ok(())
    }

    // ---- identity ----

    fn create_project(&mut self, request: ProjectRequest) -> RemoteResult<Value> {
        if self.projects.values().any(|p| p.name == request.name && p.domain == request.domain) {
            return Err(conflict(
                ResourceKind::Project,
                format!("project {} already exists in domain {}", request.name, request.domain),
            ));
        }
        let id = self.new_id(ResourceKind::Project);
        let project = Project {
            id: id.clone(),
            name: request.name,
            domain: request.domain,
        };
        let value = record(&project)?;
        self.projects.insert(id, project);
        Ok(value)
    }

    fn create_user(&mut self, request: UserRequest) -> RemoteResult<Value> {
        if !self.projects.contains_key(&request.project_id) {
            return Err(not_found(ResourceKind::Project, &request.project_id));
        }
        let id = self.new_id(ResourceKind::User);
        let user = User {
            id: id.clone(),
            name: request.name,
            project_id: request.project_id,
            role: request.role,
        };
        let value = record(&user)?;
        self.users.insert(id, user);
        Ok(value)
    }

    fn delete_project(&mut self, id: &str) -> RemoteResult<()> {
        if !self.projects.contains_key(id) {
            return Err(not_found(ResourceKind::Project, id));
        }
        if self.users.values().any(|u| u.project_id == id) {
            return Err(conflict(
                ResourceKind::Project,
                format!("project {} still has users", id),
            ));
        }
        self.projects.remove(id);
        Ok(())
    }

    fn delete_user(&mut self, id: &str) -> RemoteResult<()> {
        self.users
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found(ResourceKind::User, id))
    }

    fn live_count(&self) -> usize {
        let owned = |id: &String| !self.preexisting.contains(id);
        self.networks.keys().filter(|id| owned(id)).count()
            + self.subnets.keys().filter(|id| owned(id)).count()
            + self.routers.len()
            + self.routers.values().map(|r| r.interfaces.len()).sum::<usize>()
            + self.ports.len()
            + self.trunks.len()
            + self.trunks.values().map(|t| t.subports.len()).sum::<usize>()
            + self.servers.len()
            + self.port_pairs.len()
            + self.port_pair_groups.len()
            + self.flow_classifiers.len()
            + self.port_chains.len()
            + self.projects.len()
            + self.users.len()
    }
}

/// In-memory control plane implementing every capability trait
#[derive(Debug)]
pub struct Simulator {
    state: Mutex<SimState>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of status polls a new server stays in BUILD
    pub fn with_boot_polls(self, polls: u32) -> Self {
        self.lock().boot_polls = polls;
        self
    }

    /// Number of status polls a deleted server stays visible
    pub fn with_delete_polls(self, polls: u32) -> Self {
        self.lock().delete_polls = polls;
        self
    }

    /// Servers booted from this image go to ERROR
    pub fn mark_image_broken(&self, image: &str) {
        self.lock().broken_images.insert(image.to_string());
    }

    /// Fail the next matching call once
    pub fn fail_next(&self, operation: Operation, kind: ResourceKind, error: RemoteError) {
        self.lock().faults.push(Fault {
            operation,
            kind,
            target: None,
            error,
            remaining: Some(1),
        });
    }

    /// Fail every matching call on one target
    pub fn fail_target(&self, operation: Operation, kind: ResourceKind, target: &str, error: RemoteError) {
        self.lock().faults.push(Fault {
            operation,
            kind,
            target: Some(target.to_string()),
            error,
            remaining: None,
        });
    }

    /// Drop every injected fault
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Hold every matching call for `duration` before answering
    pub fn delay(&self, operation: Operation, kind: ResourceKind, duration: Duration) {
        self.lock().delays.push((operation, kind, duration));
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<SimCall> {
        self.lock().calls.clone()
    }

    /// Bodies of accepted update calls for one kind, oldest first
    pub fn update_bodies(&self, kind: ResourceKind) -> Vec<(String, Value)> {
        self.lock()
            .updates
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, id, body)| (id.clone(), body.clone()))
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Resources and bindings alive besides the pre-existing external network
    pub fn live_count(&self) -> usize {
        self.lock().live_count()
    }

    /// Raw record of a live object
    pub fn record_of(&self, kind: ResourceKind, id: &str) -> Option<Value> {
        let state = self.lock();
        match kind {
            ResourceKind::Server => state.servers.get(id).and_then(|s| record(&s.server).ok()),
            other => state.show(other, id).ok(),
        }
    }

    async fn enter(&self, operation: Operation, kind: ResourceKind, target: &str) -> RemoteResult<()> {
        let call = SimCall {
            operation,
            kind,
            target: target.to_string(),
        };
        let (fault, delay) = {
            let mut state = self.lock();
            trace!("Simulator call {} {} {}", operation, kind, target);
            let fault = state.faults.iter_mut().find(|f| f.matches(&call)).map(|fault| {
                if let Some(remaining) = fault.remaining.as_mut() {
                    *remaining -= 1;
                }
                fault.error.clone()
            });
            state.faults.retain(|f| f.remaining != Some(0));
            let delay = state
                .delays
                .iter()
                .find(|(op, k, _)| *op == operation && *k == kind)
                .map(|(_, _, d)| *d);
            state.calls.push(call);
            (fault, delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match fault {
            Some(error) => {
                debug!("Injected fault on {} {} {}: {}", operation, kind, target, error);
                Err(error)
            }
            None => Ok(()),
        }
    }
}

impl NetworkApi for Simulator {
    fn create<'a>(&'a self, kind: ResourceKind, body: Value) -> ApiFuture<'a, Value> {
        async move {
            self.enter(Operation::Create, kind, "").await?;
            self.lock().create(kind, body)
        }
        .boxed()
    }

    fn show<'a>(&'a self, kind: ResourceKind, id: &'a str) -> ApiFuture<'a, Value> {
        async move {
            self.enter(Operation::Show, kind, id).await?;
            self.lock().show(kind, id)
        }
        .boxed()
    }

    fn update<'a>(&'a self, kind: ResourceKind, id: &'a str, body: Value) -> ApiFuture<'a, Value> {
        async move {
            self.enter(Operation::Update, kind, id).await?;
            let mut state = self.lock();
            let record = state.update(kind, id, body.clone())?;
            state.updates.push((kind, id.to_string(), body));
            Ok(record)
        }
        .boxed()
    }

    fn delete<'a>(&'a self, kind: ResourceKind, id: &'a str) -> ApiFuture<'a, ()> {
        async move {
            self.enter(Operation::Delete, kind, id).await?;
            self.lock().delete(kind, id)
        }
        .boxed()
    }

    fn add_router_interface<'a>(&'a self, router_id: &'a str, subnet_id: &'a str) -> ApiFuture<'a, ()> {
        async move {
            self.enter(Operation::AddRouterInterface, ResourceKind::RouterInterface, router_id)
                .await?;
            self.lock().add_router_interface(router_id, subnet_id)
        }
        .boxed()
    }

    fn remove_router_interface<'a>(&'a self, router_id: &'a str, subnet_id: &'a str) -> ApiFuture<'a, ()> {
        async move {
            self.enter(Operation::RemoveRouterInterface, ResourceKind::RouterInterface, router_id)
                .await?;
            self.lock().remove_router_interface(router_id, subnet_id)
        }
        .boxed()
    }

    fn add_subports<'a>(&'a self, trunk_id: &'a str, subports: Vec<SubportBinding>) -> ApiFuture<'a, Value> {
        async move {
            self.enter(Operation::AddSubports, ResourceKind::TrunkSubport, trunk_id)
                .await?;
            self.lock().add_subports(trunk_id, subports)
        }
        .boxed()
    }

    fn remove_subports<'a>(&'a self, trunk_id: &'a str, port_ids: Vec<String>) -> ApiFuture<'a, Value> {
        async move {
            self.enter(Operation::RemoveSubports, ResourceKind::TrunkSubport, trunk_id)
                .await?;
            self.lock().remove_subports(trunk_id, port_ids)
        }
        .boxed()
    }
}

impl ComputeApi for Simulator {
    fn boot<'a>(&'a self, request: Value) -> ApiFuture<'a, Value> {
        async move {
            self.enter(Operation::Create, ResourceKind::Server, "").await?;
            let request: BootRequest = parse(ResourceKind::Server, request)?;
            self.lock().boot(request)
        }
        .boxed()
    }

    fn show<'a>(&'a self, id: &'a str) -> ApiFuture<'a, Value> {
        async move {
            self.enter(Operation::Show, ResourceKind::Server, id).await?;
            self.lock().show_server(id)
        }
        .boxed()
    }

    fn delete<'a>(&'a self, id: &'a str) -> ApiFuture<'a, ()> {
        async move {
            self.enter(Operation::Delete, ResourceKind::Server, id).await?;
            self.lock().delete_server(id)
        }
        .boxed()
    }
}

impl IdentityApi for Simulator {
    fn create_project<'a>(&'a self, body: Value) -> ApiFuture<'a, Value> {
        async move {
            self.enter(Operation::Create, ResourceKind::Project, "").await?;
            let request = parse(ResourceKind::Project, body)?;
            self.lock().create_project(request)
        }
        .boxed()
    }

    fn create_user<'a>(&'a self, body: Value) -> ApiFuture<'a, Value> {
        async move {
            self.enter(Operation::Create, ResourceKind::User, "").await?;
            let request = parse(ResourceKind::User, body)?;
            self.lock().create_user(request)
        }
        .boxed()
    }

    fn delete_project<'a>(&'a self, id: &'a str) -> ApiFuture<'a, ()> {
        async move {
            self.enter(Operation::Delete, ResourceKind::Project, id).await?;
            self.lock().delete_project(id)
        }
        .boxed()
    }

    fn delete_user<'a>(&'a self, id: &'a str) -> ApiFuture<'a, ()> {
        async move {
            self.enter(Operation::Delete, ResourceKind::User, id).await?;
            self.lock().delete_user(id)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn network_with_subnet(sim: &Simulator, cidr: &str) -> (String, String) {
        let net = NetworkApi::create(sim, ResourceKind::Network, json!({ "name": "n" }))
            .await
            .unwrap();
        let net_id = net["id"].as_str().unwrap().to_string();
        let subnet = NetworkApi::create(
            sim,
            ResourceKind::Subnet,
            json!({ "network_id": net_id, "cidr": cidr, "ip_version": 4, "gateway": null }),
        )
        .await
        .unwrap();
        (net_id, subnet["id"].as_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_subnet_requires_network() {
        let sim = Simulator::new();
        let err = NetworkApi::create(
            &sim,
            ResourceKind::Subnet,
            json!({ "network_id": "nope", "cidr": "10.0.0.0/24", "ip_version": 4, "gateway": null }),
        )
        .await
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_port_allocates_from_every_subnet() {
        let sim = Simulator::new();
        let (net_id, subnet_id) = network_with_subnet(&sim, "10.9.0.0/24").await;
        let port = NetworkApi::create(&sim, ResourceKind::Port, json!({ "network_id": net_id }))
            .await
            .unwrap();
        let port: Port = serde_json::from_value(port).unwrap();
        assert_eq!(port.fixed_ips.len(), 1);
        assert_eq!(port.fixed_ips[0].subnet_id, subnet_id);
        assert_eq!(port.fixed_ips[0].ip_address, "10.9.0.2".parse::<IpAddr>().unwrap());
        assert!(port.port_security_enabled);
    }

    #[tokio::test]
    async fn test_delete_refused_while_dependents_exist() {
        let sim = Simulator::new();
        let (net_id, subnet_id) = network_with_subnet(&sim, "10.9.1.0/24").await;
        let err = NetworkApi::delete(&sim, ResourceKind::Network, &net_id).await.unwrap_err();
        assert!(matches!(err, RemoteError::Conflict { .. }));

        NetworkApi::delete(&sim, ResourceKind::Subnet, &subnet_id).await.unwrap();
        NetworkApi::delete(&sim, ResourceKind::Network, &net_id).await.unwrap();
        assert_eq!(sim.live_count(), 0);
    }

    #[tokio::test]
    async fn test_external_network_is_not_deletable() {
        let sim = Simulator::new();
        let err = NetworkApi::delete(&sim, ResourceKind::Network, EXTERNAL_NETWORK_ID)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_one_shot_fault() {
        let sim = Simulator::new();
        sim.fail_next(Operation::Create, ResourceKind::Router, RemoteError::transport("reset"));
        assert!(NetworkApi::create(&sim, ResourceKind::Router, json!({})).await.is_err());
        assert!(NetworkApi::create(&sim, ResourceKind::Router, json!({})).await.is_ok());
        assert_eq!(sim.call_count(), 2);
    }

    #[tokio::test]
    async fn test_server_lifecycle_polls() {
        let sim = Simulator::new().with_boot_polls(2);
        let (net_id, _) = network_with_subnet(&sim, "10.9.2.0/24").await;
        let port = NetworkApi::create(&sim, ResourceKind::Port, json!({ "network_id": net_id }))
            .await
            .unwrap();
        let port_id = port["id"].as_str().unwrap();
        let server = sim
            .boot(json!({ "name": null, "image": "cirros", "flavor": "m1", "port_ids": [port_id], "key_name": null }))
            .await
            .unwrap();
        let server_id = server["id"].as_str().unwrap();

        let statuses: Vec<String> = {
            let mut seen = Vec::new();
            for _ in 0..3 {
                let record = ComputeApi::show(&sim, server_id).await.unwrap();
                seen.push(record["status"].as_str().unwrap().to_string());
            }
            seen
        };
        assert_eq!(statuses, vec!["BUILD", "BUILD", "ACTIVE"]);

        ComputeApi::delete(&sim, server_id).await.unwrap();
        let err = NetworkApi::delete(&sim, ResourceKind::Port, port_id).await.unwrap_err();
        assert!(matches!(err, RemoteError::Conflict { .. }));
        assert_eq!(ComputeApi::show(&sim, server_id).await.unwrap()["status"], "DELETED");
        assert!(ComputeApi::show(&sim, server_id).await.unwrap_err().is_not_found());
        NetworkApi::delete(&sim, ResourceKind::Port, port_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_subport_vlan_conflict() {
        let sim = Simulator::new();
        let (parent_net, _) = network_with_subnet(&sim, "10.9.3.0/24").await;
        let (sub_net, _) = network_with_subnet(&sim, "10.9.4.0/24").await;
        let parent = NetworkApi::create(&sim, ResourceKind::Port, json!({ "network_id": parent_net }))
            .await
            .unwrap();
        let trunk = NetworkApi::create(&sim, ResourceKind::Trunk, json!({ "port_id": parent["id"], "name": null }))
            .await
            .unwrap();
        let trunk_id = trunk["id"].as_str().unwrap();

        let mut ports = Vec::new();
        for _ in 0..2 {
            let port = NetworkApi::create(&sim, ResourceKind::Port, json!({ "network_id": sub_net }))
                .await
                .unwrap();
            ports.push(port["id"].as_str().unwrap().to_string());
        }
        let binding = |port_id: &str| SubportBinding {
            port_id: port_id.to_string(),
            segmentation_type: SegmentationType::Vlan,
            segmentation_id: 10,
        };
        sim.add_subports(trunk_id, vec![binding(&ports[0])]).await.unwrap();
        let err = sim.add_subports(trunk_id, vec![binding(&ports[1])]).await.unwrap_err();
        assert!(matches!(err, RemoteError::Conflict { .. }));
    }
}
