//! Dependency-ordered creation of networks, subnets, routers and ports.
//!
//! Every object is registered right after the remote side confirms it. The
//! builder keeps a small mirror of router attachments so attach calls can be
//! checked locally before anything is sent, and a set of adopted external
//! networks that may be referenced but are never registered for teardown.

use ipnet::IpNet;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument};

use sfcrig_shared::errors::{ProvisionError, ProvisionResult};
use sfcrig_shared::model::{
    Ethertype, Network, NetworkOptions, Port, PortOptions, Router, RouterOptions, Subnet, SubnetOptions,
};
use sfcrig_shared::resource::{Operation, ResourceHandle, ResourceId, ResourceKind};

use crate::cidr::{CidrGenerator, CidrPool, block_size, host_at};
use crate::client::records::{PortRequest, SubnetRequest};
use crate::client::{Remote, decode, encode};
use crate::registry::ResourceRegistry;

/// Host offset of the first SVI uplink address inside its prefix
pub const SVI_HOST_OFFSET: u128 = 199;

/// Subnet and address prefix one family of SVI uplink ports is pinned to
#[derive(Debug, Clone, Copy)]
pub struct SviAddressing<'a> {
    pub subnet: &'a Subnet,
    pub prefix: IpNet,
}

#[derive(Debug, Default)]
struct TopologyState {
    /// subnet id -> router id
    attachments: HashMap<ResourceId, ResourceId>,
    external_networks: HashSet<ResourceId>,
}

/// Builder for the base networking layer of a run
#[derive(Clone)]
pub struct TopologyBuilder {
    remote: Remote,
    registry: ResourceRegistry,
    cidrs: CidrPool,
    state: Arc<Mutex<TopologyState>>,
}

impl TopologyBuilder {
    pub fn new(remote: Remote, registry: ResourceRegistry, cidrs: CidrPool) -> Self {
        Self {
            remote,
            registry,
            cidrs,
            state: Arc::new(Mutex::new(TopologyState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TopologyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Whether a network was created by this run or adopted as external
    pub fn knows_network(&self, network_id: &str) -> bool {
        self.registry.contains(ResourceKind::Network, network_id)
            || self.lock().external_networks.contains(network_id)
    }

    fn require_network(&self, network_id: &str) -> ProvisionResult<()> {
        if self.knows_network(network_id) {
            Ok(())
        } else {
            Err(ProvisionError::dangling(ResourceKind::Network, network_id))
        }
    }

    /// Router a subnet is currently attached to
    pub fn attached_router(&self, subnet_id: &str) -> Option<ResourceId> {
        self.lock().attachments.get(subnet_id).cloned()
    }

    /// Reserve the next generated block of a family, e.g. to derive host
    /// route next hops before the subnet exists
    pub fn allocate_cidr(&self, ethertype: Ethertype) -> ProvisionResult<IpNet> {
        self.cidrs.for_family(ethertype).next_cidr()
    }

    /// Confirm a pre-existing external network and allow references to it.
    ///
    /// The network is never registered, so teardown leaves it alone.
    pub async fn adopt_external_network(&self, network_id: &str) -> ProvisionResult<Network> {
        let record = self
            .remote
            .call(
                Operation::Show,
                ResourceKind::Network,
                network_id,
                self.remote.network().show(ResourceKind::Network, network_id),
            )
            .await?;
        let network: Network = decode(Operation::Show, ResourceKind::Network, record)?;
        self.lock().external_networks.insert(network.id.clone());
        info!("Adopted external network {} ({})", network.name, network.id);
        Ok(network)
    }

    /// Create a network and `subnet_count` subnets on it.
    ///
    /// An explicit CIDR with a count of one is used verbatim. Otherwise blocks
    /// come from the family's generator, seeded at the explicit CIDR when one
    /// is given. With `dual_stack` each requested subnet becomes an IPv4 and an
    /// IPv6 subnet, IPv4 first.
    #[instrument(skip(self, network_opts, subnet_opts), fields(name = ?network_opts.name))]
    pub async fn create_network_and_subnets(
        &self,
        network_opts: NetworkOptions,
        subnet_opts: SubnetOptions,
        subnet_count: usize,
        dual_stack: bool,
    ) -> ProvisionResult<(Network, Vec<Subnet>)> {
        let mut families = Vec::new();
        if dual_stack {
            let v4 = subnet_opts.cidr.filter(|c| Ethertype::of(c) == Ethertype::IPv4);
            let v6 = subnet_opts
                .ipv6_cidr
                .or(subnet_opts.cidr.filter(|c| Ethertype::of(c) == Ethertype::IPv6));
            families.push((Ethertype::IPv4, v4));
            families.push((Ethertype::IPv6, v6));
        } else {
            let ethertype = subnet_opts.cidr.map(|c| Ethertype::of(&c)).unwrap_or(Ethertype::IPv4);
            families.push((ethertype, subnet_opts.cidr));
        }

        if let Some(gateway) = subnet_opts.gateway {
            check_gateway(gateway, &families, subnet_count)?;
        }

        let body = encode(Operation::Create, ResourceKind::Network, &network_opts)?;
        let record = self
            .remote
            .call(
                Operation::Create,
                ResourceKind::Network,
                network_opts.name.as_deref().unwrap_or("<unnamed>"),
                self.remote.network().create(ResourceKind::Network, body),
            )
            .await?;
        let mut network: Network = decode(Operation::Create, ResourceKind::Network, record)?;
        self.registry.register_id(ResourceKind::Network, &network.id)?;
        info!("Created network {} ({})", network.name, network.id);

        let sources: Vec<(Ethertype, Option<IpNet>, CidrGenerator)> = families
            .into_iter()
            .map(|(ethertype, explicit)| {
                let generator = match explicit {
                    Some(start) => CidrGenerator::global(start),
                    None => self.cidrs.for_family(ethertype).clone(),
                };
                (ethertype, explicit, generator)
            })
            .collect();

        let mut subnets = Vec::with_capacity(subnet_count * sources.len());
        for _ in 0..subnet_count {
            for (ethertype, explicit, generator) in &sources {
                let cidr = match explicit {
                    Some(cidr) if subnet_count == 1 => *cidr,
                    _ => generator.next_cidr()?,
                };
                let subnet = self.create_subnet(&network.id, cidr, *ethertype, &subnet_opts).await?;
                network.cidrs.push(subnet.cidr);
                network.subnet_ids.push(subnet.id.clone());
                subnets.push(subnet);
            }
        }

        Ok((network, subnets))
    }

    async fn create_subnet(
        &self,
        network_id: &str,
        cidr: IpNet,
        ethertype: Ethertype,
        opts: &SubnetOptions,
    ) -> ProvisionResult<Subnet> {
        // Only the subnet of the gateway's family takes it
        let gateway = opts.gateway.filter(|gateway| cidr.contains(gateway));
        let request = SubnetRequest {
            network_id: network_id.to_string(),
            cidr,
            ip_version: ethertype.ip_version(),
            gateway,
            host_routes: opts
                .host_routes
                .iter()
                .filter(|route| Ethertype::of(&route.destination) == ethertype)
                .cloned()
                .collect(),
            enable_dhcp: opts.enable_dhcp,
        };
        let body = encode(Operation::Create, ResourceKind::Subnet, &request)?;
        let record = self
            .remote
            .call(
                Operation::Create,
                ResourceKind::Subnet,
                cidr,
                self.remote.network().create(ResourceKind::Subnet, body),
            )
            .await?;
        let subnet: Subnet = decode(Operation::Create, ResourceKind::Subnet, record)?;
        self.registry.register_id(ResourceKind::Subnet, &subnet.id)?;
        debug!("Created subnet {} {} on {}", subnet.id, subnet.cidr, network_id);
        Ok(subnet)
    }

    #[instrument(skip(self, opts), fields(name = ?opts.name))]
    pub async fn create_router(&self, opts: RouterOptions) -> ProvisionResult<Router> {
        if let Some(gateway) = &opts.external_gateway {
            self.require_network(gateway)?;
        }
        let body = encode(Operation::Create, ResourceKind::Router, &opts)?;
        let record = self
            .remote
            .call(
                Operation::Create,
                ResourceKind::Router,
                opts.name.as_deref().unwrap_or("<unnamed>"),
                self.remote.network().create(ResourceKind::Router, body),
            )
            .await?;
        let router: Router = decode(Operation::Create, ResourceKind::Router, record)?;
        self.registry.register_id(ResourceKind::Router, &router.id)?;
        info!("Created router {} ({})", router.name, router.id);
        Ok(router)
    }

    /// Attach a subnet to a router.
    ///
    /// Attaching a subnet to the router it is already attached to is a no-op.
    pub async fn attach_subnet_to_router(&self, subnet_id: &str, router_id: &str) -> ProvisionResult<()> {
        self.registry.require(ResourceKind::Subnet, subnet_id)?;
        self.registry.require(ResourceKind::Router, router_id)?;

        match self.attached_router(subnet_id) {
            Some(attached) if attached == router_id => {
                debug!("Subnet {} already attached to router {}", subnet_id, router_id);
                return Ok(());
            }
            Some(attached) => {
                return Err(ProvisionError::AttachmentConflict {
                    subnet: subnet_id.to_string(),
                    attached,
                    requested: router_id.to_string(),
                });
            }
            None => {}
        }

        let handle = ResourceHandle::router_interface(router_id, subnet_id);
        self.remote
            .call(
                Operation::AddRouterInterface,
                ResourceKind::RouterInterface,
                &handle,
                self.remote.network().add_router_interface(router_id, subnet_id),
            )
            .await?;
        self.registry.register(ResourceKind::RouterInterface, handle)?;
        self.lock()
            .attachments
            .insert(subnet_id.to_string(), router_id.to_string());
        info!("Attached subnet {} to router {}", subnet_id, router_id);
        Ok(())
    }

    /// Remove a router interface ahead of teardown
    pub async fn detach_subnet_from_router(&self, subnet_id: &str, router_id: &str) -> ProvisionResult<()> {
        let handle = ResourceHandle::router_interface(router_id, subnet_id);
        if self.attached_router(subnet_id).as_deref() != Some(router_id) {
            return Err(ProvisionError::dangling(ResourceKind::RouterInterface, handle.to_string()));
        }
        self.remote
            .call(
                Operation::RemoveRouterInterface,
                ResourceKind::RouterInterface,
                &handle,
                self.remote.network().remove_router_interface(router_id, subnet_id),
            )
            .await?;
        self.lock().attachments.remove(subnet_id);
        info!("Detached subnet {} from router {}", subnet_id, router_id);
        Ok(())
    }

    pub async fn create_port(&self, network_id: &str, opts: PortOptions) -> ProvisionResult<Port> {
        self.require_network(network_id)?;
        let request = PortRequest::new(network_id, opts);
        let body = encode(Operation::Create, ResourceKind::Port, &request)?;
        let record = self
            .remote
            .call(
                Operation::Create,
                ResourceKind::Port,
                request.name.as_deref().unwrap_or(network_id),
                self.remote.network().create(ResourceKind::Port, body),
            )
            .await?;
        let port: Port = decode(Operation::Create, ResourceKind::Port, record)?;
        self.registry.register_id(ResourceKind::Port, &port.id)?;
        debug!("Created port {} on network {}", port.id, network_id);
        Ok(port)
    }

    /// Create one uplink port per fabric node at a fixed offset inside `v4.prefix`
    /// (and `v6.prefix` for dual-stack networks).
    ///
    /// Node `i` gets host `SVI_HOST_OFFSET + i`. Fails with `AddressExhausted`
    /// before any remote call when a prefix cannot hold every node.
    #[instrument(skip(self, v4, v6, nodes), fields(nodes = nodes.len()))]
    pub async fn create_svi_uplink_ports(
        &self,
        network_id: &str,
        v4: SviAddressing<'_>,
        nodes: &[String],
        v6: Option<SviAddressing<'_>>,
    ) -> ProvisionResult<Vec<Port>> {
        self.require_network(network_id)?;

        let mut plan: Vec<PortOptions> = Vec::with_capacity(nodes.len());
        let families: Vec<SviAddressing<'_>> = std::iter::once(v4).chain(v6).collect();
        for addressing in &families {
            let capacity = svi_capacity(&addressing.prefix);
            if u128::try_from(nodes.len()).unwrap_or(u128::MAX) > capacity {
                return Err(ProvisionError::AddressExhausted {
                    block: addressing.prefix.to_string(),
                    requested: nodes.len(),
                    capacity: usize::try_from(capacity).unwrap_or(usize::MAX),
                });
            }
        }

        for (position, node) in nodes.iter().enumerate() {
            let mut opts = PortOptions {
                name: Some(format!("svi-{}", node)),
                ..PortOptions::insecure()
            };
            for addressing in &families {
                let offset = SVI_HOST_OFFSET + position as u128;
                let address = host_at(&addressing.prefix, offset).ok_or_else(|| ProvisionError::AddressExhausted {
                    block: addressing.prefix.to_string(),
                    requested: nodes.len(),
                    capacity: usize::try_from(svi_capacity(&addressing.prefix)).unwrap_or(usize::MAX),
                })?;
                opts = opts.with_fixed_ip(Some(addressing.subnet.id.clone()), address);
            }
            plan.push(opts);
        }

        let mut ports = Vec::with_capacity(plan.len());
        for opts in plan {
            ports.push(self.create_port(network_id, opts).await?);
        }
        info!("Created {} SVI uplink ports on network {}", ports.len(), network_id);
        Ok(ports)
    }

    /// Fail for any subnet that carries host routes without a router interface
    pub fn ensure_routed(&self, subnets: &[Subnet]) -> ProvisionResult<()> {
        let state = self.lock();
        match subnets
            .iter()
            .find(|subnet| !subnet.host_routes.is_empty() && !state.attachments.contains_key(&subnet.id))
        {
            Some(subnet) => Err(ProvisionError::UnroutedSubnet {
                subnet: subnet.id.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Addresses available from `SVI_HOST_OFFSET` up, excluding the IPv4 broadcast address
fn svi_capacity(prefix: &IpNet) -> u128 {
    let reserved = match prefix {
        IpNet::V4(_) => SVI_HOST_OFFSET + 1,
        IpNet::V6(_) => SVI_HOST_OFFSET,
    };
    block_size(prefix).saturating_sub(reserved)
}

/// A gateway needs exactly one subnet of its family with a known prefix containing it
fn check_gateway(gateway: IpAddr, families: &[(Ethertype, Option<IpNet>)], subnet_count: usize) -> ProvisionResult<()> {
    let invalid = |reason: String| ProvisionError::InvalidGateway { gateway, reason };
    if subnet_count != 1 {
        return Err(invalid(format!("{} subnets requested, a gateway fits only one", subnet_count)));
    }
    let family = Ethertype::of_addr(&gateway);
    match families.iter().find(|(ethertype, _)| *ethertype == family) {
        None => Err(invalid(format!("no {} subnet requested", family.as_str()))),
        Some((_, None)) => Err(invalid(format!("the {} prefix is generated", family.as_str()))),
        Some((_, Some(cidr))) if !cidr.contains(&gateway) => Err(invalid(format!("outside {}", cidr))),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::Simulator;
    use sfcrig_shared::errors::RemoteError;
    use std::time::Duration;

    fn builder() -> (Arc<Simulator>, TopologyBuilder) {
        let sim = Arc::new(Simulator::new());
        let remote = Remote::new(sim.clone(), sim.clone(), sim.clone(), Duration::from_secs(1));
        let cidrs = CidrPool::isolated("10.50.0.0/24".parse().unwrap(), "fd00:50::/64".parse().unwrap());
        (sim, TopologyBuilder::new(remote, ResourceRegistry::new(), cidrs))
    }

    #[tokio::test]
    async fn test_explicit_cidr_used_verbatim() {
        let (_sim, topo) = builder();
        let cidr: IpNet = "10.0.1.0/24".parse().unwrap();
        let (network, subnets) = topo
            .create_network_and_subnets(NetworkOptions::vlan(), SubnetOptions::with_cidr(cidr), 1, false)
            .await
            .unwrap();
        assert_eq!(subnets.len(), 1);
        assert_eq!(subnets[0].cidr, cidr);
        assert_eq!(network.subnet_ids, vec![subnets[0].id.clone()]);
        assert_eq!(topo.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_gateway_is_kept_or_rejected_before_any_call() {
        let (sim, topo) = builder();
        let cidr: IpNet = "10.0.1.0/24".parse().unwrap();
        let with_gateway = |gateway: &str| SubnetOptions {
            gateway: Some(gateway.parse().unwrap()),
            ..SubnetOptions::with_cidr(cidr)
        };

        let (_, subnets) = topo
            .create_network_and_subnets(NetworkOptions::vlan(), with_gateway("10.0.1.254"), 1, false)
            .await
            .unwrap();
        assert_eq!(subnets[0].gateway, Some("10.0.1.254".parse().unwrap()));

        let calls = sim.call_count();
        let outside = topo
            .create_network_and_subnets(NetworkOptions::vlan(), with_gateway("10.0.2.1"), 1, false)
            .await
            .unwrap_err();
        assert!(matches!(outside, ProvisionError::InvalidGateway { .. }));
        let several = topo
            .create_network_and_subnets(NetworkOptions::vlan(), with_gateway("10.0.1.254"), 2, false)
            .await
            .unwrap_err();
        assert!(matches!(several, ProvisionError::InvalidGateway { .. }));
        let generated = topo
            .create_network_and_subnets(
                NetworkOptions::vlan(),
                SubnetOptions {
                    gateway: Some("10.50.1.1".parse().unwrap()),
                    ..SubnetOptions::default()
                },
                1,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(generated, ProvisionError::InvalidGateway { .. }));
        assert!(generated.is_precondition());
        assert_eq!(sim.call_count(), calls);
        assert_eq!(topo.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_dual_stack_creates_v4_then_v6() {
        let (_sim, topo) = builder();
        let (_, subnets) = topo
            .create_network_and_subnets(NetworkOptions::vlan(), SubnetOptions::default(), 2, true)
            .await
            .unwrap();
        let families: Vec<Ethertype> = subnets.iter().map(Subnet::ethertype).collect();
        assert_eq!(
            families,
            vec![Ethertype::IPv4, Ethertype::IPv6, Ethertype::IPv4, Ethertype::IPv6]
        );
        assert_eq!(subnets[0].cidr, "10.50.1.0/24".parse::<IpNet>().unwrap());
        assert_eq!(subnets[2].cidr, "10.50.2.0/24".parse::<IpNet>().unwrap());
    }

    #[tokio::test]
    async fn test_attach_is_idempotent_and_conflicts_elsewhere() {
        let (sim, topo) = builder();
        let (_, subnets) = topo
            .create_network_and_subnets(NetworkOptions::vlan(), SubnetOptions::default(), 1, false)
            .await
            .unwrap();
        let r1 = topo.create_router(RouterOptions::default()).await.unwrap();
        let r2 = topo.create_router(RouterOptions::default()).await.unwrap();

        topo.attach_subnet_to_router(&subnets[0].id, &r1.id).await.unwrap();
        let calls = sim.call_count();
        topo.attach_subnet_to_router(&subnets[0].id, &r1.id).await.unwrap();
        assert_eq!(sim.call_count(), calls);

        let err = topo
            .attach_subnet_to_router(&subnets[0].id, &r2.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::AttachmentConflict { .. }));
        assert_eq!(sim.call_count(), calls);
        assert_eq!(topo.registry().all_of(ResourceKind::RouterInterface).len(), 1);
    }

    #[tokio::test]
    async fn test_attach_unknown_subnet_is_dangling() {
        let (sim, topo) = builder();
        let router = topo.create_router(RouterOptions::default()).await.unwrap();
        let calls = sim.call_count();
        let err = topo.attach_subnet_to_router("ghost", &router.id).await.unwrap_err();
        assert!(matches!(err, ProvisionError::DanglingReference { .. }));
        assert_eq!(sim.call_count(), calls);
    }

    #[tokio::test]
    async fn test_failed_create_registers_nothing() {
        let (sim, topo) = builder();
        sim.fail_next(Operation::Create, ResourceKind::Router, RemoteError::transport("reset"));
        assert!(topo.create_router(RouterOptions::default()).await.is_err());
        assert!(topo.registry().is_empty());
    }

    #[tokio::test]
    async fn test_svi_ports_at_fixed_offsets() {
        let (_sim, topo) = builder();
        let cidr: IpNet = "192.168.10.0/24".parse().unwrap();
        let (network, subnets) = topo
            .create_network_and_subnets(NetworkOptions::vlan(), SubnetOptions::with_cidr(cidr), 1, false)
            .await
            .unwrap();
        let nodes = vec!["leaf-101".to_string(), "leaf-102".to_string()];
        let ports = topo
            .create_svi_uplink_ports(
                &network.id,
                SviAddressing {
                    subnet: &subnets[0],
                    prefix: cidr,
                },
                &nodes,
                None,
            )
            .await
            .unwrap();
        let addresses: Vec<_> = ports.iter().filter_map(Port::primary_address).collect();
        assert_eq!(
            addresses,
            vec![
                "192.168.10.199".parse::<std::net::IpAddr>().unwrap(),
                "192.168.10.200".parse().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_svi_exhaustion_before_remote_calls() {
        let (sim, topo) = builder();
        let cidr: IpNet = "192.168.20.0/24".parse().unwrap();
        let (network, subnets) = topo
            .create_network_and_subnets(NetworkOptions::vlan(), SubnetOptions::with_cidr(cidr), 1, false)
            .await
            .unwrap();
        let nodes: Vec<String> = (0..57).map(|i| format!("node-{i}")).collect();
        let calls = sim.call_count();
        let err = topo
            .create_svi_uplink_ports(
                &network.id,
                SviAddressing {
                    subnet: &subnets[0],
                    prefix: cidr,
                },
                &nodes,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::AddressExhausted {
                requested: 57,
                capacity: 56,
                ..
            }
        ));
        assert_eq!(sim.call_count(), calls);
    }

    #[tokio::test]
    async fn test_ensure_routed() {
        let (_sim, topo) = builder();
        let opts = SubnetOptions::default().host_route("0.0.0.0/1".parse().unwrap(), "10.50.1.1".parse().unwrap());
        let (_, subnets) = topo
            .create_network_and_subnets(NetworkOptions::vlan(), opts, 1, false)
            .await
            .unwrap();
        assert!(matches!(
            topo.ensure_routed(&subnets),
            Err(ProvisionError::UnroutedSubnet { .. })
        ));
        let router = topo.create_router(RouterOptions::default()).await.unwrap();
        topo.attach_subnet_to_router(&subnets[0].id, &router.id).await.unwrap();
        assert!(topo.ensure_routed(&subnets).is_ok());
    }

    #[tokio::test]
    async fn test_external_network_is_adopted_not_registered() {
        let (_sim, topo) = builder();
        let network = topo
            .adopt_external_network(crate::simulator::EXTERNAL_NETWORK_ID)
            .await
            .unwrap();
        assert!(network.external);
        assert!(topo.knows_network(&network.id));
        assert!(topo.registry().is_empty());
        topo.create_port(&network.id, PortOptions::default()).await.unwrap();
        assert_eq!(topo.registry().len(), 1);
    }
}
