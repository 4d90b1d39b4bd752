//! Scenario flows and the guarded run around them.
//!
//! Every flow builds its topology through the services of one
//! [`Provisioner`], validates traffic between mutation steps and leaves all
//! cleanup to the teardown that [`ScenarioDriver::run`] performs whether the
//! flow succeeded or not.

use ipnet::IpNet;
use serde_json::json;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument};

use sfcrig_shared::errors::ProvisionError;
use sfcrig_shared::model::{
    BootRequest, ClassifierSpec, Ethertype, Network, NetworkOptions, Port, PortOptions, PortPair, Router,
    RouterOptions, Server, Subnet, SubnetOptions,
};
use sfcrig_shared::resource::{ResourceId, ResourceKind};
use sfcrig_shared::scenario::{ScenarioDefinition, ScenarioId, ScenarioKind, ScenarioParams};

use crate::cidr::host_at;
use crate::identity::DEFAULT_ROLE;
use crate::remote_exec::DestinationSetup;
use crate::services::Provisioner;
use crate::teardown::TeardownReport;
use crate::topology::SviAddressing;
use crate::utils::readiness::settle;

/// VLAN ids of the two subports in the trunk flow
const TRUNK_VLANS: [u16; 2] = [10, 20];
/// Host offset of the VM address in the SVI flow
const SVI_VM_HOST: u128 = 101;
const IDENTITY_DOMAIN: &str = "default";

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Traffic validation failed: {0:#}")]
    Traffic(anyhow::Error),

    #[error("Port {0} has no fixed IP")]
    Unaddressed(ResourceId),

    #[error("Invalid scenario: {0}")]
    Invalid(String),
}

type FlowResult<T> = Result<T, ScenarioError>;

/// Outcome of one guarded scenario run
#[derive(Debug)]
pub struct ScenarioRun {
    pub scenario_id: ScenarioId,
    pub kind: ScenarioKind,
    /// Completed steps, in order
    pub steps: Vec<String>,
    /// Error of the flow itself, if it failed
    pub outcome: Result<(), ScenarioError>,
    pub teardown: TeardownReport,
}

impl ScenarioRun {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok() && self.teardown.is_clean()
    }

    /// Flow error first, teardown failures attached as context
    pub fn into_result(self) -> anyhow::Result<TeardownReport> {
        let failed_deletes = self.teardown.failures.len();
        match self.outcome {
            Ok(()) if failed_deletes == 0 => Ok(self.teardown),
            Ok(()) => Err(anyhow::Error::new(ProvisionError::AggregateTeardown(self.teardown.failures))
                .context(format!("Scenario '{}' could not be torn down", self.scenario_id))),
            Err(err) if failed_deletes == 0 => {
                Err(anyhow::Error::new(err).context(format!("Scenario '{}' failed", self.scenario_id)))
            }
            Err(err) => Err(anyhow::Error::new(err).context(format!(
                "Scenario '{}' failed and {} resource(s) could not be torn down",
                self.scenario_id, failed_deletes
            ))),
        }
    }
}

impl fmt::Display for ScenarioRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.outcome {
            Ok(()) => "passed".to_string(),
            Err(err) => format!("failed: {}", err),
        };
        writeln!(f, "{} ({}) {} after {} step(s)", self.scenario_id, self.kind, status, self.steps.len())?;
        write!(f, "Teardown: {}", self.teardown)
    }
}

/// Runs scenario flows on one provisioner; one driver serves one run
pub struct ScenarioDriver {
    provisioner: Provisioner,
}

impl ScenarioDriver {
    pub fn new(provisioner: Provisioner) -> Self {
        Self { provisioner }
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Run a scenario and always tear down what it created.
    ///
    /// A flow error never prevents teardown and teardown failures never
    /// replace the flow error; both are reported in the returned run.
    #[instrument(skip(self, definition), fields(scenario = %definition.id, kind = %definition.kind))]
    pub async fn run(&self, definition: &ScenarioDefinition) -> ScenarioRun {
        info!("Starting scenario '{}'", definition.name);
        let mut flow = Flow {
            provisioner: &self.provisioner,
            definition,
            params: &definition.params,
            steps: Vec::new(),
            subnets: Vec::new(),
            management: None,
        };

        let outcome = match definition.validate() {
            Ok(()) => flow.execute().await,
            Err(reason) => Err(ScenarioError::Invalid(reason)),
        };
        match &outcome {
            Ok(()) => info!("Scenario '{}' passed", definition.id),
            Err(err) => error!("Scenario '{}' failed: {}", definition.id, err),
        }

        let teardown = self.provisioner.teardown().await;
        ScenarioRun {
            scenario_id: definition.id.clone(),
            kind: definition.kind,
            steps: flow.steps,
            outcome,
            teardown,
        }
    }
}

/// A booted VM and the address commands reach it on
struct Vm {
    server: Server,
    data_port: Port,
    access: IpAddr,
}

impl Vm {
    /// Guest interface name of the data port
    fn data_interface(&self) -> &'static str {
        if self.server.port_ids.len() > 1 { "eth1" } else { "eth0" }
    }
}

struct ServiceFunction {
    pair: PortPair,
}

/// Left/right networks a service VM sits between
struct ServiceNetworks {
    left: Network,
    right: Network,
}

/// Source and destination side shared by every chain flow
struct SfcBase {
    label: String,
    src_net: Network,
    dest_net: Network,
    router: Router,
    src_vm: Vm,
    destination: DestinationSetup,
}

struct Flow<'a> {
    provisioner: &'a Provisioner,
    definition: &'a ScenarioDefinition,
    params: &'a ScenarioParams,
    steps: Vec<String>,
    /// Every subnet created by the flow, checked before traffic validation
    subnets: Vec<Subnet>,
    /// Adopted external network VMs get their access port on
    management: Option<Network>,
}

fn first_of(subnets: &[Subnet], ethertype: Ethertype) -> FlowResult<&Subnet> {
    subnets
        .iter()
        .find(|subnet| subnet.ethertype() == ethertype)
        .ok_or_else(|| ScenarioError::Invalid(format!("no {} subnet was created", ethertype.as_str())))
}

fn gateway_of(cidr: &IpNet) -> FlowResult<IpAddr> {
    host_at(cidr, 1).ok_or_else(|| {
        ScenarioError::Provision(ProvisionError::AddressExhausted {
            block: cidr.to_string(),
            requested: 1,
            capacity: 0,
        })
    })
}

fn half_routes() -> [IpNet; 2] {
    [
        "0.0.0.0/1".parse().expect("Lower half prefix is a valid literal"),
        "128.0.0.0/1".parse().expect("Upper half prefix is a valid literal"),
    ]
}

fn all_addresses(port: &Port) -> Vec<IpAddr> {
    port.fixed_ips.iter().map(|ip| ip.ip_address).collect()
}

impl Flow<'_> {
    fn step(&mut self, description: impl Into<String>) {
        let description = description.into();
        info!("[{}] {}", self.definition.id, description);
        self.steps.push(description);
    }

    async fn execute(&mut self) -> FlowResult<()> {
        if let Some(public) = &self.params.public_network {
            let network = self.provisioner.topology.adopt_external_network(public).await?;
            self.management = Some(network);
        }

        match self.definition.kind {
            ScenarioKind::SfcAddPortpair => self.sfc_parallel("", true).await,
            ScenarioKind::SfcSingleParallel => self.sfc_parallel("", false).await,
            ScenarioKind::SfcMultiSeries => self.sfc_series().await,
            ScenarioKind::SfcRemoveService => self.sfc_remove_service().await,
            ScenarioKind::SfcAddFlowclassifier => self.sfc_add_flowclassifier().await,
            ScenarioKind::TrunkSubportLifecycle => self.trunk_subport_lifecycle().await,
            ScenarioKind::SviUplink => self.svi_uplink().await,
            ScenarioKind::MultiTenantSfc => self.multi_tenant().await,
        }
    }

    async fn create_network(
        &mut self,
        name: String,
        subnet_opts: SubnetOptions,
        dual_stack: bool,
    ) -> FlowResult<(Network, Vec<Subnet>)> {
        let (network, subnets) = self
            .provisioner
            .topology
            .create_network_and_subnets(NetworkOptions::vlan().named(name), subnet_opts, 1, dual_stack)
            .await?;
        self.subnets.extend(subnets.iter().cloned());
        Ok((network, subnets))
    }

    async fn attach_all(&mut self, router: &Router, subnets: &[Subnet]) -> FlowResult<()> {
        for subnet in subnets {
            self.provisioner
                .topology
                .attach_subnet_to_router(&subnet.id, &router.id)
                .await?;
        }
        Ok(())
    }

    async fn create_router(&mut self, name: String) -> FlowResult<Router> {
        let router = self
            .provisioner
            .topology
            .create_router(RouterOptions {
                name: Some(name),
                external_gateway: None,
            })
            .await?;
        Ok(router)
    }

    /// Boot a VM on `data_port`, with an access port on the management
    /// network in front when one was adopted
    async fn boot_vm(&mut self, name: String, image: &str, data_port: Port) -> FlowResult<Vm> {
        let topology = &self.provisioner.topology;
        let mut port_ids = Vec::with_capacity(2);
        let mut access = None;
        if let Some(management) = &self.management {
            let opts = PortOptions {
                name: Some(format!("{}-mgmt", name)),
                ..PortOptions::default()
            };
            let mgmt_port = topology.create_port(&management.id, opts).await?;
            access = mgmt_port.primary_address();
            port_ids.push(mgmt_port.id.clone());
            if access.is_none() {
                return Err(ScenarioError::Unaddressed(mgmt_port.id));
            }
        }
        port_ids.push(data_port.id.clone());
        let access = access
            .or_else(|| data_port.primary_address())
            .ok_or_else(|| ScenarioError::Unaddressed(data_port.id.clone()))?;

        let server = self
            .provisioner
            .servers
            .boot_server(BootRequest {
                name: Some(name),
                image: image.to_string(),
                flavor: self.params.flavor.clone(),
                port_ids,
                key_name: self.params.key_name.clone(),
            })
            .await?;
        Ok(Vm {
            server,
            data_port,
            access,
        })
    }

    async fn boot_vm_on(&mut self, name: String, network_id: &str, opts: PortOptions) -> FlowResult<Vm> {
        let port_opts = PortOptions {
            name: Some(format!("{}-data", name)),
            ..opts
        };
        let data_port = self.provisioner.topology.create_port(network_id, port_opts).await?;
        let image = self.params.vm_image.clone();
        self.boot_vm(name, &image, data_port).await
    }

    /// Traffic checks from `from` to each target once the topology is routed
    async fn validate_traffic(&mut self, from: IpAddr, targets: &[IpAddr], after: &str) -> FlowResult<()> {
        self.provisioner.topology.ensure_routed(&self.subnets)?;
        self.provisioner
            .exec
            .check_all(from, targets)
            .await
            .map_err(ScenarioError::Traffic)?;
        self.step(format!("Traffic verified {} ({} target(s))", after, targets.len()));
        Ok(())
    }

    async fn settle_chain(&self) {
        settle(Duration::from_millis(self.definition.settle_ms), "chain programming").await;
    }

    async fn build_sfc_base(&mut self, label: &str) -> FlowResult<SfcBase> {
        let params = self.params;
        let (src_net, src_subnets) = self
            .create_network(
                format!("{}src", label),
                SubnetOptions {
                    cidr: Some(params.src_cidr),
                    ipv6_cidr: params.ipv6_src_cidr,
                    ..SubnetOptions::default()
                },
                params.dual_stack,
            )
            .await?;
        let (dest_net, dest_subnets) = self
            .create_network(
                format!("{}dest", label),
                SubnetOptions {
                    cidr: Some(params.dest_cidr),
                    ipv6_cidr: params.ipv6_dest_cidr,
                    ..SubnetOptions::default()
                },
                params.dual_stack,
            )
            .await?;
        let router = self.create_router(format!("{}router", label)).await?;
        self.attach_all(&router, &src_subnets).await?;
        self.attach_all(&router, &dest_subnets).await?;
        self.step(format!("{}source and destination networks routed", label));

        let src_vm = self
            .boot_vm_on(format!("{}src-vm", label), &src_net.id, PortOptions::insecure())
            .await?;
        let dest_vm = self
            .boot_vm_on(format!("{}dest-vm", label), &dest_net.id, PortOptions::insecure())
            .await?;
        self.step(format!(
            "{}source VM {} and destination VM {} active",
            label, src_vm.server.id, dest_vm.server.id
        ));

        let dest_subnet = first_of(&dest_subnets, Ethertype::IPv4)?;
        let gateway = match dest_subnet.gateway {
            Some(gateway) => gateway,
            None => gateway_of(&dest_subnet.cidr)?,
        };
        let mut destination = DestinationSetup::new(
            params.probe_addresses.clone(),
            params.dest_cidr,
            gateway,
            params.ipv6_dest_cidr.filter(|_| params.dual_stack),
        );
        destination.interface = dest_vm.data_interface().to_string();
        self.provisioner
            .exec
            .configure_destination(dest_vm.access, &destination)
            .await
            .map_err(ScenarioError::Traffic)?;
        self.step(format!("{}destination VM configured", label));

        Ok(SfcBase {
            label: label.to_string(),
            src_net,
            dest_net,
            router,
            src_vm,
            destination,
        })
    }

    /// Left network routing back to the source, right network routing everywhere else
    async fn create_service_networks(&mut self, base: &SfcBase, index: usize) -> FlowResult<ServiceNetworks> {
        let topology = &self.provisioner.topology;
        let left_cidr = topology.allocate_cidr(Ethertype::IPv4)?;
        let right_cidr = topology.allocate_cidr(Ethertype::IPv4)?;
        let left_gateway = gateway_of(&left_cidr)?;
        let right_gateway = gateway_of(&right_cidr)?;

        let left_opts = SubnetOptions::with_cidr(left_cidr).host_route(self.params.src_cidr, left_gateway);
        let right_opts = half_routes()
            .into_iter()
            .fold(SubnetOptions::with_cidr(right_cidr), |opts, half| {
                opts.host_route(half, right_gateway)
            });

        let (left, left_subnets) = self
            .create_network(format!("{}left-{}", base.label, index), left_opts, false)
            .await?;
        let (right, right_subnets) = self
            .create_network(format!("{}right-{}", base.label, index), right_opts, false)
            .await?;
        self.attach_all(&base.router, &left_subnets).await?;
        self.attach_all(&base.router, &right_subnets).await?;
        Ok(ServiceNetworks { left, right })
    }

    /// Boot a VNF between `nets` and describe it as a port pair
    async fn create_service_function(
        &mut self,
        base: &SfcBase,
        nets: &ServiceNetworks,
        index: usize,
    ) -> FlowResult<ServiceFunction> {
        let name = format!("{}service-{}", base.label, index);
        let topology = &self.provisioner.topology;
        let ingress = topology
            .create_port(
                &nets.left.id,
                PortOptions {
                    name: Some(format!("{}-in", name)),
                    ..PortOptions::insecure()
                },
            )
            .await?;
        let egress = topology
            .create_port(
                &nets.right.id,
                PortOptions {
                    name: Some(format!("{}-out", name)),
                    ..PortOptions::insecure()
                },
            )
            .await?;
        self.provisioner
            .servers
            .boot_server(BootRequest {
                name: Some(name),
                image: self.params.service_image.clone(),
                flavor: self.params.flavor.clone(),
                port_ids: vec![ingress.id.clone(), egress.id.clone()],
                key_name: self.params.key_name.clone(),
            })
            .await?;
        let pair = self.provisioner.chains.create_port_pair(&ingress, &egress).await?;
        Ok(ServiceFunction { pair })
    }

    /// Classifiers steering source to `dest_prefix` traffic, plus the IPv6
    /// equivalent on dual-stack runs
    async fn create_classifiers(
        &mut self,
        base: &SfcBase,
        dest_prefix: IpNet,
        dest_network: &Network,
    ) -> FlowResult<Vec<ResourceId>> {
        let params = self.params;
        let mut specs = vec![ClassifierSpec {
            source_prefix: params.src_cidr,
            destination_prefix: dest_prefix,
            logical_source_network: base.src_net.id.clone(),
            logical_destination_network: dest_network.id.clone(),
            ethertype: None,
        }];
        if params.dual_stack {
            if let (Some(src), Some(dest)) = (params.ipv6_src_cidr, params.ipv6_dest_cidr) {
                specs.push(ClassifierSpec {
                    source_prefix: src,
                    destination_prefix: dest,
                    logical_source_network: base.src_net.id.clone(),
                    logical_destination_network: dest_network.id.clone(),
                    ethertype: Some(Ethertype::IPv6),
                });
            }
        }

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            ids.push(self.provisioner.chains.create_flow_classifier(spec).await?.id);
        }
        Ok(ids)
    }

    async fn validate_base(&mut self, base: &SfcBase, after: &str) -> FlowResult<()> {
        self.settle_chain().await;
        let targets = base.destination.targets();
        self.validate_traffic(base.src_vm.access, &targets, after).await
    }

    /// One stage of equivalent nodes; optionally grown by one node on the live chain
    async fn sfc_parallel(&mut self, label: &str, grow: bool) -> FlowResult<()> {
        let base = self.build_sfc_base(label).await?;
        let nets = self.create_service_networks(&base, 0).await?;

        let mut nodes = Vec::with_capacity(self.params.service_functions);
        for index in 0..self.params.service_functions {
            nodes.push(self.create_service_function(&base, &nets, index).await?.pair.id);
        }
        let stage = self.provisioner.chains.create_port_pair_group(&nodes).await?;
        let classifiers = self
            .create_classifiers(&base, base.destination.prefix, &base.dest_net)
            .await?;
        let chain = self
            .provisioner
            .chains
            .create_chain(&[stage.id.clone()], &classifiers)
            .await?;
        self.step(format!("{}chain {} assembled with {} parallel node(s)", label, chain.id, nodes.len()));
        self.validate_base(&base, "through the chain").await?;

        if grow {
            let extra = self
                .create_service_function(&base, &nets, self.params.service_functions)
                .await?;
            self.provisioner
                .chains
                .add_node_to_stage(&stage.id, &extra.pair.id)
                .await?;
            self.step(format!("Port pair {} added to stage {}", extra.pair.id, stage.id));
            self.validate_base(&base, "after adding a port pair").await?;
        }
        Ok(())
    }

    /// Single-node stages traversed one after another
    async fn sfc_series(&mut self) -> FlowResult<()> {
        let base = self.build_sfc_base("").await?;
        let mut stages = Vec::with_capacity(self.params.service_functions);
        for index in 0..self.params.service_functions {
            let nets = self.create_service_networks(&base, index).await?;
            let function = self.create_service_function(&base, &nets, index).await?;
            let stage = self
                .provisioner
                .chains
                .create_port_pair_group(&[function.pair.id])
                .await?;
            stages.push(stage.id);
        }
        let classifiers = self
            .create_classifiers(&base, base.destination.prefix, &base.dest_net)
            .await?;
        let chain = self.provisioner.chains.create_chain(&stages, &classifiers).await?;
        self.step(format!("Chain {} assembled with {} stage(s) in series", chain.id, stages.len()));
        self.validate_base(&base, "through every stage").await
    }

    async fn sfc_remove_service(&mut self) -> FlowResult<()> {
        let base = self.build_sfc_base("").await?;
        let mut stages = Vec::with_capacity(2);
        let mut nodes = Vec::with_capacity(2);
        for index in 0..2 {
            let nets = self.create_service_networks(&base, index).await?;
            let function = self.create_service_function(&base, &nets, index).await?;
            let stage = self
                .provisioner
                .chains
                .create_port_pair_group(&[function.pair.id.clone()])
                .await?;
            nodes.push(function.pair.id);
            stages.push(stage.id);
        }
        let classifiers = self
            .create_classifiers(&base, base.destination.prefix, &base.dest_net)
            .await?;
        let chain = self.provisioner.chains.create_chain(&stages, &classifiers).await?;
        self.step(format!("Chain {} assembled with two services", chain.id));
        self.validate_base(&base, "through both services").await?;

        let chains = &self.provisioner.chains;
        chains.remove_stage(&chain.id, &stages[1]).await?;
        chains.delete_stage(&stages[1]).await?;
        chains.delete_node(&nodes[1]).await?;
        self.step(format!("Service stage {} removed from chain {}", stages[1], chain.id));
        self.validate_base(&base, "after removing a service").await
    }

    async fn sfc_add_flowclassifier(&mut self) -> FlowResult<()> {
        let base = self.build_sfc_base("").await?;
        let (test_net, test_subnets) = self
            .create_network("test".to_string(), SubnetOptions::default(), false)
            .await?;
        self.attach_all(&base.router, &test_subnets).await?;
        let test_prefix = first_of(&test_subnets, Ethertype::IPv4)?.cidr;

        let nets = self.create_service_networks(&base, 0).await?;
        let function = self.create_service_function(&base, &nets, 0).await?;
        let stage = self
            .provisioner
            .chains
            .create_port_pair_group(&[function.pair.id])
            .await?;
        let first = self.create_classifiers(&base, test_prefix, &test_net).await?;
        let chain = self.provisioner.chains.create_chain(&[stage.id], &first).await?;
        self.step(format!("Chain {} steering traffic to {}", chain.id, test_prefix));
        self.validate_base(&base, "with the initial classifier").await?;

        let added = self
            .create_classifiers(&base, base.destination.prefix, &base.dest_net)
            .await?;
        for classifier in &added {
            self.provisioner.chains.add_classifier(&chain.id, classifier).await?;
        }
        self.step(format!("{} classifier(s) added to chain {}", added.len(), chain.id));
        self.validate_base(&base, "with the added classifier").await
    }

    async fn configure_vlan_interfaces(&mut self, vm: &Vm, subports: &[(u16, String)]) -> FlowResult<()> {
        let parent = vm.data_interface();
        let script = subports
            .iter()
            .map(|(vlan, mac)| {
                let name = format!("{}.{}", parent, vlan);
                format!(
                    "ip link add link {parent} name {name} type vlan id {vlan}; \
                     ip link set {name} address {mac}; ip link set {name} up; udhcpc -i {name}"
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        self.provisioner
            .exec
            .run(vm.access, &script)
            .await
            .map_err(ScenarioError::Traffic)?;
        Ok(())
    }

    /// Subports carry traffic to peer networks, then one moves to another trunk
    async fn trunk_subport_lifecycle(&mut self) -> FlowResult<()> {
        let params = self.params;
        let mut networks = Vec::with_capacity(3);
        let router = self.create_router("trunk-router".to_string()).await?;
        for (index, cidr) in params.trunk_cidrs.iter().take(3).enumerate() {
            let (network, subnets) = self
                .create_network(format!("trunk-net-{}", index), SubnetOptions::with_cidr(*cidr), false)
                .await?;
            self.attach_all(&router, &subnets).await?;
            networks.push(network);
        }
        self.step("Trunk networks routed");

        let provisioner = self.provisioner;
        let topology = &provisioner.topology;
        let trunks = &provisioner.trunks;
        let mut trunk_vms = Vec::with_capacity(2);
        let mut trunk_ids = Vec::with_capacity(2);
        for index in 0..2 {
            let parent = topology
                .create_port(
                    &networks[0].id,
                    PortOptions {
                        name: Some(format!("trunk-parent-{}", index)),
                        ..PortOptions::insecure()
                    },
                )
                .await?;
            let trunk = trunks.create_trunk(&parent, Some(format!("trunk-{}", index))).await?;
            trunk_ids.push(trunk.id);
            let image = params.vm_image.clone();
            trunk_vms.push(self.boot_vm(format!("trunk-vm-{}", index), &image, parent).await?);
        }

        let mut peers = Vec::with_capacity(3);
        for (index, network) in networks.iter().enumerate() {
            peers.push(
                self.boot_vm_on(format!("peer-vm-{}", index), &network.id, PortOptions::insecure())
                    .await?,
            );
        }
        self.step("Trunk and peer VMs active");

        let mut subports = Vec::with_capacity(2);
        for (vlan, network) in TRUNK_VLANS.iter().zip(&networks[1..]) {
            let (port, mac) = trunks
                .add_subport(topology, &trunk_ids[0], &network.id, PortOptions::insecure(), *vlan)
                .await?;
            subports.push((*vlan, port, mac.to_string()));
        }
        self.step(format!("{} subport(s) bound to trunk {}", subports.len(), trunk_ids[0]));

        let vlan_macs: Vec<(u16, String)> = subports.iter().map(|(vlan, _, mac)| (*vlan, mac.clone())).collect();
        self.configure_vlan_interfaces(&trunk_vms[0], &vlan_macs).await?;
        let targets: Vec<IpAddr> = peers.iter().flat_map(|vm| all_addresses(&vm.data_port)).collect();
        self.validate_traffic(trunk_vms[0].access, &targets, "across the trunk")
            .await?;

        let (vlan, moved, mac) = &subports[1];
        trunks.remove_subport(&trunk_ids[0], &moved.id).await?;
        trunks.bind_port(&trunk_ids[1], moved, *vlan).await?;
        self.step(format!(
            "Subport {} moved from trunk {} to trunk {}",
            moved.id, trunk_ids[0], trunk_ids[1]
        ));

        self.configure_vlan_interfaces(&trunk_vms[1], &[(*vlan, mac.clone())])
            .await?;
        let remaining: Vec<IpAddr> = peers[..2].iter().flat_map(|vm| all_addresses(&vm.data_port)).collect();
        self.validate_traffic(trunk_vms[0].access, &remaining, "on the original trunk")
            .await?;
        let moved_target = all_addresses(&peers[2].data_port);
        self.validate_traffic(trunk_vms[1].access, &moved_target, "on the new trunk")
            .await
    }

    /// Uplink ports for each fabric node on a BGP-enabled SVI network
    async fn svi_uplink(&mut self) -> FlowResult<()> {
        let params = self.params;
        let prefix = params
            .svi_prefix
            .ok_or_else(|| ScenarioError::Invalid("svi_prefix is required".to_string()))?;
        let mut network_opts = NetworkOptions::vlan()
            .named("svi")
            .with_extension("apic:svi", json!(true))
            .with_extension("apic:bgp_enable", json!(params.bgp_asn.is_some()));
        if let Some(asn) = params.bgp_asn {
            network_opts = network_opts.with_extension("apic:bgp_asn", json!(asn.to_string()));
        }
        let v6_prefix = params.ipv6_src_cidr.filter(|_| params.dual_stack);
        let (network, subnets) = self
            .provisioner
            .topology
            .create_network_and_subnets(
                network_opts,
                SubnetOptions {
                    cidr: Some(prefix),
                    ipv6_cidr: v6_prefix,
                    ..SubnetOptions::default()
                },
                1,
                params.dual_stack,
            )
            .await?;
        self.subnets.extend(subnets.iter().cloned());
        let router = self.create_router("svi-router".to_string()).await?;
        self.attach_all(&router, &subnets).await?;

        let v4_subnet = first_of(&subnets, Ethertype::IPv4)?;
        let v6 = match v6_prefix {
            Some(prefix) => Some(SviAddressing {
                subnet: first_of(&subnets, Ethertype::IPv6)?,
                prefix,
            }),
            None => None,
        };
        let uplinks = self
            .provisioner
            .topology
            .create_svi_uplink_ports(
                &network.id,
                SviAddressing {
                    subnet: v4_subnet,
                    prefix,
                },
                &params.fabric_nodes,
                v6,
            )
            .await?;
        self.step(format!("{} SVI uplink port(s) created on {}", uplinks.len(), network.id));

        let mut vm_opts = PortOptions::insecure();
        for subnet in &subnets {
            let address = host_at(&subnet.cidr, SVI_VM_HOST).ok_or_else(|| ProvisionError::AddressExhausted {
                block: subnet.cidr.to_string(),
                requested: 1,
                capacity: 0,
            })?;
            vm_opts = vm_opts.with_fixed_ip(Some(subnet.id.clone()), address);
        }
        let vm = self.boot_vm_on("svi-vm".to_string(), &network.id, vm_opts).await?;
        self.step(format!("SVI VM {} active", vm.server.id));

        let targets: Vec<IpAddr> = uplinks.iter().flat_map(all_addresses).collect();
        self.validate_traffic(vm.access, &targets, "to every SVI uplink")
            .await
    }

    /// A project, a user and a single-stage chain per tenant
    async fn multi_tenant(&mut self) -> FlowResult<()> {
        let params = self.params;
        for tenant in &params.tenants {
            let identity = &self.provisioner.identity;
            let project = identity.create_project(tenant, IDENTITY_DOMAIN).await?;
            identity
                .create_user(
                    &format!("{}-user", tenant),
                    params.credentials.password.as_deref(),
                    &project,
                    IDENTITY_DOMAIN,
                    DEFAULT_ROLE,
                )
                .await?;
            self.step(format!("Tenant {} provisioned as project {}", tenant, project.id));
            self.sfc_parallel(&format!("{}-", tenant), false).await?;
        }
        let projects = self.provisioner.registry.all_of(ResourceKind::Project).len();
        self.step(format!("{} tenant chain(s) verified", projects));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cidr::CidrPool;
    use crate::remote_exec::{CommandOutput, ScriptedExecutor};
    use crate::services::ProvisionerSettings;
    use crate::simulator::{EXTERNAL_NETWORK_ID, Simulator};
    use crate::utils::service_resilience::{RetryConfig, ServiceResilienceManager, TRAFFIC_CHECK};
    use sfcrig_shared::errors::RemoteError;
    use sfcrig_shared::resource::Operation;
    use sfcrig_shared::scenario::ScenarioMetadata;
    use std::sync::Arc;

    fn driver(sim: &Arc<Simulator>, executor: Arc<ScriptedExecutor>) -> ScenarioDriver {
        ScenarioDriver::new(Provisioner::simulated(
            sim.clone(),
            executor,
            CidrPool::isolated("10.60.0.0/24".parse().unwrap(), "fd00:60::/64".parse().unwrap()),
            ProvisionerSettings::simulated(),
        ))
    }

    fn definition(kind: ScenarioKind) -> ScenarioDefinition {
        let mut params = ScenarioParams {
            public_network: Some(EXTERNAL_NETWORK_ID.to_string()),
            service_functions: 2,
            ..ScenarioParams::default()
        };
        match kind {
            ScenarioKind::TrunkSubportLifecycle => {
                params.trunk_cidrs = vec![
                    "10.10.0.0/24".parse().unwrap(),
                    "10.20.0.0/24".parse().unwrap(),
                    "10.30.0.0/24".parse().unwrap(),
                ];
            }
            ScenarioKind::SviUplink => {
                params.fabric_nodes = vec!["node-101".to_string(), "node-102".to_string()];
                params.svi_prefix = Some("192.168.10.0/24".parse().unwrap());
                params.bgp_asn = Some(10);
            }
            ScenarioKind::MultiTenantSfc => {
                params.tenants = vec!["red".to_string(), "blue".to_string()];
            }
            _ => {}
        }
        ScenarioDefinition {
            id: format!("test-{}", kind),
            name: kind.to_string(),
            description: String::new(),
            kind,
            params,
            settle_ms: 0,
            metadata: ScenarioMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_every_flow_round_trips_on_the_simulator() {
        for kind in ScenarioKind::ALL {
            let sim = Arc::new(Simulator::new());
            let run = driver(&sim, Arc::new(ScriptedExecutor::reachable()))
                .run(&definition(kind))
                .await;
            assert!(run.outcome.is_ok(), "{}: {:?}", kind, run.outcome);
            assert!(run.teardown.is_clean(), "{}: {}", kind, run.teardown);
            assert_eq!(sim.live_count(), 0, "{} leaked resources", kind);
        }
    }

    #[tokio::test]
    async fn test_dual_stack_chain_gets_ipv6_classifier_and_probes() {
        let sim = Arc::new(Simulator::new());
        let executor = Arc::new(ScriptedExecutor::reachable());
        let mut def = definition(ScenarioKind::SfcSingleParallel);
        def.params.dual_stack = true;
        def.params.ipv6_src_cidr = Some("2001:db8:1::/64".parse().unwrap());
        def.params.ipv6_dest_cidr = Some("2001:d8::/32".parse().unwrap());

        let run = driver(&sim, executor.clone()).run(&def).await;
        assert!(run.succeeded(), "{}", run);
        let commands: Vec<String> = executor.history().into_iter().map(|(_, c)| c).collect();
        assert!(commands.iter().any(|c| c.contains("ip -6 addr add 2001:d8::101/32")));
        assert!(commands.iter().any(|c| c == "ping6 -c 5 2001:d8::103"));
        let classifiers = run
            .teardown
            .deleted
            .iter()
            .filter(|entry| entry.kind == ResourceKind::FlowClassifier)
            .count();
        assert_eq!(classifiers, 2);
    }

    #[tokio::test]
    async fn test_failed_step_still_tears_down() {
        let sim = Arc::new(Simulator::new());
        sim.fail_next(
            Operation::Create,
            ResourceKind::PortChain,
            RemoteError::rejected("chain driver unavailable"),
        );
        let run = driver(&sim, Arc::new(ScriptedExecutor::reachable()))
            .run(&definition(ScenarioKind::SfcAddPortpair))
            .await;

        assert!(matches!(
            run.outcome,
            Err(ScenarioError::Provision(ProvisionError::RemoteOperationFailed { .. }))
        ));
        assert!(run.teardown.is_clean());
        assert!(!run.teardown.deleted.is_empty());
        assert_eq!(sim.live_count(), 0);
        assert!(run.into_result().is_err());
    }

    #[tokio::test]
    async fn test_blocked_traffic_is_reported_with_clean_teardown() {
        let sim = Arc::new(Simulator::new());
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("ping", CommandOutput::failed(1, "100% packet loss"));
        let retries = ServiceResilienceManager::new();
        retries.set_retry_config(
            TRAFFIC_CHECK,
            RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                backoff_multiplier: 1.0,
            },
        );
        let mut provisioner = Provisioner::simulated(
            sim.clone(),
            executor,
            CidrPool::isolated("10.61.0.0/24".parse().unwrap(), "fd00:61::/64".parse().unwrap()),
            ProvisionerSettings::simulated(),
        );
        provisioner.exec = provisioner.exec.clone().with_resilience(Arc::new(retries));

        let run = ScenarioDriver::new(provisioner)
            .run(&definition(ScenarioKind::SfcMultiSeries))
            .await;
        assert!(matches!(run.outcome, Err(ScenarioError::Traffic(_))));
        assert!(run.teardown.is_clean());
        assert_eq!(sim.live_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_failure_does_not_mask_success() {
        let sim = Arc::new(Simulator::new());
        sim.fail_next(
            Operation::Delete,
            ResourceKind::Router,
            RemoteError::Conflict {
                kind: ResourceKind::Router,
                message: "router busy".to_string(),
            },
        );
        let run = driver(&sim, Arc::new(ScriptedExecutor::reachable()))
            .run(&definition(ScenarioKind::SfcSingleParallel))
            .await;
        assert!(run.outcome.is_ok());
        assert_eq!(run.teardown.failures.len(), 1);
        let err = run.into_result().unwrap_err();
        assert!(format!("{:#}", err).contains("could not be torn down"));
    }

    #[tokio::test]
    async fn test_invalid_definition_creates_nothing() {
        let sim = Arc::new(Simulator::new());
        let mut def = definition(ScenarioKind::SviUplink);
        def.params.fabric_nodes.clear();
        let run = driver(&sim, Arc::new(ScriptedExecutor::reachable())).run(&def).await;
        assert!(matches!(run.outcome, Err(ScenarioError::Invalid(_))));
        assert_eq!(run.teardown.attempted(), 0);
        assert_eq!(sim.call_count(), 0);
    }
}
