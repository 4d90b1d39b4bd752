//! Service chain assembly and live mutation.
//!
//! The remote chain API only offers full-replace updates: every change to a
//! port pair group's members or a chain's classifier or group list resends the
//! complete list. The assembler keeps a mirror of the current membership so
//! each update is computed locally as "current plus or minus one", and the
//! mirror is only committed once the remote side has accepted the new list.
//!
//! Chain lifecycle: `Assembled -> Mutating -> Assembled -> TornDown`. A chain
//! that was never created is simply absent from the mirror.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

use sfcrig_shared::errors::{ProvisionError, ProvisionResult};
use sfcrig_shared::model::{ClassifierSpec, Ethertype, FlowClassifier, Port, PortChain, PortPair, PortPairGroup};
use sfcrig_shared::resource::{Operation, ResourceId, ResourceKind};

use crate::client::records::{PortChainRequest, PortPairGroupRequest, PortPairRequest};
use crate::client::{Remote, decode, encode};
use crate::registry::ResourceRegistry;
use crate::topology::TopologyBuilder;

/// Placeholder id for objects rejected before creation
const NEW: &str = "<new>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    Assembled,
    Mutating,
    TornDown,
}

impl fmt::Display for ChainPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainPhase::Assembled => "assembled",
            ChainPhase::Mutating => "being mutated",
            ChainPhase::TornDown => "torn down",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct ChainMirror {
    chain: PortChain,
    phase: ChainPhase,
}

#[derive(Debug, Default)]
struct ChainState {
    pairs: HashMap<ResourceId, PortPair>,
    groups: HashMap<ResourceId, PortPairGroup>,
    classifiers: HashMap<ResourceId, FlowClassifier>,
    chains: HashMap<ResourceId, ChainMirror>,
}

impl ChainState {
    fn live_chains(&self) -> impl Iterator<Item = &ChainMirror> {
        self.chains.values().filter(|m| m.phase != ChainPhase::TornDown)
    }

    fn group_holder(&self, group_id: &str) -> Option<ResourceId> {
        self.live_chains()
            .find(|m| m.chain.port_pair_groups.iter().any(|g| g == group_id))
            .map(|m| m.chain.id.clone())
    }

    fn pair_holder(&self, pair_id: &str) -> Option<ResourceId> {
        self.groups
            .values()
            .find(|g| g.port_pairs.iter().any(|p| p == pair_id))
            .map(|g| g.id.clone())
    }

    fn classifier_holder(&self, classifier_id: &str) -> Option<ResourceId> {
        self.live_chains()
            .find(|m| m.chain.flow_classifiers.iter().any(|c| c == classifier_id))
            .map(|m| m.chain.id.clone())
    }
}

/// Keeps a chain `Mutating` while its update is in flight
///
/// Dropping the guard without `release`, as when the mutation future is
/// cancelled, puts the chain back to `Assembled`.
struct MutationGuard<'a> {
    state: &'a Mutex<ChainState>,
    chain_id: ResourceId,
    armed: bool,
}

impl MutationGuard<'_> {
    fn release(mut self, state: &mut ChainState) {
        if let Some(mirror) = state.chains.get_mut(&self.chain_id) {
            mirror.phase = ChainPhase::Assembled;
        }
        self.armed = false;
    }
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mirror) = state.chains.get_mut(&self.chain_id) {
            if mirror.phase == ChainPhase::Mutating {
                debug!("Mutation of chain {} abandoned", self.chain_id);
                mirror.phase = ChainPhase::Assembled;
            }
        }
    }
}

/// Creates chain objects and applies full-replace mutations to live chains
#[derive(Clone)]
pub struct ChainAssembler {
    topology: TopologyBuilder,
    state: Arc<Mutex<ChainState>>,
}

impl ChainAssembler {
    pub fn new(topology: TopologyBuilder) -> Self {
        Self {
            topology,
            state: Arc::new(Mutex::new(ChainState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remote(&self) -> &Remote {
        self.topology.remote()
    }

    fn registry(&self) -> &ResourceRegistry {
        self.topology.registry()
    }

    pub fn chain(&self, chain_id: &str) -> Option<PortChain> {
        self.lock().chains.get(chain_id).map(|m| m.chain.clone())
    }

    pub fn phase(&self, chain_id: &str) -> Option<ChainPhase> {
        self.lock().chains.get(chain_id).map(|m| m.phase)
    }

    pub fn stage(&self, stage_id: &str) -> Option<PortPairGroup> {
        self.lock().groups.get(stage_id).cloned()
    }

    pub fn classifier(&self, classifier_id: &str) -> Option<FlowClassifier> {
        self.lock().classifiers.get(classifier_id).cloned()
    }

    // ---- creation ----

    /// Create a chain node steering traffic in through `ingress` and out through `egress`
    pub async fn create_port_pair(&self, ingress: &Port, egress: &Port) -> ProvisionResult<PortPair> {
        self.registry().require(ResourceKind::Port, &ingress.id)?;
        self.registry().require(ResourceKind::Port, &egress.id)?;

        let request = PortPairRequest {
            ingress: ingress.id.clone(),
            egress: egress.id.clone(),
        };
        let body = encode(Operation::Create, ResourceKind::PortPair, &request)?;
        let record = self
            .remote()
            .call(
                Operation::Create,
                ResourceKind::PortPair,
                format!("{}->{}", ingress.id, egress.id),
                self.remote().network().create(ResourceKind::PortPair, body),
            )
            .await?;
        let pair: PortPair = decode(Operation::Create, ResourceKind::PortPair, record)?;
        self.registry().register_id(ResourceKind::PortPair, &pair.id)?;
        debug!("Created port pair {} ({} -> {})", pair.id, pair.ingress, pair.egress);
        self.lock().pairs.insert(pair.id.clone(), pair.clone());
        Ok(pair)
    }

    /// Create a chain stage holding `nodes`
    pub async fn create_port_pair_group(&self, nodes: &[ResourceId]) -> ProvisionResult<PortPairGroup> {
        {
            let state = self.lock();
            if nodes.is_empty() {
                return Err(ProvisionError::EmptyStageNotAllowed {
                    stage: NEW.to_string(),
                    node: "<none>".to_string(),
                });
            }
            for node in nodes {
                if !state.pairs.contains_key(node) {
                    return Err(ProvisionError::dangling(ResourceKind::PortPair, node));
                }
                if let Some(holder) = state.pair_holder(node) {
                    return Err(ProvisionError::ResourceInUse {
                        kind: ResourceKind::PortPair,
                        id: node.clone(),
                        holder,
                    });
                }
            }
        }

        let request = PortPairGroupRequest {
            port_pairs: nodes.to_vec(),
        };
        let body = encode(Operation::Create, ResourceKind::PortPairGroup, &request)?;
        let record = self
            .remote()
            .call(
                Operation::Create,
                ResourceKind::PortPairGroup,
                NEW,
                self.remote().network().create(ResourceKind::PortPairGroup, body),
            )
            .await?;
        let group: PortPairGroup = decode(Operation::Create, ResourceKind::PortPairGroup, record)?;
        self.registry().register_id(ResourceKind::PortPairGroup, &group.id)?;
        info!("Created port pair group {} with {} node(s)", group.id, group.port_pairs.len());
        self.lock().groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    /// Create a flow classifier; the ethertype follows the prefixes unless given
    pub async fn create_flow_classifier(&self, mut spec: ClassifierSpec) -> ProvisionResult<FlowClassifier> {
        for network in [&spec.logical_source_network, &spec.logical_destination_network] {
            if !self.topology.knows_network(network) {
                return Err(ProvisionError::dangling(ResourceKind::Network, network.as_str()));
            }
        }
        spec.ethertype = Some(spec.ethertype.unwrap_or_else(|| Ethertype::of(&spec.source_prefix)));

        let body = encode(Operation::Create, ResourceKind::FlowClassifier, &spec)?;
        let record = self
            .remote()
            .call(
                Operation::Create,
                ResourceKind::FlowClassifier,
                format!("{}->{}", spec.source_prefix, spec.destination_prefix),
                self.remote().network().create(ResourceKind::FlowClassifier, body),
            )
            .await?;
        let classifier: FlowClassifier = decode(Operation::Create, ResourceKind::FlowClassifier, record)?;
        self.registry()
            .register_id(ResourceKind::FlowClassifier, &classifier.id)?;
        debug!(
            "Created {} flow classifier {} ({} -> {})",
            classifier.ethertype.as_str(),
            classifier.id,
            classifier.source_prefix,
            classifier.destination_prefix
        );
        self.lock()
            .classifiers
            .insert(classifier.id.clone(), classifier.clone());
        Ok(classifier)
    }

    fn check_chain_inputs(&self, stages: &[ResourceId], classifiers: &[ResourceId]) -> ProvisionResult<()> {
        let state = self.lock();
        for stage_id in stages {
            let stage = state
                .groups
                .get(stage_id)
                .ok_or_else(|| ProvisionError::dangling(ResourceKind::PortPairGroup, stage_id))?;
            for node_id in &stage.port_pairs {
                let node = state
                    .pairs
                    .get(node_id)
                    .ok_or_else(|| ProvisionError::dangling(ResourceKind::PortPair, node_id))?;
                self.registry().require(ResourceKind::Port, &node.ingress)?;
                self.registry().require(ResourceKind::Port, &node.egress)?;
            }
            if let Some(holder) = state.group_holder(stage_id) {
                return Err(ProvisionError::ResourceInUse {
                    kind: ResourceKind::PortPairGroup,
                    id: stage_id.clone(),
                    holder,
                });
            }
        }
        for classifier_id in classifiers {
            let classifier = state
                .classifiers
                .get(classifier_id)
                .ok_or_else(|| ProvisionError::dangling(ResourceKind::FlowClassifier, classifier_id))?;
            for network in [&classifier.logical_source_network, &classifier.logical_destination_network] {
                if !self.topology.knows_network(network) {
                    return Err(ProvisionError::dangling(ResourceKind::Network, network.as_str()));
                }
            }
            if let Some(holder) = state.classifier_holder(classifier_id) {
                return Err(ProvisionError::ResourceInUse {
                    kind: ResourceKind::FlowClassifier,
                    id: classifier_id.clone(),
                    holder,
                });
            }
        }
        Ok(())
    }

    /// Assemble a chain traversing `stages` in order for traffic matching `classifiers`
    #[instrument(skip(self), fields(stages = stages.len(), classifiers = classifiers.len()))]
    pub async fn create_chain(&self, stages: &[ResourceId], classifiers: &[ResourceId]) -> ProvisionResult<PortChain> {
        if stages.is_empty() {
            return Err(ProvisionError::EmptyChainNotAllowed {
                chain: NEW.to_string(),
            });
        }
        self.check_chain_inputs(stages, classifiers)?;

        let request = PortChainRequest {
            port_pair_groups: stages.to_vec(),
            flow_classifiers: classifiers.to_vec(),
        };
        let body = encode(Operation::Create, ResourceKind::PortChain, &request)?;
        let record = self
            .remote()
            .call(
                Operation::Create,
                ResourceKind::PortChain,
                NEW,
                self.remote().network().create(ResourceKind::PortChain, body),
            )
            .await?;
        let chain: PortChain = decode(Operation::Create, ResourceKind::PortChain, record)?;
        self.registry().register_id(ResourceKind::PortChain, &chain.id)?;
        info!(
            "Assembled port chain {} ({} stage(s), {} classifier(s))",
            chain.id,
            chain.port_pair_groups.len(),
            chain.flow_classifiers.len()
        );
        self.lock().chains.insert(
            chain.id.clone(),
            ChainMirror {
                chain: chain.clone(),
                phase: ChainPhase::Assembled,
            },
        );
        Ok(chain)
    }

    // ---- stage membership ----

    /// Submit a full-replace stage update and commit it locally on success
    async fn replace_stage_members(&self, stage_id: &str, members: Vec<ResourceId>) -> ProvisionResult<PortPairGroup> {
        let chain_id = self.lock().group_holder(stage_id);
        let guard = match chain_id {
            Some(chain_id) => Some(self.begin_mutation(&chain_id)?.0),
            None => None,
        };

        let request = PortPairGroupRequest {
            port_pairs: members.clone(),
        };
        let result = async {
            let body = encode(Operation::Update, ResourceKind::PortPairGroup, &request)?;
            self.remote()
                .call(
                    Operation::Update,
                    ResourceKind::PortPairGroup,
                    stage_id,
                    self.remote()
                        .network()
                        .update(ResourceKind::PortPairGroup, stage_id, body),
                )
                .await
        }
        .await;

        let mut state = self.lock();
        if let Some(guard) = guard {
            guard.release(&mut state);
        }
        match result {
            Ok(_) => {
                let group = state
                    .groups
                    .get_mut(stage_id)
                    .ok_or_else(|| ProvisionError::dangling(ResourceKind::PortPairGroup, stage_id))?;
                group.port_pairs = members;
                Ok(group.clone())
            }
            Err(err) => {
                warn!("Stage {} left unchanged: {}", stage_id, err);
                Err(err)
            }
        }
    }

    /// Add a node to a stage; adding a node the stage already holds is a no-op
    pub async fn add_node_to_stage(&self, stage_id: &str, node_id: &str) -> ProvisionResult<PortPairGroup> {
        let members = {
            let state = self.lock();
            let stage = state
                .groups
                .get(stage_id)
                .ok_or_else(|| ProvisionError::dangling(ResourceKind::PortPairGroup, stage_id))?;
            if !state.pairs.contains_key(node_id) {
                return Err(ProvisionError::dangling(ResourceKind::PortPair, node_id));
            }
            if stage.port_pairs.iter().any(|p| p == node_id) {
                return Ok(stage.clone());
            }
            if let Some(holder) = state.pair_holder(node_id) {
                return Err(ProvisionError::ResourceInUse {
                    kind: ResourceKind::PortPair,
                    id: node_id.to_string(),
                    holder,
                });
            }
            let mut members = stage.port_pairs.clone();
            members.push(node_id.to_string());
            members
        };

        let stage = self.replace_stage_members(stage_id, members).await?;
        info!("Added node {} to stage {}", node_id, stage_id);
        Ok(stage)
    }

    /// Remove a node from a stage; the last node of a stage cannot be removed
    pub async fn remove_node_from_stage(&self, stage_id: &str, node_id: &str) -> ProvisionResult<PortPairGroup> {
        let members = {
            let state = self.lock();
            let stage = state
                .groups
                .get(stage_id)
                .ok_or_else(|| ProvisionError::dangling(ResourceKind::PortPairGroup, stage_id))?;
            if !stage.port_pairs.iter().any(|p| p == node_id) {
                return Err(ProvisionError::dangling(ResourceKind::PortPair, node_id));
            }
            let members: Vec<ResourceId> = stage
                .port_pairs
                .iter()
                .filter(|p| *p != node_id)
                .cloned()
                .collect();
            if members.is_empty() {
                return Err(ProvisionError::EmptyStageNotAllowed {
                    stage: stage_id.to_string(),
                    node: node_id.to_string(),
                });
            }
            members
        };

        let stage = self.replace_stage_members(stage_id, members).await?;
        info!("Removed node {} from stage {}", node_id, stage_id);
        Ok(stage)
    }

    // ---- chain lists ----

    fn begin_mutation(&self, chain_id: &str) -> ProvisionResult<(MutationGuard<'_>, PortChain)> {
        let mut state = self.lock();
        let mirror = state
            .chains
            .get_mut(chain_id)
            .ok_or_else(|| ProvisionError::dangling(ResourceKind::PortChain, chain_id))?;
        if mirror.phase != ChainPhase::Assembled {
            return Err(ProvisionError::InvalidChainState {
                chain: chain_id.to_string(),
                state: mirror.phase.to_string(),
            });
        }
        mirror.phase = ChainPhase::Mutating;
        let guard = MutationGuard {
            state: self.state.as_ref(),
            chain_id: chain_id.to_string(),
            armed: true,
        };
        Ok((guard, mirror.chain.clone()))
    }

    /// Resubmit the whole chain with both lists and commit it locally on success
    async fn replace_chain(
        &self,
        guard: MutationGuard<'_>,
        port_pair_groups: Vec<ResourceId>,
        flow_classifiers: Vec<ResourceId>,
    ) -> ProvisionResult<PortChain> {
        let chain_id = guard.chain_id.clone();
        let request = PortChainRequest {
            port_pair_groups,
            flow_classifiers,
        };
        let result = async {
            let body = encode(Operation::Update, ResourceKind::PortChain, &request)?;
            self.remote()
                .call(
                    Operation::Update,
                    ResourceKind::PortChain,
                    chain_id.as_str(),
                    self.remote().network().update(ResourceKind::PortChain, &chain_id, body),
                )
                .await
        }
        .await;

        let mut state = self.lock();
        guard.release(&mut state);
        let mirror = state
            .chains
            .get_mut(&chain_id)
            .ok_or_else(|| ProvisionError::dangling(ResourceKind::PortChain, &chain_id))?;
        match result {
            Ok(_) => {
                mirror.chain.port_pair_groups = request.port_pair_groups;
                mirror.chain.flow_classifiers = request.flow_classifiers;
                Ok(mirror.chain.clone())
            }
            Err(err) => {
                warn!("Chain {} left unchanged: {}", chain_id, err);
                Err(err)
            }
        }
    }

    /// Bind one more classifier to a live chain
    pub async fn add_classifier(&self, chain_id: &str, classifier_id: &str) -> ProvisionResult<PortChain> {
        {
            let state = self.lock();
            if !state.classifiers.contains_key(classifier_id) {
                return Err(ProvisionError::dangling(ResourceKind::FlowClassifier, classifier_id));
            }
            if let Some(holder) = state.classifier_holder(classifier_id) {
                if holder != chain_id {
                    return Err(ProvisionError::ResourceInUse {
                        kind: ResourceKind::FlowClassifier,
                        id: classifier_id.to_string(),
                        holder,
                    });
                }
            }
        }
        let (guard, chain) = self.begin_mutation(chain_id)?;
        if chain.flow_classifiers.iter().any(|c| c == classifier_id) {
            return Ok(chain);
        }
        let mut classifiers = chain.flow_classifiers;
        classifiers.push(classifier_id.to_string());

        let chain = self.replace_chain(guard, chain.port_pair_groups, classifiers).await?;
        info!("Bound classifier {} to chain {}", classifier_id, chain_id);
        Ok(chain)
    }

    pub async fn remove_classifier(&self, chain_id: &str, classifier_id: &str) -> ProvisionResult<PortChain> {
        let (guard, chain) = self.begin_mutation(chain_id)?;
        if !chain.flow_classifiers.iter().any(|c| c == classifier_id) {
            return Err(ProvisionError::dangling(ResourceKind::FlowClassifier, classifier_id));
        }
        let classifiers: Vec<ResourceId> = chain
            .flow_classifiers
            .into_iter()
            .filter(|c| c != classifier_id)
            .collect();

        let chain = self.replace_chain(guard, chain.port_pair_groups, classifiers).await?;
        info!("Unbound classifier {} from chain {}", classifier_id, chain_id);
        Ok(chain)
    }

    /// Append a stage to the end of a live chain
    pub async fn add_stage(&self, chain_id: &str, stage_id: &str) -> ProvisionResult<PortChain> {
        self.check_chain_inputs(&[stage_id.to_string()], &[])?;
        let (guard, chain) = self.begin_mutation(chain_id)?;
        let mut stages = chain.port_pair_groups;
        stages.push(stage_id.to_string());

        let chain = self.replace_chain(guard, stages, chain.flow_classifiers).await?;
        info!("Appended stage {} to chain {}", stage_id, chain_id);
        Ok(chain)
    }

    /// Drop a stage from a live chain; a chain keeps at least one stage
    pub async fn remove_stage(&self, chain_id: &str, stage_id: &str) -> ProvisionResult<PortChain> {
        let (guard, chain) = self.begin_mutation(chain_id)?;
        if !chain.port_pair_groups.iter().any(|g| g == stage_id) {
            return Err(ProvisionError::dangling(ResourceKind::PortPairGroup, stage_id));
        }
        let stages: Vec<ResourceId> = chain
            .port_pair_groups
            .into_iter()
            .filter(|g| g != stage_id)
            .collect();
        if stages.is_empty() {
            return Err(ProvisionError::EmptyChainNotAllowed {
                chain: chain_id.to_string(),
            });
        }

        let chain = self.replace_chain(guard, stages, chain.flow_classifiers).await?;
        info!("Removed stage {} from chain {}", stage_id, chain_id);
        Ok(chain)
    }

    // ---- deletion ----

    /// Delete the chain object, leaving its stages, nodes and classifiers in place
    pub async fn delete_chain(&self, chain_id: &str) -> ProvisionResult<()> {
        {
            let state = self.lock();
            let mirror = state
                .chains
                .get(chain_id)
                .ok_or_else(|| ProvisionError::dangling(ResourceKind::PortChain, chain_id))?;
            if mirror.phase != ChainPhase::Assembled {
                return Err(ProvisionError::InvalidChainState {
                    chain: chain_id.to_string(),
                    state: mirror.phase.to_string(),
                });
            }
        }
        self.remote()
            .call(
                Operation::Delete,
                ResourceKind::PortChain,
                chain_id,
                self.remote().network().delete(ResourceKind::PortChain, chain_id),
            )
            .await?;
        if let Some(mirror) = self.lock().chains.get_mut(chain_id) {
            mirror.phase = ChainPhase::TornDown;
        }
        info!("Deleted port chain {}", chain_id);
        Ok(())
    }

    pub async fn delete_stage(&self, stage_id: &str) -> ProvisionResult<()> {
        {
            let state = self.lock();
            if !state.groups.contains_key(stage_id) {
                return Err(ProvisionError::dangling(ResourceKind::PortPairGroup, stage_id));
            }
            if let Some(holder) = state.group_holder(stage_id) {
                return Err(ProvisionError::ResourceInUse {
                    kind: ResourceKind::PortPairGroup,
                    id: stage_id.to_string(),
                    holder,
                });
            }
        }
        self.remote()
            .call(
                Operation::Delete,
                ResourceKind::PortPairGroup,
                stage_id,
                self.remote().network().delete(ResourceKind::PortPairGroup, stage_id),
            )
            .await?;
        self.lock().groups.remove(stage_id);
        debug!("Deleted port pair group {}", stage_id);
        Ok(())
    }

    pub async fn delete_node(&self, node_id: &str) -> ProvisionResult<()> {
        {
            let state = self.lock();
            if !state.pairs.contains_key(node_id) {
                return Err(ProvisionError::dangling(ResourceKind::PortPair, node_id));
            }
            if let Some(holder) = state.pair_holder(node_id) {
                return Err(ProvisionError::ResourceInUse {
                    kind: ResourceKind::PortPair,
                    id: node_id.to_string(),
                    holder,
                });
            }
        }
        self.remote()
            .call(
                Operation::Delete,
                ResourceKind::PortPair,
                node_id,
                self.remote().network().delete(ResourceKind::PortPair, node_id),
            )
            .await?;
        self.lock().pairs.remove(node_id);
        debug!("Deleted port pair {}", node_id);
        Ok(())
    }

    pub async fn delete_classifier(&self, classifier_id: &str) -> ProvisionResult<()> {
        {
            let state = self.lock();
            if !state.classifiers.contains_key(classifier_id) {
                return Err(ProvisionError::dangling(ResourceKind::FlowClassifier, classifier_id));
            }
            if let Some(holder) = state.classifier_holder(classifier_id) {
                return Err(ProvisionError::ResourceInUse {
                    kind: ResourceKind::FlowClassifier,
                    id: classifier_id.to_string(),
                    holder,
                });
            }
        }
        self.remote()
            .call(
                Operation::Delete,
                ResourceKind::FlowClassifier,
                classifier_id,
                self.remote()
                    .network()
                    .delete(ResourceKind::FlowClassifier, classifier_id),
            )
            .await?;
        self.lock().classifiers.remove(classifier_id);
        debug!("Deleted flow classifier {}", classifier_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cidr::CidrPool;
    use crate::simulator::Simulator;
    use sfcrig_shared::errors::RemoteError;
    use serde_json::json;
    use sfcrig_shared::model::{Network, NetworkOptions, PortOptions, SubnetOptions};
    use std::time::Duration;

    struct Fixture {
        sim: Arc<Simulator>,
        topo: TopologyBuilder,
        chains: ChainAssembler,
        left: Network,
        right: Network,
    }

    async fn fixture() -> Fixture {
        let sim = Arc::new(Simulator::new());
        let remote = Remote::new(sim.clone(), sim.clone(), sim.clone(), Duration::from_secs(1));
        let cidrs = CidrPool::isolated("10.70.0.0/24".parse().unwrap(), "fd00:70::/64".parse().unwrap());
        let topo = TopologyBuilder::new(remote, ResourceRegistry::new(), cidrs);
        let (left, _) = topo
            .create_network_and_subnets(NetworkOptions::vlan(), SubnetOptions::default(), 1, false)
            .await
            .unwrap();
        let (right, _) = topo
            .create_network_and_subnets(NetworkOptions::vlan(), SubnetOptions::default(), 1, false)
            .await
            .unwrap();
        let chains = ChainAssembler::new(topo.clone());
        Fixture {
            sim,
            topo,
            chains,
            left,
            right,
        }
    }

    impl Fixture {
        async fn node(&self) -> PortPair {
            let ingress = self
                .topo
                .create_port(&self.left.id, PortOptions::insecure())
                .await
                .unwrap();
            let egress = self
                .topo
                .create_port(&self.right.id, PortOptions::insecure())
                .await
                .unwrap();
            self.chains.create_port_pair(&ingress, &egress).await.unwrap()
        }

        async fn classifier(&self, src: &str, dest: &str) -> FlowClassifier {
            self.chains
                .create_flow_classifier(ClassifierSpec {
                    source_prefix: src.parse().unwrap(),
                    destination_prefix: dest.parse().unwrap(),
                    logical_source_network: self.left.id.clone(),
                    logical_destination_network: self.right.id.clone(),
                    ethertype: None,
                })
                .await
                .unwrap()
        }

        async fn chain(&self) -> (PortChain, PortPairGroup, FlowClassifier) {
            let node = self.node().await;
            let stage = self.chains.create_port_pair_group(&[node.id]).await.unwrap();
            let fc = self.classifier("10.0.1.0/24", "192.168.200.0/24").await;
            let chain = self
                .chains
                .create_chain(&[stage.id.clone()], &[fc.id.clone()])
                .await
                .unwrap();
            (chain, stage, fc)
        }
    }

    #[tokio::test]
    async fn test_classifier_ethertype_is_derived() {
        let f = fixture().await;
        let fc = f.classifier("2001:db8:1::/64", "2001:db8:2::/64").await;
        assert_eq!(fc.ethertype, Ethertype::IPv6);
    }

    #[tokio::test]
    async fn test_create_chain_rejects_unknown_stage() {
        let f = fixture().await;
        let calls = f.sim.call_count();
        let err = f.chains.create_chain(&["ghost".to_string()], &[]).await.unwrap_err();
        assert!(matches!(err, ProvisionError::DanglingReference { kind: ResourceKind::PortPairGroup, .. }));
        assert_eq!(f.sim.call_count(), calls);
    }

    #[tokio::test]
    async fn test_add_node_commits_after_remote_success() {
        let f = fixture().await;
        let (chain, stage, _) = f.chain().await;
        let extra = f.node().await;

        let updated = f.chains.add_node_to_stage(&stage.id, &extra.id).await.unwrap();
        assert_eq!(updated.port_pairs.len(), 2);
        assert_eq!(f.chains.stage(&stage.id).unwrap().port_pairs.len(), 2);
        assert_eq!(f.chains.phase(&chain.id), Some(ChainPhase::Assembled));
    }

    #[tokio::test]
    async fn test_failed_add_node_leaves_mirror_unchanged() {
        let f = fixture().await;
        let (chain, stage, _) = f.chain().await;
        let extra = f.node().await;
        let before = f.chains.stage(&stage.id).unwrap();

        f.sim.fail_next(
            Operation::Update,
            ResourceKind::PortPairGroup,
            RemoteError::transport("connection reset"),
        );
        let err = f.chains.add_node_to_stage(&stage.id, &extra.id).await.unwrap_err();
        assert!(matches!(err, ProvisionError::RemoteOperationFailed { .. }));
        assert_eq!(f.chains.stage(&stage.id).unwrap(), before);
        assert_eq!(f.chains.phase(&chain.id), Some(ChainPhase::Assembled));
    }

    #[tokio::test]
    async fn test_removing_last_node_is_rejected_locally() {
        let f = fixture().await;
        let (_, stage, _) = f.chain().await;
        let calls = f.sim.call_count();
        let err = f
            .chains
            .remove_node_from_stage(&stage.id, &stage.port_pairs[0])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::EmptyStageNotAllowed { .. }));
        assert_eq!(f.sim.call_count(), calls);
    }

    #[tokio::test]
    async fn test_classifier_add_and_remove() {
        let f = fixture().await;
        let (chain, _, first) = f.chain().await;
        let second = f.classifier("10.0.2.0/24", "192.168.201.0/24").await;

        let updated = f.chains.add_classifier(&chain.id, &second.id).await.unwrap();
        assert_eq!(updated.flow_classifiers, vec![first.id.clone(), second.id.clone()]);

        let updated = f.chains.remove_classifier(&chain.id, &first.id).await.unwrap();
        assert_eq!(updated.flow_classifiers, vec![second.id.clone()]);
        f.chains.delete_classifier(&first.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_chain_updates_resend_both_lists() {
        let f = fixture().await;
        let (chain, stage, first) = f.chain().await;
        let second = f.classifier("10.0.2.0/24", "192.168.201.0/24").await;
        let node = f.node().await;
        let extra = f.chains.create_port_pair_group(&[node.id]).await.unwrap();

        f.chains.add_classifier(&chain.id, &second.id).await.unwrap();
        f.chains.add_stage(&chain.id, &extra.id).await.unwrap();
        f.chains.remove_classifier(&chain.id, &first.id).await.unwrap();

        let bodies: Vec<_> = f
            .sim
            .update_bodies(ResourceKind::PortChain)
            .into_iter()
            .map(|(id, body)| {
                assert_eq!(id, chain.id);
                body
            })
            .collect();
        assert_eq!(
            bodies,
            vec![
                json!({
                    "port_pair_groups": [stage.id.clone()],
                    "flow_classifiers": [first.id.clone(), second.id.clone()],
                }),
                json!({
                    "port_pair_groups": [stage.id.clone(), extra.id.clone()],
                    "flow_classifiers": [first.id.clone(), second.id.clone()],
                }),
                json!({
                    "port_pair_groups": [stage.id.clone(), extra.id.clone()],
                    "flow_classifiers": [second.id.clone()],
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_mutation_releases_chain() {
        let f = fixture().await;
        let (chain, _, first) = f.chain().await;
        let second = f.classifier("10.0.2.0/24", "192.168.201.0/24").await;

        f.sim
            .delay(Operation::Update, ResourceKind::PortChain, Duration::from_millis(500));
        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            f.chains.add_classifier(&chain.id, &second.id),
        )
        .await;
        assert!(cancelled.is_err());

        assert_eq!(f.chains.phase(&chain.id), Some(ChainPhase::Assembled));
        assert_eq!(f.chains.chain(&chain.id).unwrap().flow_classifiers, vec![first.id]);
        f.chains.delete_chain(&chain.id).await.unwrap();
        assert_eq!(f.chains.phase(&chain.id), Some(ChainPhase::TornDown));
    }

    #[tokio::test]
    async fn test_stage_add_and_remove() {
        let f = fixture().await;
        let (chain, first, _) = f.chain().await;
        let node = f.node().await;
        let second = f.chains.create_port_pair_group(&[node.id]).await.unwrap();

        let updated = f.chains.add_stage(&chain.id, &second.id).await.unwrap();
        assert_eq!(updated.port_pair_groups, vec![first.id.clone(), second.id.clone()]);
        f.chains.remove_stage(&chain.id, &first.id).await.unwrap();
        assert!(matches!(
            f.chains.remove_stage(&chain.id, &second.id).await,
            Err(ProvisionError::EmptyChainNotAllowed { .. })
        ));
        assert_eq!(f.chains.phase(&chain.id), Some(ChainPhase::Assembled));
    }

    #[tokio::test]
    async fn test_delete_order_is_enforced() {
        let f = fixture().await;
        let (chain, stage, fc) = f.chain().await;

        assert!(matches!(
            f.chains.delete_stage(&stage.id).await,
            Err(ProvisionError::ResourceInUse { .. })
        ));
        assert!(matches!(
            f.chains.delete_node(&stage.port_pairs[0]).await,
            Err(ProvisionError::ResourceInUse { .. })
        ));

        f.chains.delete_chain(&chain.id).await.unwrap();
        assert_eq!(f.chains.phase(&chain.id), Some(ChainPhase::TornDown));
        assert!(matches!(
            f.chains.add_classifier(&chain.id, &fc.id).await,
            Err(ProvisionError::InvalidChainState { .. })
        ));

        f.chains.delete_stage(&stage.id).await.unwrap();
        f.chains.delete_node(&stage.port_pairs[0]).await.unwrap();
        f.chains.delete_classifier(&fc.id).await.unwrap();
    }
}
