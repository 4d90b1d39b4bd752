//! Built-in scenario templates.
//!
//! One template per flow, parameterized the way the scenario suite runs them
//! against a lab cloud: the `public` external network for VM access, CirrOS
//! guests and the 192.168.200.0/24 destination with three probe addresses.

use std::collections::HashMap;
use tracing::info;

use sfcrig_shared::scenario::{
    Credentials, ScenarioDefinition, ScenarioKind, ScenarioMetadata, ScenarioParams,
};

/// External network the templates give every VM an access port on
pub const TEMPLATE_PUBLIC_NETWORK: &str = "public";

/// Settle delay after chain programming, in milliseconds
const CHAIN_SETTLE_MS: u64 = 30_000;

/// Manager for built-in scenario templates
pub struct BuiltinScenarioTemplates {
    templates: HashMap<String, ScenarioDefinition>,
}

impl Default for BuiltinScenarioTemplates {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinScenarioTemplates {
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        for kind in ScenarioKind::ALL {
            let template = Self::create_template(kind);
            templates.insert(template.id.clone(), template);
        }
        info!("Loaded {} built-in scenario templates", templates.len());
        Self { templates }
    }

    /// Every template, sorted by id
    pub fn get_all_templates(&self) -> Vec<ScenarioDefinition> {
        let mut templates: Vec<ScenarioDefinition> = self.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    pub fn get_template(&self, id: &str) -> Option<ScenarioDefinition> {
        self.templates.get(id).cloned()
    }

    pub fn get_template_ids(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    fn base_params() -> ScenarioParams {
        ScenarioParams {
            public_network: Some(TEMPLATE_PUBLIC_NETWORK.to_string()),
            credentials: Credentials {
                username: "cirros".to_string(),
                password: Some("gocubsgo".to_string()),
            },
            ..ScenarioParams::default()
        }
    }

    fn metadata(tags: &[&str]) -> ScenarioMetadata {
        ScenarioMetadata {
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            author: Some("sfcrig built-in templates".to_string()),
            version: "1.0".to_string(),
        }
    }

    fn create_template(kind: ScenarioKind) -> ScenarioDefinition {
        let mut params = Self::base_params();
        let (name, description, tags, settle_ms) = match kind {
            ScenarioKind::SfcAddPortpair => {
                params.service_functions = 3;
                (
                    "SFC: add port pair",
                    "Three parallel VNFs in one stage, then a fourth added to the live chain",
                    &["sfc", "parallel", "mutation"][..],
                    CHAIN_SETTLE_MS,
                )
            }
            ScenarioKind::SfcRemoveService => (
                "SFC: remove service",
                "Two services in series, then the second removed from the live chain",
                &["sfc", "series", "mutation"][..],
                CHAIN_SETTLE_MS,
            ),
            ScenarioKind::SfcAddFlowclassifier => (
                "SFC: add flow classifier",
                "Single-service chain bound to a test network, then a second classifier added",
                &["sfc", "classifier", "mutation"][..],
                CHAIN_SETTLE_MS,
            ),
            ScenarioKind::SfcMultiSeries => {
                params.service_functions = 3;
                (
                    "SFC: multiple services in series",
                    "Three single-node stages traversed one after another",
                    &["sfc", "series"][..],
                    CHAIN_SETTLE_MS,
                )
            }
            ScenarioKind::SfcSingleParallel => {
                params.service_functions = 2;
                (
                    "SFC: single stage, parallel nodes",
                    "One stage load-balancing over two equivalent VNFs",
                    &["sfc", "parallel"][..],
                    CHAIN_SETTLE_MS,
                )
            }
            ScenarioKind::TrunkSubportLifecycle => {
                params.trunk_cidrs = ["10.10.10.0/24", "10.10.20.0/24", "10.10.30.0/24"]
                    .iter()
                    .map(|cidr| cidr.parse().expect("Trunk template prefixes are valid literals"))
                    .collect();
                (
                    "Trunk: subport lifecycle",
                    "Two VLAN subports reach peer networks, then one moves to a second trunk",
                    &["trunk", "vlan", "mutation"][..],
                    0,
                )
            }
            ScenarioKind::SviUplink => {
                params.fabric_nodes = vec!["node-101".to_string(), "node-102".to_string()];
                params.svi_prefix = Some("192.168.10.0/24".parse().expect("SVI template prefix is a valid literal"));
                params.bgp_asn = Some(10);
                (
                    "SVI: fabric uplinks",
                    "BGP-enabled SVI network with one uplink port per fabric node",
                    &["svi", "bgp", "fabric"][..],
                    0,
                )
            }
            ScenarioKind::MultiTenantSfc => {
                params.tenants = vec!["tenant-a".to_string(), "tenant-b".to_string()];
                (
                    "SFC: multi-tenant",
                    "A project, a user and an independent chain for each tenant",
                    &["sfc", "multi-tenant", "identity"][..],
                    CHAIN_SETTLE_MS,
                )
            }
        };

        ScenarioDefinition {
            id: kind.as_str().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            kind,
            params,
            settle_ms,
            metadata: Self::metadata(tags),
        }
    }
}
