//! JSON5 parsing for scenario files.
//!
//! Every parameter is optional in the file and falls back to
//! [`ScenarioParams::default`]. Prefixes and addresses are written as plain
//! strings ("10.0.1.0/24", "2001:db8::1") and validated during conversion so
//! errors can name the offending field.
//!
//! Duration strings are supported using the `duration-string` crate format:
//! "50ms", "5s", "1m", "1h", "5m30s", etc.

use duration_string::DurationString;
use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;

use crate::scenario::{
    Credentials, ScenarioDefinition, ScenarioKind, ScenarioMetadata, ScenarioParams,
};

/// Parse a duration string like "50ms", "5s", "1m", "1h" into milliseconds
pub fn parse_duration_string(s: &str) -> Result<u64, String> {
    let duration: DurationString = s
        .trim()
        .parse()
        .map_err(|e| format!("Invalid duration '{}': {}", s, e))?;

    let std_duration: std::time::Duration = duration.into();
    Ok(std_duration.as_millis() as u64)
}

/// Error type for scenario JSON5 parsing
#[derive(Debug)]
pub enum ScenarioParseError {
    /// JSON5 parsing error
    Json5Error(String),
    /// Validation error after parsing
    ValidationError(String),
    /// File I/O error
    IoError(String),
}

impl std::fmt::Display for ScenarioParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioParseError::Json5Error(msg) => write!(f, "JSON5 parse error: {}", msg),
            ScenarioParseError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            ScenarioParseError::IoError(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for ScenarioParseError {}

impl From<std::io::Error> for ScenarioParseError {
    fn from(err: std::io::Error) -> Self {
        ScenarioParseError::IoError(err.to_string())
    }
}

/// Intermediate struct for JSON5 deserialization of a scenario file
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: ScenarioKind,
    /// Settle delay as a duration string
    #[serde(default)]
    pub settle: Option<String>,
    #[serde(default)]
    pub params: ScenarioParamsJson,
    #[serde(default)]
    pub metadata: ScenarioMetadataJson,
}

/// Intermediate struct for scenario metadata
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScenarioMetadataJson {
    #[serde(default)]
    pub tags: Vec<String>,
    pub author: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Intermediate struct for scenario parameters, every field optional
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScenarioParamsJson {
    pub src_cidr: Option<String>,
    pub dest_cidr: Option<String>,
    pub ipv6_src_cidr: Option<String>,
    pub ipv6_dest_cidr: Option<String>,
    pub dual_stack: Option<bool>,
    pub vm_image: Option<String>,
    pub service_image: Option<String>,
    pub flavor: Option<String>,
    pub public_network: Option<String>,
    pub key_name: Option<String>,
    pub service_functions: Option<usize>,
    #[serde(default)]
    pub trunk_cidrs: Vec<String>,
    #[serde(default)]
    pub fabric_nodes: Vec<String>,
    pub svi_prefix: Option<String>,
    pub bgp_asn: Option<u32>,
    #[serde(default)]
    pub tenants: Vec<String>,
    pub credentials: Option<Credentials>,
    pub probe_addresses: Option<Vec<String>>,
}

fn parse_prefix(field: &str, value: &str) -> Result<IpNet, ScenarioParseError> {
    value.trim().parse::<IpNet>().map_err(|e| {
        ScenarioParseError::ValidationError(format!("Invalid prefix '{}' in {}: {}", value, field, e))
    })
}

fn parse_address(field: &str, value: &str) -> Result<IpAddr, ScenarioParseError> {
    value.trim().parse::<IpAddr>().map_err(|e| {
        ScenarioParseError::ValidationError(format!("Invalid address '{}' in {}: {}", value, field, e))
    })
}

impl ScenarioParamsJson {
    /// Overlay the fields present in the file onto the defaults
    pub fn to_params(self) -> Result<ScenarioParams, ScenarioParseError> {
        let mut params = ScenarioParams::default();

        if let Some(cidr) = &self.src_cidr {
            params.src_cidr = parse_prefix("src_cidr", cidr)?;
        }
        if let Some(cidr) = &self.dest_cidr {
            params.dest_cidr = parse_prefix("dest_cidr", cidr)?;
        }
        params.ipv6_src_cidr = self
            .ipv6_src_cidr
            .as_deref()
            .map(|cidr| parse_prefix("ipv6_src_cidr", cidr))
            .transpose()?;
        params.ipv6_dest_cidr = self
            .ipv6_dest_cidr
            .as_deref()
            .map(|cidr| parse_prefix("ipv6_dest_cidr", cidr))
            .transpose()?;
        params.svi_prefix = self
            .svi_prefix
            .as_deref()
            .map(|cidr| parse_prefix("svi_prefix", cidr))
            .transpose()?;
        params.trunk_cidrs = self
            .trunk_cidrs
            .iter()
            .map(|cidr| parse_prefix("trunk_cidrs", cidr))
            .collect::<Result<_, _>>()?;
        if let Some(addresses) = &self.probe_addresses {
            params.probe_addresses = addresses
                .iter()
                .map(|addr| parse_address("probe_addresses", addr))
                .collect::<Result<_, _>>()?;
        }

        if let Some(dual_stack) = self.dual_stack {
            params.dual_stack = dual_stack;
        }
        if let Some(image) = self.vm_image {
            params.vm_image = image;
        }
        if let Some(image) = self.service_image {
            params.service_image = image;
        }
        if let Some(flavor) = self.flavor {
            params.flavor = flavor;
        }
        if let Some(count) = self.service_functions {
            params.service_functions = count;
        }
        if let Some(credentials) = self.credentials {
            params.credentials = credentials;
        }
        params.public_network = self.public_network;
        params.key_name = self.key_name;
        params.fabric_nodes = self.fabric_nodes;
        params.bgp_asn = self.bgp_asn;
        params.tenants = self.tenants;

        Ok(params)
    }
}

impl ScenarioFile {
    /// Convert to a validated ScenarioDefinition
    pub fn to_definition(self) -> Result<ScenarioDefinition, ScenarioParseError> {
        let settle_ms = match &self.settle {
            Some(settle) => parse_duration_string(settle).map_err(|e| {
                ScenarioParseError::ValidationError(format!("Invalid settle delay: {}", e))
            })?,
            None => 0,
        };

        let definition = ScenarioDefinition {
            id: self.id,
            name: self.name,
            description: self.description,
            kind: self.kind,
            params: self.params.to_params()?,
            settle_ms,
            metadata: ScenarioMetadata {
                tags: self.metadata.tags,
                author: self.metadata.author,
                version: self.metadata.version,
            },
        };

        definition
            .validate()
            .map_err(ScenarioParseError::ValidationError)?;
        Ok(definition)
    }
}

/// Parse a scenario from a JSON5 string
pub fn parse_scenario_json5(json5_content: &str) -> Result<ScenarioFile, ScenarioParseError> {
    json5::from_str(json5_content).map_err(|e| ScenarioParseError::Json5Error(e.to_string()))
}

/// Parse and convert a scenario from a JSON5 string
pub fn parse_scenario(json5_content: &str) -> Result<ScenarioDefinition, ScenarioParseError> {
    let scenario_file = parse_scenario_json5(json5_content)?;
    scenario_file.to_definition()
}

/// Parse a scenario from a file path
pub fn parse_scenario_file(path: &std::path::Path) -> Result<ScenarioDefinition, ScenarioParseError> {
    let content = std::fs::read_to_string(path)?;
    parse_scenario(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_string_formats() {
        assert_eq!(parse_duration_string("500ms").unwrap(), 500);
        assert_eq!(parse_duration_string("30s").unwrap(), 30000);
        assert_eq!(parse_duration_string("1m30s").unwrap(), 90000);
        assert_eq!(parse_duration_string(" 5s ").unwrap(), 5000);
        assert!(parse_duration_string("soon").is_err());
    }

    #[test]
    fn test_parse_minimal_scenario_uses_defaults() {
        let json5 = r#"
        {
            // comments are allowed
            id: "pp",
            name: "Add port pair",
            kind: "sfc-add-portpair",
        }
        "#;

        let scenario = parse_scenario(json5).unwrap();
        assert_eq!(scenario.kind, ScenarioKind::SfcAddPortpair);
        assert_eq!(scenario.settle_ms, 0);
        assert_eq!(scenario.params, ScenarioParams::default());
        assert_eq!(scenario.metadata.version, "1.0");
    }

    #[test]
    fn test_parse_full_trunk_scenario() {
        let json5 = r#"
        {
            id: "trunk",
            name: "Trunk lifecycle",
            kind: "trunk-subport-lifecycle",
            settle: "2s",
            params: {
                src_cidr: "10.0.5.0/24",
                trunk_cidrs: ["10.10.0.0/24", "10.20.0.0/24", "10.30.0.0/24"],
                public_network: "public",
                credentials: { username: "ubuntu" },
                probe_addresses: ["10.10.0.1"],
            },
            metadata: { tags: ["trunk"], author: "ops", version: "2.0" },
        }
        "#;

        let scenario = parse_scenario(json5).unwrap();
        assert_eq!(scenario.settle_ms, 2000);
        assert_eq!(scenario.params.trunk_cidrs.len(), 3);
        assert_eq!(scenario.params.public_network.as_deref(), Some("public"));
        assert_eq!(scenario.params.credentials.username, "ubuntu");
        assert_eq!(scenario.params.probe_addresses.len(), 1);
        assert_eq!(scenario.metadata.tags, vec!["trunk"]);
    }

    #[test]
    fn test_invalid_prefix_names_field() {
        let json5 = r#"
        { id: "x", name: "X", kind: "sfc-single-parallel", params: { dest_cidr: "not-a-cidr" } }
        "#;

        match parse_scenario(json5) {
            Err(ScenarioParseError::ValidationError(msg)) => assert!(msg.contains("dest_cidr")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_is_json5_error() {
        let json5 = r#"{ id: "x", name: "X", kind: "sfc-teleport" }"#;
        assert!(matches!(
            parse_scenario(json5),
            Err(ScenarioParseError::Json5Error(_))
        ));
    }

    #[test]
    fn test_semantic_validation_runs_after_conversion() {
        let json5 = r#"{ id: "svi", name: "SVI", kind: "svi-uplink", params: { fabric_nodes: ["leaf-101"] } }"#;
        match parse_scenario(json5) {
            Err(ScenarioParseError::ValidationError(msg)) => assert!(msg.contains("svi_prefix")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_settle_duration() {
        let json5 = r#"{ id: "x", name: "X", kind: "sfc-multi-series", settle: "forever" }"#;
        assert!(matches!(
            parse_scenario(json5),
            Err(ScenarioParseError::ValidationError(_))
        ));
    }
}
