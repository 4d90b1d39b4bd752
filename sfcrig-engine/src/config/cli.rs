//! CLI argument parsing for the sfcrig runner.
//!
//! Parses the command line with clap into a plain [`CliConfig`]. Duration
//! flags accept the same strings as scenario files ("500ms", "30s", "2m").

use anyhow::{Result, anyhow};
use clap::{Arg, ArgMatches, Command};

use sfcrig_shared::scenario_json::parse_duration_string;

/// Parsed command line
#[derive(Debug, Clone, PartialEq)]
pub struct CliConfig {
    pub verbose: bool,
    pub scenario_dirs: Vec<String>,
    pub no_default_scenarios: bool,
    pub no_templates: bool,
    pub list: bool,
    pub scenario: Option<String>,
    /// Per-call timeout in milliseconds
    pub call_timeout_ms: Option<u64>,
    /// VM readiness deadline in milliseconds
    pub ready_timeout_ms: Option<u64>,
    /// Settle delay override in milliseconds
    pub settle_ms: Option<u64>,
    pub dry_run: bool,
    pub ssh_user: String,
    pub ssh_key: Option<String>,
}

impl CliConfig {
    pub fn from_args() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches)
    }

    /// Build from pre-parsed matches
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let scenario_dirs: Vec<String> = matches
            .get_many::<String>("scenario-dir")
            .map(|vals| vals.cloned().collect())
            .unwrap_or_default();

        let ssh_user = matches
            .get_one::<String>("ssh-user")
            .ok_or_else(|| anyhow!("SSH user is required"))?
            .clone();

        Ok(Self {
            verbose: matches.get_flag("verbose"),
            scenario_dirs,
            no_default_scenarios: matches.get_flag("no-default-scenarios"),
            no_templates: matches.get_flag("no-templates"),
            list: matches.get_flag("list"),
            scenario: matches.get_one::<String>("scenario").cloned(),
            call_timeout_ms: duration_arg(matches, "call-timeout")?,
            ready_timeout_ms: duration_arg(matches, "ready-timeout")?,
            settle_ms: duration_arg(matches, "settle")?,
            dry_run: matches.get_flag("dry-run"),
            ssh_user,
            ssh_key: matches.get_one::<String>("ssh-key").cloned(),
        })
    }

    pub fn build_cli() -> Command {
        Command::new("sfcrig")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Provision service-chain test topologies and tear them down again")
            .long_about(
                "Builds networks, VMs, VLAN trunks and service function chains for a scenario, \
                 checks traffic from inside the guests and deletes everything it created in \
                 dependency order, whether the scenario passed or not.",
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(clap::ArgAction::SetTrue)
                    .help("Enable verbose logging"),
            )
            .arg(
                Arg::new("list")
                    .short('l')
                    .long("list")
                    .action(clap::ArgAction::SetTrue)
                    .conflicts_with("scenario")
                    .help("List available scenarios and exit"),
            )
            .arg(
                Arg::new("scenario")
                    .short('s')
                    .long("scenario")
                    .value_name("ID")
                    .help("Scenario to run"),
            )
            .arg(
                Arg::new("scenario-dir")
                    .long("scenario-dir")
                    .value_name("DIRECTORY")
                    .action(clap::ArgAction::Append)
                    .help("Additional directory to load scenario files from")
                    .long_help(
                        "Additional directory to scan for .json5 scenario files. Can be given \
                         several times; later directories override scenarios with the same id. \
                         Default directories: /usr/share/sfcrig/scenarios, \
                         ~/.config/sfcrig/scenarios, ./scenarios",
                    ),
            )
            .arg(
                Arg::new("no-default-scenarios")
                    .long("no-default-scenarios")
                    .action(clap::ArgAction::SetTrue)
                    .help("Only load scenarios from --scenario-dir"),
            )
            .arg(
                Arg::new("no-templates")
                    .long("no-templates")
                    .action(clap::ArgAction::SetTrue)
                    .help("Do not offer the built-in scenario templates"),
            )
            .arg(
                Arg::new("call-timeout")
                    .long("call-timeout")
                    .value_name("DURATION")
                    .help("Upper bound for a single control-plane call, e.g. 60s"),
            )
            .arg(
                Arg::new("ready-timeout")
                    .long("ready-timeout")
                    .value_name("DURATION")
                    .help("How long to wait for a VM to become active, e.g. 5m"),
            )
            .arg(
                Arg::new("settle")
                    .long("settle")
                    .value_name("DURATION")
                    .help("Override the scenario's settle delay after chain changes"),
            )
            .arg(
                Arg::new("dry-run")
                    .long("dry-run")
                    .action(clap::ArgAction::SetTrue)
                    .help("Run against the in-memory cloud with scripted guests"),
            )
            .arg(
                Arg::new("ssh-user")
                    .long("ssh-user")
                    .value_name("USER")
                    .default_value("cirros")
                    .help("Login used for commands inside guest VMs"),
            )
            .arg(
                Arg::new("ssh-key")
                    .long("ssh-key")
                    .value_name("PATH")
                    .help("Private key for guest logins"),
            )
    }

    pub fn validate(&self) -> Result<()> {
        if !self.list && self.scenario.is_none() {
            return Err(anyhow!("Either --list or --scenario <ID> is required"));
        }
        if self.ssh_user.trim().is_empty() {
            return Err(anyhow!("SSH user cannot be empty"));
        }
        if self.call_timeout_ms == Some(0) || self.ready_timeout_ms == Some(0) {
            return Err(anyhow!("Timeouts must be greater than 0"));
        }
        Ok(())
    }
}

fn duration_arg(matches: &ArgMatches, name: &str) -> Result<Option<u64>> {
    matches
        .get_one::<String>(name)
        .map(|value| parse_duration_string(value).map_err(|e| anyhow!("--{}: {}", name, e)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliConfig> {
        let matches = CliConfig::build_cli().try_get_matches_from(args.iter().copied())?;
        CliConfig::from_matches(&matches)
    }

    #[test]
    fn test_cli_defaults() {
        let config = parse(&["sfcrig", "--list"]).unwrap();

        assert!(config.list);
        assert!(!config.verbose);
        assert!(!config.dry_run);
        assert!(config.scenario.is_none());
        assert!(config.scenario_dirs.is_empty());
        assert_eq!(config.ssh_user, "cirros");
        assert_eq!(config.call_timeout_ms, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_custom_values() {
        let config = parse(&[
            "sfcrig",
            "-v",
            "--scenario",
            "trunk-subport-lifecycle",
            "--scenario-dir",
            "/lab/scenarios",
            "--scenario-dir",
            "/more",
            "--no-default-scenarios",
            "--call-timeout",
            "90s",
            "--ready-timeout",
            "5m",
            "--settle",
            "500ms",
            "--dry-run",
            "--ssh-user",
            "ubuntu",
            "--ssh-key",
            "/keys/lab",
        ])
        .unwrap();

        assert!(config.verbose);
        assert!(config.dry_run);
        assert!(config.no_default_scenarios);
        assert_eq!(config.scenario.as_deref(), Some("trunk-subport-lifecycle"));
        assert_eq!(config.scenario_dirs, vec!["/lab/scenarios", "/more"]);
        assert_eq!(config.call_timeout_ms, Some(90_000));
        assert_eq!(config.ready_timeout_ms, Some(300_000));
        assert_eq!(config.settle_ms, Some(500));
        assert_eq!(config.ssh_user, "ubuntu");
        assert_eq!(config.ssh_key.as_deref(), Some("/keys/lab"));
    }

    #[test]
    fn test_cli_rejects_bad_duration() {
        let err = parse(&["sfcrig", "--scenario", "x", "--settle", "soon"]).unwrap_err();
        assert!(err.to_string().contains("--settle"));
    }

    #[test]
    fn test_cli_needs_an_action() {
        let config = parse(&["sfcrig"]).unwrap();
        assert!(config.validate().is_err());
        assert!(parse(&["sfcrig", "--list", "--scenario", "x"]).is_err());
    }
}
