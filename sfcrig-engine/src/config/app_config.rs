//! Application configuration for the sfcrig runner.
//!
//! Turns the parsed command line into run settings: logging, where scenarios
//! come from, provisioner timeouts and how guests are reached.

use anyhow::{Result, anyhow};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use super::cli::CliConfig;
use crate::cidr::CidrPool;
use crate::client::{ComputeApi, IdentityApi, NetworkApi};
use crate::remote_exec::{RemoteExecutor, ScriptedExecutor, SshExecutor};
use crate::scenario::{RunOverrides, ScenarioLoader};
use crate::services::{Provisioner, ProvisionerSettings};
use crate::utils::readiness::PollPolicy;

/// Crates too chatty at debug level
const QUIET_CRATES: &str = "tokio=warn,mio=warn";

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter_string(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// What the invocation should do
#[derive(Debug, Clone, PartialEq)]
pub enum RunMode {
    List,
    Run(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: LogLevel,
    pub mode: RunMode,
    pub scenario_dirs: Vec<PathBuf>,
    pub no_default_scenarios: bool,
    pub include_templates: bool,
    pub provisioner: ProvisionerSettings,
    pub overrides: RunOverrides,
    pub dry_run: bool,
    pub ssh_user: String,
    pub ssh_key: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_cli(cli_config: &CliConfig) -> Result<Self> {
        cli_config.validate()?;

        let log_level = if cli_config.verbose {
            LogLevel::Debug
        } else {
            env::var("RUST_LOG")
                .map(|level| Self::parse_log_level(&level))
                .unwrap_or(LogLevel::Info)
        };

        let mode = match &cli_config.scenario {
            Some(id) if !cli_config.list => RunMode::Run(id.clone()),
            _ => RunMode::List,
        };

        let mut provisioner = if cli_config.dry_run {
            ProvisionerSettings::simulated()
        } else {
            ProvisionerSettings::default()
        };
        if let Some(ms) = cli_config.call_timeout_ms {
            provisioner.call_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = cli_config.ready_timeout_ms {
            provisioner.readiness = PollPolicy {
                deadline: Duration::from_millis(ms),
                ..provisioner.readiness
            };
        }

        Ok(Self {
            log_level,
            mode,
            scenario_dirs: cli_config.scenario_dirs.iter().map(PathBuf::from).collect(),
            no_default_scenarios: cli_config.no_default_scenarios,
            include_templates: !cli_config.no_templates,
            provisioner,
            overrides: RunOverrides {
                settle_ms: cli_config.settle_ms,
            },
            dry_run: cli_config.dry_run,
            ssh_user: cli_config.ssh_user.clone(),
            ssh_key: cli_config.ssh_key.as_ref().map(PathBuf::from),
        })
    }

    /// Main level of a `RUST_LOG` value such as `info,sfcrig_engine=debug`
    fn parse_log_level(level_str: &str) -> LogLevel {
        let main_level = level_str
            .split(',')
            .next()
            .unwrap_or(level_str)
            .split('=')
            .next()
            .unwrap_or(level_str)
            .to_lowercase();

        match main_level.as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    /// Filter directive handed to the subscriber
    pub fn log_filter(&self) -> String {
        match env::var("RUST_LOG") {
            Ok(existing) if !existing.is_empty() && !matches!(self.log_level, LogLevel::Debug | LogLevel::Trace) => {
                format!("{},{}", existing, QUIET_CRATES)
            }
            _ => format!("{},{}", self.log_level.to_filter_string(), QUIET_CRATES),
        }
    }

    pub fn init_logging(&self) -> Result<()> {
        let filter = EnvFilter::try_new(self.log_filter()).map_err(|e| anyhow!("Invalid log filter: {}", e))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(true)
            .compact()
            .try_init()
            .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

        tracing::info!("Logging initialized with level: {:?}", self.log_level);
        Ok(())
    }

    /// Loader over the configured scenario directories
    pub fn scenario_loader(&self) -> ScenarioLoader {
        let mut loader = if self.no_default_scenarios {
            ScenarioLoader::with_directories(Vec::new())
        } else {
            ScenarioLoader::new()
        };
        loader.add_directories(self.scenario_dirs.iter().cloned());
        loader
    }

    /// `ssh` client reaching guests as the configured user and key
    pub fn ssh_executor(&self) -> SshExecutor {
        SshExecutor::new(self.ssh_user.clone(), self.ssh_key.clone())
            .with_timeouts(SSH_CONNECT_TIMEOUT, self.provisioner.call_timeout)
    }

    /// Guest executor of a run: scripted replies for dry runs, `ssh` otherwise
    pub fn remote_executor(&self) -> Arc<dyn RemoteExecutor> {
        if self.dry_run {
            Arc::new(ScriptedExecutor::reachable())
        } else {
            Arc::new(self.ssh_executor())
        }
    }

    /// Provisioner over the given control-plane clients with this run's settings
    pub fn build_provisioner(
        &self,
        network: Arc<dyn NetworkApi>,
        compute: Arc<dyn ComputeApi>,
        identity: Arc<dyn IdentityApi>,
    ) -> Provisioner {
        Provisioner::new(
            network,
            compute,
            identity,
            self.remote_executor(),
            CidrPool::global(),
            self.provisioner.clone(),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.provisioner.call_timeout.is_zero() {
            return Err(anyhow!("Call timeout must be greater than 0"));
        }
        if self.provisioner.readiness.deadline.is_zero() {
            return Err(anyhow!("Readiness timeout must be greater than 0"));
        }
        if self.ssh_user.is_empty() {
            return Err(anyhow!("SSH user cannot be empty"));
        }
        if self.no_default_scenarios && self.scenario_dirs.is_empty() && !self.include_templates {
            return Err(anyhow!("No scenario source left: pass --scenario-dir or drop --no-templates"));
        }
        Ok(())
    }
}

/// Builder for [`AppConfig`], defaults match a plain `sfcrig --list`
pub struct AppConfigBuilder {
    config: AppConfig,
}

impl Default for AppConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig {
                log_level: LogLevel::Info,
                mode: RunMode::List,
                scenario_dirs: Vec::new(),
                no_default_scenarios: false,
                include_templates: true,
                provisioner: ProvisionerSettings::default(),
                overrides: RunOverrides::default(),
                dry_run: false,
                ssh_user: "cirros".to_string(),
                ssh_key: None,
            },
        }
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    pub fn run(mut self, scenario_id: impl Into<String>) -> Self {
        self.config.mode = RunMode::Run(scenario_id.into());
        self
    }

    pub fn scenario_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.config.scenario_dirs = dirs;
        self
    }

    pub fn no_default_scenarios(mut self, no_defaults: bool) -> Self {
        self.config.no_default_scenarios = no_defaults;
        self
    }

    pub fn include_templates(mut self, include: bool) -> Self {
        self.config.include_templates = include;
        self
    }

    /// Simulated control plane with its tight timeouts
    pub fn dry_run(mut self) -> Self {
        self.config.dry_run = true;
        self.config.provisioner = ProvisionerSettings::simulated();
        self
    }

    pub fn settle_ms(mut self, settle_ms: u64) -> Self {
        self.config.overrides.settle_ms = Some(settle_ms);
        self
    }

    pub fn ssh(mut self, user: impl Into<String>, key: Option<PathBuf>) -> Self {
        self.config.ssh_user = user.into();
        self.config.ssh_key = key;
        self
    }

    pub fn build(self) -> Result<AppConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
