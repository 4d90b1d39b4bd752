//! Remote command execution on provisioned VMs.
//!
//! The engine never talks to a VM shell directly. It hands command strings to
//! a [`RemoteExecutor`] and interprets the result: address setup on the
//! destination VM, then ping probes from the source VM that prove traffic
//! crosses the chain. [`SshExecutor`] shells out to the system `ssh` client,
//! [`ScriptedExecutor`] answers from canned rules for dry runs and tests.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::cidr::host_at;
use crate::utils::service_resilience::{
    REMOTE_COMMAND, ServiceResilienceManager, TRAFFIC_CHECK, get_resilience_manager,
};

/// Probes sent per traffic check
pub const PING_COUNT: u32 = 5;

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command on {address} did not finish within {timeout:?}")]
    TimedOut { address: IpAddr, timeout: Duration },

    #[error("Command on {address} exited with {exit_code}: {stderr}")]
    NonZeroExit {
        address: IpAddr,
        exit_code: i32,
        stderr: String,
    },

    #[error("Traffic from {from} to {target} failed: {detail}")]
    TrafficBlocked {
        from: IpAddr,
        target: IpAddr,
        detail: String,
    },
}

/// Runs a shell command on the VM reachable at `address`
pub trait RemoteExecutor: Send + Sync {
    fn run_command<'a>(
        &'a self,
        address: IpAddr,
        command: &'a str,
    ) -> BoxFuture<'a, Result<CommandOutput, ExecError>>;
}

/// Executor backed by the system `ssh` client
#[derive(Debug, Clone)]
pub struct SshExecutor {
    user: String,
    key_path: Option<PathBuf>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshExecutor {
    pub fn new(user: impl Into<String>, key_path: Option<PathBuf>) -> Self {
        Self {
            user: user.into(),
            key_path,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, command: Duration) -> Self {
        self.connect_timeout = connect;
        self.command_timeout = command;
        self
    }

    /// `ssh` invocation running `command` as the configured user on `address`
    pub(crate) fn build_command(&self, address: IpAddr, command: &str) -> Command {
        let mut ssh = Command::new("ssh");
        ssh.args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "BatchMode=yes",
            "-o",
        ])
        .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        if let Some(key) = &self.key_path {
            ssh.arg("-i").arg(key);
        }
        ssh.arg(format!("{}@{}", self.user, address))
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        ssh
    }
}

impl RemoteExecutor for SshExecutor {
    fn run_command<'a>(
        &'a self,
        address: IpAddr,
        command: &'a str,
    ) -> BoxFuture<'a, Result<CommandOutput, ExecError>> {
        async move {
            debug!("ssh {}@{}: {}", self.user, address, command);
            let output = tokio::time::timeout(self.command_timeout, self.build_command(address, command).output())
                .await
                .map_err(|_| ExecError::TimedOut {
                    address,
                    timeout: self.command_timeout,
                })?
                .map_err(|source| ExecError::Spawn {
                    program: "ssh".to_string(),
                    source,
                })?;

            Ok(CommandOutput {
                // Killed by a signal
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
        .boxed()
    }
}

struct ScriptRule {
    pattern: String,
    output: CommandOutput,
    /// `None` answers forever
    remaining: Option<usize>,
}

/// Executor answering from canned rules.
///
/// Rules are matched by substring, most recently added first. A rule added
/// with [`ScriptedExecutor::respond_times`] is used up after that many
/// matches. Commands matching no rule succeed with empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<ScriptRule>>,
    history: Mutex<Vec<(IpAddr, String)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every ping gets all of its replies back
    pub fn reachable() -> Self {
        let executor = Self::new();
        executor.respond("ping", CommandOutput::ok(ping_transcript(PING_COUNT, PING_COUNT)));
        executor
    }

    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.push_rule(pattern, output, None);
    }

    pub fn respond_times(&self, pattern: &str, output: CommandOutput, times: usize) {
        self.push_rule(pattern, output, Some(times));
    }

    fn push_rule(&self, pattern: &str, output: CommandOutput, remaining: Option<usize>) {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ScriptRule {
                pattern: pattern.to_string(),
                output,
                remaining,
            });
    }

    /// Every command run so far with the address it targeted
    pub fn history(&self) -> Vec<(IpAddr, String)> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn commands_for(&self, address: IpAddr) -> Vec<String> {
        self.history()
            .into_iter()
            .filter(|(addr, _)| *addr == address)
            .map(|(_, command)| command)
            .collect()
    }

    fn answer(&self, command: &str) -> CommandOutput {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        for rule in rules.iter_mut().rev() {
            if rule.remaining == Some(0) || !command.contains(&rule.pattern) {
                continue;
            }
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            return rule.output.clone();
        }
        CommandOutput::ok("")
    }
}

impl RemoteExecutor for ScriptedExecutor {
    fn run_command<'a>(
        &'a self,
        address: IpAddr,
        command: &'a str,
    ) -> BoxFuture<'a, Result<CommandOutput, ExecError>> {
        async move {
            self.history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((address, command.to_string()));
            Ok(self.answer(command))
        }
        .boxed()
    }
}

/// Output of a ping run in the format busybox and iputils both print
pub fn ping_transcript(transmitted: u32, received: u32) -> String {
    let loss = if transmitted == 0 {
        0
    } else {
        (transmitted - received.min(transmitted)) * 100 / transmitted
    };
    format!(
        "--- ping statistics ---\n{} packets transmitted, {} packets received, {}% packet loss\n",
        transmitted, received, loss
    )
}

static PING_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) packets transmitted, (\d+) (?:packets )?received.*?([\d.]+)% packet loss")
        .expect("ping summary pattern is valid")
});

/// Packet counters from the statistics line of a ping run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingSummary {
    pub transmitted: u32,
    pub received: u32,
    pub loss_percent: f32,
}

impl PingSummary {
    pub fn parse(output: &str) -> Option<Self> {
        let caps = PING_SUMMARY.captures(output)?;
        Some(Self {
            transmitted: caps[1].parse().ok()?,
            received: caps[2].parse().ok()?,
            loss_percent: caps[3].parse().ok()?,
        })
    }

    pub fn is_clean(&self) -> bool {
        self.transmitted > 0 && self.received == self.transmitted
    }
}

/// Addresses the destination VM answers on during traffic checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSetup {
    /// Data-plane interface of the destination VM
    pub interface: String,
    pub probes: Vec<IpAddr>,
    pub prefix: IpNet,
    pub gateway: IpAddr,
    pub ipv6: Option<Ipv6Probes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Probes {
    pub probes: Vec<IpAddr>,
    pub prefix: IpNet,
    pub gateway: IpAddr,
}

impl DestinationSetup {
    /// Probe addresses plus matching IPv6 ones numbered `::101` upwards
    pub fn new(probes: Vec<IpAddr>, prefix: IpNet, gateway: IpAddr, ipv6_prefix: Option<IpNet>) -> Self {
        let ipv6 = ipv6_prefix.map(|prefix| Ipv6Probes {
            probes: (0..probes.len() as u128)
                .filter_map(|i| host_at(&prefix, 0x101 + i))
                .collect(),
            gateway: host_at(&prefix, 1).unwrap_or(prefix.network()),
            prefix,
        });
        Self {
            interface: "eth1".to_string(),
            probes,
            prefix,
            gateway,
            ipv6,
        }
    }

    /// Shell commands that configure the destination VM
    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self
            .probes
            .iter()
            .map(|addr| format!("ip address add {}/{} dev {}", addr, self.prefix.prefix_len(), self.interface))
            .collect();
        commands.push(format!("route add default gw {} {}", self.gateway, self.interface));
        if let Some(v6) = &self.ipv6 {
            commands.extend(v6.probes.iter().map(|addr| {
                format!("ip -6 addr add {}/{} dev {}", addr, v6.prefix.prefix_len(), self.interface)
            }));
            commands.push(format!("ip -6 route add {} dev {}", v6.gateway, self.interface));
        }
        commands
    }

    /// Every address a traffic check should reach
    pub fn targets(&self) -> Vec<IpAddr> {
        let mut targets = self.probes.clone();
        if let Some(v6) = &self.ipv6 {
            targets.extend(v6.probes.iter().copied());
        }
        targets
    }
}

/// `ping -c N` for IPv4 targets, `ping6 -c N` for IPv6 ones
pub fn ping_command(target: IpAddr, count: u32) -> String {
    let program = if target.is_ipv6() { "ping6" } else { "ping" };
    format!("{} -c {} {}", program, count, target)
}

/// Drives configuration commands and traffic checks through an executor
#[derive(Clone)]
pub struct RemoteExecOrchestrator {
    executor: Arc<dyn RemoteExecutor>,
    resilience: Arc<ServiceResilienceManager>,
    ping_count: u32,
}

impl RemoteExecOrchestrator {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            executor,
            resilience: get_resilience_manager(),
            ping_count: PING_COUNT,
        }
    }

    /// Use `resilience` instead of the process-wide retry policies
    pub fn with_resilience(mut self, resilience: Arc<ServiceResilienceManager>) -> Self {
        self.resilience = resilience;
        self
    }

    /// Run a command that must exit cleanly, retried while the VM comes up
    #[instrument(skip(self))]
    pub async fn run(&self, address: IpAddr, command: &str) -> anyhow::Result<CommandOutput> {
        let executor = &self.executor;
        self.resilience
            .execute_with_retry(
                move || async move {
                    let output = executor.run_command(address, command).await?;
                    if output.success() {
                        Ok(output)
                    } else {
                        Err(ExecError::NonZeroExit {
                            address,
                            exit_code: output.exit_code,
                            stderr: output.stderr,
                        })
                    }
                },
                REMOTE_COMMAND,
                command,
            )
            .await
    }

    /// Put the probe addresses on the destination VM
    pub async fn configure_destination(&self, address: IpAddr, setup: &DestinationSetup) -> anyhow::Result<()> {
        let script = setup.commands().join("; ");
        self.run(address, &script).await?;
        info!("Configured {} probe address(es) on {}", setup.targets().len(), address);
        Ok(())
    }

    /// Ping `target` from the VM at `from` until every probe is answered
    pub async fn check_traffic(&self, from: IpAddr, target: IpAddr) -> anyhow::Result<PingSummary> {
        let executor = &self.executor;
        let command = ping_command(target, self.ping_count);
        let command = command.as_str();
        let summary = self.resilience
            .execute_with_retry(
                move || async move {
                    let output = executor.run_command(from, command).await?;
                    match PingSummary::parse(&output.stdout) {
                        Some(summary) if summary.is_clean() => Ok(summary),
                        Some(summary) => Err(ExecError::TrafficBlocked {
                            from,
                            target,
                            detail: format!("{}% packet loss", summary.loss_percent),
                        }),
                        None => Err(ExecError::TrafficBlocked {
                            from,
                            target,
                            detail: format!("no ping statistics (exit {})", output.exit_code),
                        }),
                    }
                },
                TRAFFIC_CHECK,
                command,
            )
            .await;

        match &summary {
            Ok(s) => debug!("{} -> {}: {}/{} replies", from, target, s.received, s.transmitted),
            Err(e) => warn!("{} -> {} unreachable: {:#}", from, target, e),
        }
        summary
    }

    /// Check every target in order, stopping at the first that stays unreachable
    pub async fn check_all(&self, from: IpAddr, targets: &[IpAddr]) -> anyhow::Result<Vec<PingSummary>> {
        let mut summaries = Vec::with_capacity(targets.len());
        for target in targets {
            summaries.push(self.check_traffic(from, *target).await?);
        }
        info!("Traffic from {} reached {} target(s)", from, summaries.len());
        Ok(summaries)
    }
}
