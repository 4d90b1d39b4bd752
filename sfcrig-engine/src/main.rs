use anyhow::{Result, bail};
use std::sync::Arc;
use tracing::info;

use sfcrig_engine::config::{self, AppConfig, RunMode};
use sfcrig_engine::scenario::ScenarioManager;
use sfcrig_engine::services::Provisioner;
use sfcrig_engine::simulator::Simulator;

/// Provisioner for one run.
///
/// Only the in-memory control plane ships with this binary; a deployment
/// passes its own `NetworkApi`/`ComputeApi`/`IdentityApi` clients to
/// [`AppConfig::build_provisioner`], which reaches guests over `ssh`.
fn build_provisioner(config: &AppConfig) -> Result<Provisioner> {
    if !config.dry_run {
        bail!("No cloud client is configured for this binary; pass --dry-run to use the in-memory control plane");
    }

    info!("Dry run: in-memory control plane, scripted guests");
    let simulator = Arc::new(Simulator::new());
    Ok(config.build_provisioner(simulator.clone(), simulator.clone(), simulator))
}

fn print_catalog(manager: &ScenarioManager) {
    let scenarios = manager.list_all_scenarios();
    if scenarios.is_empty() {
        println!("No scenarios found");
        return;
    }
    for scenario in scenarios {
        println!("{:<28} {:<26} {}", scenario.id, scenario.kind.as_str(), scenario.name);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::from_cli_and_env()?;
    config.init_logging()?;

    let manager = ScenarioManager::new(config.scenario_loader(), config.include_templates);

    match &config.mode {
        RunMode::List => print_catalog(&manager),
        RunMode::Run(id) => {
            let provisioner = build_provisioner(&config)?;
            let run = manager.run_scenario(id, provisioner, &config.overrides).await?;
            println!("{}", run);
            run.into_result()?;
        }
    }

    Ok(())
}
