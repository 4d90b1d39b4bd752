//! Scenario catalog and run entry point.
//!
//! Combines the built-in templates with scenarios loaded from disk. A file
//! scenario with the same id as a template replaces it.

use anyhow::{Result, anyhow};
use std::collections::BTreeMap;
use tracing::{info, instrument};

use sfcrig_shared::scenario::ScenarioDefinition;

use super::{BuiltinScenarioTemplates, ScenarioDriver, ScenarioLoader, ScenarioRun};
use crate::services::Provisioner;

/// Run-time adjustments applied to a resolved scenario
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub settle_ms: Option<u64>,
}

pub struct ScenarioManager {
    loader: ScenarioLoader,
    templates: Option<BuiltinScenarioTemplates>,
}

impl ScenarioManager {
    pub fn new(loader: ScenarioLoader, include_templates: bool) -> Self {
        Self {
            loader,
            templates: include_templates.then(BuiltinScenarioTemplates::new),
        }
    }

    /// Templates and loaded scenarios, sorted by id
    pub fn list_all_scenarios(&self) -> Vec<ScenarioDefinition> {
        let mut catalog: BTreeMap<String, ScenarioDefinition> = BTreeMap::new();
        if let Some(templates) = &self.templates {
            for template in templates.get_all_templates() {
                catalog.insert(template.id.clone(), template);
            }
        }
        for scenario in self.loader.load_all() {
            catalog.insert(scenario.id.clone(), scenario);
        }
        catalog.into_values().collect()
    }

    pub fn get_scenario(&self, id: &str) -> Option<ScenarioDefinition> {
        self.loader
            .get_scenario(id)
            .or_else(|| self.templates.as_ref().and_then(|t| t.get_template(id)))
    }

    /// Resolve `id` and run it on `provisioner`, tearing down afterwards
    #[instrument(skip(self, provisioner, overrides))]
    pub async fn run_scenario(
        &self,
        id: &str,
        provisioner: Provisioner,
        overrides: &RunOverrides,
    ) -> Result<ScenarioRun> {
        let mut definition = self
            .get_scenario(id)
            .ok_or_else(|| anyhow!("Scenario '{}' not found", id))?;
        if let Some(settle_ms) = overrides.settle_ms {
            definition.settle_ms = settle_ms;
        }

        info!("Running scenario '{}' ({})", definition.id, definition.kind);
        Ok(ScenarioDriver::new(provisioner).run(&definition).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cidr::CidrPool;
    use crate::remote_exec::ScriptedExecutor;
    use crate::services::ProvisionerSettings;
    use crate::simulator::Simulator;
    use sfcrig_shared::scenario::ScenarioKind;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager_with(dir: &TempDir, include_templates: bool) -> ScenarioManager {
        ScenarioManager::new(
            ScenarioLoader::with_directories(vec![dir.path().to_path_buf()]),
            include_templates,
        )
    }

    #[test]
    fn test_file_scenario_replaces_template() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("series.json5"),
            r#"{ id: "sfc-multi-series", name: "Lab series", kind: "sfc-multi-series", params: { service_functions: 5 } }"#,
        )
        .unwrap();

        let manager = manager_with(&dir, true);
        let all = manager.list_all_scenarios();
        assert_eq!(all.len(), ScenarioKind::ALL.len());

        let series = manager.get_scenario("sfc-multi-series").unwrap();
        assert_eq!(series.name, "Lab series");
        assert_eq!(series.params.service_functions, 5);
    }

    #[test]
    fn test_templates_can_be_excluded() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir, false);
        assert!(manager.list_all_scenarios().is_empty());
        assert!(manager.get_scenario("sfc-add-portpair").is_none());
    }

    #[tokio::test]
    async fn test_run_unknown_scenario() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir, true);
        let provisioner = Provisioner::simulated(
            Arc::new(Simulator::new()),
            Arc::new(ScriptedExecutor::reachable()),
            CidrPool::isolated("10.70.0.0/24".parse().unwrap(), "fd00:70::/64".parse().unwrap()),
            ProvisionerSettings::simulated(),
        );

        let err = manager
            .run_scenario("sfc-teleport", provisioner, &RunOverrides::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_run_template_on_simulator() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir, true);
        let sim = Arc::new(Simulator::new());
        let provisioner = Provisioner::simulated(
            sim.clone(),
            Arc::new(ScriptedExecutor::reachable()),
            CidrPool::isolated("10.71.0.0/24".parse().unwrap(), "fd00:71::/64".parse().unwrap()),
            ProvisionerSettings::simulated(),
        );

        let run = manager
            .run_scenario("sfc-single-parallel", provisioner, &RunOverrides { settle_ms: Some(0) })
            .await
            .unwrap();

        assert!(run.succeeded(), "{}", run);
        assert_eq!(sim.live_count(), 0);
    }
}
