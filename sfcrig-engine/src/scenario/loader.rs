//! File-based scenario loading.
//!
//! Scans directories for `.json5` scenario files. Directories are kept in
//! priority order, so a scenario in `./scenarios` replaces one with the same
//! id from the system directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use sfcrig_shared::scenario::ScenarioDefinition;
use sfcrig_shared::scenario_json::parse_scenario_file;

/// Scenario directory installed with the package
pub const SYSTEM_SCENARIO_DIR: &str = "/usr/share/sfcrig/scenarios";

/// Scenario directory under the user's home
pub const USER_SCENARIO_DIR: &str = ".config/sfcrig/scenarios";

/// Directory-scanning loader for scenario definitions
#[derive(Debug, Clone)]
pub struct ScenarioLoader {
    /// Lowest priority first
    directories: Vec<PathBuf>,
}

impl Default for ScenarioLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ScenarioLoader {
    /// Loader over the system, user and working-directory locations
    pub fn new() -> Self {
        let mut directories = vec![PathBuf::from(SYSTEM_SCENARIO_DIR)];
        if let Some(home) = dirs::home_dir() {
            directories.push(home.join(USER_SCENARIO_DIR));
        }
        directories.push(PathBuf::from("./scenarios"));
        Self { directories }
    }

    pub fn with_directories(directories: Vec<PathBuf>) -> Self {
        Self { directories }
    }

    /// Append directories with the highest priority
    pub fn add_directories(&mut self, dirs: impl IntoIterator<Item = PathBuf>) {
        self.directories.extend(dirs);
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Load every scenario, later directories overriding earlier ones.
    ///
    /// Unreadable directories and files that fail to parse or validate are
    /// logged and skipped.
    pub fn load_all(&self) -> Vec<ScenarioDefinition> {
        let mut scenarios: HashMap<String, ScenarioDefinition> = HashMap::new();

        for dir in &self.directories {
            if !dir.exists() {
                debug!("Scenario directory does not exist, skipping: {:?}", dir);
                continue;
            }

            match Self::load_from_directory(dir) {
                Ok(loaded) => {
                    if !loaded.is_empty() {
                        info!("Loaded {} scenarios from {:?}", loaded.len(), dir);
                    }
                    for scenario in loaded {
                        if scenarios.contains_key(&scenario.id) {
                            debug!("Scenario '{}' from {:?} overrides previous definition", scenario.id, dir);
                        }
                        scenarios.insert(scenario.id.clone(), scenario);
                    }
                }
                Err(e) => warn!("Failed to load scenarios from {:?}: {:#}", dir, e),
            }
        }

        let mut scenarios: Vec<ScenarioDefinition> = scenarios.into_values().collect();
        scenarios.sort_by(|a, b| a.id.cmp(&b.id));
        scenarios
    }

    fn load_from_directory(dir: &Path) -> Result<Vec<ScenarioDefinition>> {
        let entries = std::fs::read_dir(dir).with_context(|| format!("Failed to read directory: {:?}", dir))?;

        let mut scenarios = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("Failed to read directory entry in {:?}", dir))?
                .path();
            if !is_scenario_file(&path) {
                continue;
            }

            match Self::load_scenario_file(&path) {
                Ok(scenario) => scenarios.push(scenario),
                Err(e) => warn!("Skipping {:?}: {:#}", path, e),
            }
        }
        Ok(scenarios)
    }

    fn load_scenario_file(path: &Path) -> Result<ScenarioDefinition> {
        debug!("Loading scenario from {:?}", path);
        let scenario =
            parse_scenario_file(path).with_context(|| format!("Failed to parse scenario file: {:?}", path))?;
        scenario
            .validate()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Scenario '{}' is not runnable", scenario.id))?;
        Ok(scenario)
    }

    pub fn get_scenario(&self, id: &str) -> Option<ScenarioDefinition> {
        self.load_all().into_iter().find(|s| s.id == id)
    }
}

fn is_scenario_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json5")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfcrig_shared::scenario::ScenarioKind;
    use std::fs;
    use tempfile::TempDir;

    fn scenario_file(id: &str, name: &str) -> String {
        format!(
            r#"{{
    id: "{}",
    name: "{}",
    kind: "sfc-single-parallel",
    settle: "5s",
    params: {{
        public_network: "public",
        service_functions: 2,
    }}
}}"#,
            id, name
        )
    }

    #[test]
    fn test_default_directories() {
        let loader = ScenarioLoader::new();
        assert_eq!(loader.directories()[0], PathBuf::from(SYSTEM_SCENARIO_DIR));
        assert_eq!(loader.directories().last(), Some(&PathBuf::from("./scenarios")));
    }

    #[test]
    fn test_load_from_directory() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("parallel.json5"), scenario_file("parallel", "Parallel")).unwrap();

        let loader = ScenarioLoader::with_directories(vec![temp_dir.path().to_path_buf()]);
        let scenarios = loader.load_all();

        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].kind, ScenarioKind::SfcSingleParallel);
        assert_eq!(scenarios[0].settle_ms, 5000);
        assert_eq!(scenarios[0].params.service_functions, 2);
    }

    #[test]
    fn test_later_directory_overrides() {
        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        fs::write(dir1.path().join("a.json5"), scenario_file("same-id", "From Dir 1")).unwrap();
        fs::write(dir2.path().join("b.json5"), scenario_file("same-id", "From Dir 2")).unwrap();

        let mut loader = ScenarioLoader::with_directories(vec![dir1.path().to_path_buf()]);
        loader.add_directories([dir2.path().to_path_buf()]);
        let scenarios = loader.load_all();

        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].name, "From Dir 2");
    }

    #[test]
    fn test_skips_other_files_and_broken_scenarios() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("valid.json5"), scenario_file("valid", "Valid")).unwrap();
        fs::write(temp_dir.path().join("readme.txt"), "not a scenario").unwrap();
        fs::write(temp_dir.path().join("broken.json5"), "{ this is not json5 }}}").unwrap();
        // Parses, but dual stack without IPv6 prefixes cannot run
        fs::write(
            temp_dir.path().join("unrunnable.json5"),
            r#"{ id: "v6", name: "V6", kind: "sfc-multi-series", params: { dual_stack: true } }"#,
        )
        .unwrap();

        let loader = ScenarioLoader::with_directories(vec![temp_dir.path().to_path_buf()]);
        let ids: Vec<String> = loader.load_all().into_iter().map(|s| s.id).collect();

        assert_eq!(ids, vec!["valid".to_string()]);
    }

    #[test]
    fn test_missing_directory_and_lookup() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("find.json5"), scenario_file("find-me", "Find Me")).unwrap();

        let loader = ScenarioLoader::with_directories(vec![
            PathBuf::from("/nonexistent/sfcrig/scenarios"),
            temp_dir.path().to_path_buf(),
        ]);

        assert_eq!(loader.get_scenario("find-me").unwrap().name, "Find Me");
        assert!(loader.get_scenario("nonexistent").is_none());
    }
}
