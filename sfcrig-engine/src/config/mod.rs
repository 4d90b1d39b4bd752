//! Configuration for the sfcrig runner.
//!
//! The command line is parsed into a [`CliConfig`] and turned into an
//! [`AppConfig`], which holds everything a run needs.

pub mod app_config;
pub mod cli;

pub use app_config::{AppConfig, AppConfigBuilder, LogLevel, RunMode};
pub use cli::CliConfig;

use anyhow::Result;

/// Parse the process arguments into a validated configuration
pub fn from_cli_and_env() -> Result<AppConfig> {
    let cli_config = CliConfig::from_args()?;
    let app_config = AppConfig::from_cli(&cli_config)?;
    app_config.validate()?;
    Ok(app_config)
}
