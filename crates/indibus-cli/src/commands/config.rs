//! Configuration commands.

use crate::config::CliConfig;
use crate::error::{ClientError, ClientResult};

/// Dumps the effective configuration to stdout.
pub fn dump(config: &CliConfig) -> ClientResult<()> {
    let toml_str = toml::to_string_pretty(config)
        .map_err(|e| ClientError::Config(format!("failed to serialize config: {}", e)))?;
    println!("# config.toml ({})", CliConfig::default_path().display());
    println!("{}", toml_str);
    Ok(())
}

pub fn validate(config: &CliConfig) -> ClientResult<()> {
    config.validate().map_err(ClientError::Config)?;
    for entry in &config.drivers {
        println!("driver {}:{}", entry.kind, entry.target);
    }
    println!("Configuration is valid.");
    Ok(())
}

/// Shows the configuration file path.
pub fn path() -> ClientResult<()> {
    println!("config: {}", CliConfig::default_path().display());
    Ok(())
}
