//! Configuration inspection commands.

use anyhow::Result;
use colored::Colorize;
use std::path::Path;

use crate::config;

/// Display the effective configuration (file + environment + defaults).
pub fn show(config_path: &Path) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

/// Validate the configuration file and report the outcome.
pub fn validate(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(_) => {
            println!("{}", "Configuration is valid".green());
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", format!("Configuration error: {e}").red());
            Err(e)
        }
    }
}
