//! `taskwright config`: show, validate, init.

use std::path::Path;

use anyhow::{Context, Result};

use taskwright::config::{Config, TEMPLATE};

use super::super::ConfigCommands;

pub fn cmd_config(path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No config file at {}; showing defaults.", path.display());
            }
            println!();
            let mut config = Config::load_or_default(path)?;
            redact(&mut config);
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            if !path.exists() {
                println!("No config file at {}. Using defaults.", path.display());
            }
            let config = Config::load_or_default(path)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{}", console::style("Configuration is valid.").green());
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if path.exists() && !force {
                println!("{} already exists.", path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(path, TEMPLATE)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Created {}", path.display());
        }
    }
    Ok(())
}

/// Hide tokens when printing.
fn redact(config: &mut Config) {
    for token in [&mut config.github.token, &mut config.gitea.token] {
        if !token.is_empty() {
            *token = "********".to_string();
        }
    }
}
