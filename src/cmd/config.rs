//! Configuration view and validation commands — `agent-broker config`.

use anyhow::Result;
use std::path::Path;

use agent_broker::broker_config::BrokerConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Agent Broker Configuration");
            println!("==========================");
            println!();

            let mut config = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                BrokerConfig::load(config_path)?
            } else {
                println!("No config file found at {}", config_path.display());
                println!("Using default configuration.");
                BrokerConfig::default()
            };
            println!();

            print_config(&config);

            config.apply_env()?;
            println!("Effective values (with env overrides):");
            println!("  bind = \"{}\"", config.server.bind_addr());
            println!("  log level = \"{}\"", config.logging.level);
            println!("  log json = {}", config.logging.json);
            println!();

            if !config_path.exists() {
                println!("Run 'agent-broker config init' to create a config file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No config file found. Using defaults (valid).");
                return Ok(());
            }

            let config = BrokerConfig::load(config_path)?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("Config file already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }

            BrokerConfig::default().save(config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, dev_mode");
            println!("  - [registry] superseded, outbound_buffer");
            println!("  - [keepalive] ping_interval_secs, pong_timeout_secs");
            println!("  - [logging] level, json, directory");
            println!();
        }
    }

    Ok(())
}

fn print_config(config: &BrokerConfig) {
    println!("[server]");
    println!("  host = \"{}\"", config.server.host);
    println!("  port = {}", config.server.port);
    println!("  dev_mode = {}", config.server.dev_mode);
    println!();

    println!("[registry]");
    println!("  superseded = \"{}\"", config.registry.superseded);
    println!("  outbound_buffer = {}", config.registry.outbound_buffer);
    println!();

    println!("[keepalive]");
    println!("  ping_interval_secs = {}", config.keepalive.ping_interval_secs);
    println!("  pong_timeout_secs = {}", config.keepalive.pong_timeout_secs);
    println!();

    println!("[logging]");
    println!("  level = \"{}\"", config.logging.level);
    println!("  json = {}", config.logging.json);
    if let Some(dir) = &config.logging.directory {
        println!("  directory = \"{}\"", dir.display());
    }
    println!();
}
