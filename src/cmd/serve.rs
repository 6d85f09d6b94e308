//! Broker server command — `agent-broker serve`.

use anyhow::{Context, Result};
use std::path::Path;

use agent_broker::broker::server::start_server;
use agent_broker::broker_config::BrokerConfig;
use agent_broker::logging;

/// Flags that take precedence over the file and the environment.
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dev: bool,
}

impl ServeOverrides {
    fn apply(self, config: &mut BrokerConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.dev {
            config.server.dev_mode = true;
        }
    }
}

pub async fn cmd_serve(config_path: &Path, overrides: ServeOverrides) -> Result<()> {
    let mut config = BrokerConfig::load_or_default(config_path)?;
    config.apply_env()?;
    overrides.apply(&mut config);

    let _guard = logging::init(&config.logging)?;

    for warning in config.validate() {
        tracing::warn!(config = %config_path.display(), "{}", warning);
    }

    start_server(config).await.context("Agent broker failed")?;
    Ok(())
}
