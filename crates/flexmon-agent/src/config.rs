use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub bus: BusSection,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub verbose: bool,
    /// Directory holding the persistent `.rule` files.
    #[serde(default = "default_rules_dir")]
    pub rules: String,
    /// Glob filter on asset inames read from the shared-metric store.
    #[serde(default = "default_pattern")]
    pub assets_pattern: String,
    /// Glob filter on quantities read from the shared-metric store.
    #[serde(default = "default_pattern")]
    pub metrics_pattern: String,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
    /// Shared-metric store directory; out-of-band producers drop samples
    /// here. Absent means the store is not scanned.
    pub shm_dir: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            verbose: false,
            rules: default_rules_dir(),
            assets_pattern: default_pattern(),
            metrics_pattern: default_pattern(),
            polling_interval_secs: default_polling_interval(),
            shm_dir: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BusSection {
    /// Broker endpoint, `host:port`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Our identity on the bus; also the mailbox address peers reply to.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Mailbox address of the external asset service.
    #[serde(default = "default_asset_agent")]
    pub asset_agent: String,
}

impl Default for BusSection {
    fn default() -> Self {
        BusSection {
            endpoint: default_endpoint(),
            client_id: default_client_id(),
            asset_agent: default_asset_agent(),
        }
    }
}

fn default_rules_dir() -> String {
    "/var/lib/flexmon/rules".to_string()
}

fn default_pattern() -> String {
    "*".to_string()
}

fn default_polling_interval() -> u64 {
    30
}

fn default_endpoint() -> String {
    "localhost:1883".to_string()
}

fn default_client_id() -> String {
    "flexmon".to_string()
}

fn default_asset_agent() -> String {
    flexmon_common::ASSET_AGENT_ADDRESS.to_string()
}

impl AgentConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config: AgentConfig = toml::from_str("").unwrap();
        assert!(!config.server.verbose);
        assert_eq!(config.server.assets_pattern, "*");
        assert_eq!(config.server.polling_interval_secs, 30);
        assert_eq!(config.bus.endpoint, "localhost:1883");
        assert_eq!(config.bus.asset_agent, "asset-agent");
    }

    #[test]
    fn partial_config_overrides() {
        let config: AgentConfig = toml::from_str(
            r#"
            [server]
            rules = "/tmp/rules"
            verbose = true

            [bus]
            endpoint = "broker:1884"
            "#,
        )
        .unwrap();
        assert!(config.server.verbose);
        assert_eq!(config.server.rules, "/tmp/rules");
        assert_eq!(config.server.metrics_pattern, "*");
        assert_eq!(config.bus.endpoint, "broker:1884");
        assert_eq!(config.bus.client_id, "flexmon");
    }
}
