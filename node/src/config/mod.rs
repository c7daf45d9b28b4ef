use std::path::Path;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HTTP_ADDRESS: &str = "127.0.0.1:5000";
pub const DEFAULT_WS_ADDRESS: &str = "127.0.0.1:5001";
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Configuration {
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub operations: OperationConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub websocket: WsConfig,
}

impl Configuration {
    pub fn try_load<P: AsRef<Path>>(path: P) -> anyhow::Result<Configuration> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!("Failed to read config {}: {e}", path.as_ref().display())
        })?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn try_save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content).map_err(|e| {
            anyhow::anyhow!("Failed to write config {}: {e}", path.as_ref().display())
        })
    }
}

/// Identity of this node within the network.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Default namespace for entities submitted without one.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Organization identity this node signs for.
    pub org: String,
    /// Node name, the address other members use for point-to-point payloads.
    pub node_name: String,
    /// Ledger signing key registered for the organization.
    pub signing_key: String,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "weft.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    /// Seal when this many messages are in the open batch.
    pub max_messages: usize,
    /// Seal when the canonical payload reaches this many bytes.
    pub max_bytes: usize,
    /// Seal when the open batch reaches this age.
    pub timeout_ms: u64,
    /// Remove dispatchers idle for this long with no open batch.
    pub quiesce_ms: u64,
    /// Backoff floor for retrying a failed dispatch transaction.
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_messages: 50,
            max_bytes: 1024 * 1024,
            timeout_ms: 500,
            quiesce_ms: 30_000,
            retry_initial_ms: 100,
            retry_max_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregatorConfig {
    /// Pins examined per pump iteration.
    pub read_page_size: usize,
    /// How far below the lowest parked pin a rewind may reach.
    pub rewind_lookback: usize,
    /// Grace period for an unresolved correlation id before delivering anyway.
    pub cid_grace_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            read_page_size: 100,
            rewind_lookback: 1000,
            cid_grace_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OperationConfig {
    pub retry_initial_ms: u64,
    pub retry_multiplier: u32,
    pub retry_max_ms: u64,
    pub max_attempts: u32,
    /// Pending operations older than this are reconciled against the plugin.
    pub stale_ms: u64,
    pub reconcile_interval_ms: u64,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            retry_initial_ms: 250,
            retry_multiplier: 2,
            retry_max_ms: 30_000,
            max_attempts: 5,
            stale_ms: 60_000,
            reconcile_interval_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    pub address: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_HTTP_ADDRESS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WsConfig {
    pub address: String,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_WS_ADDRESS.to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node_config() -> NodeConfig {
        NodeConfig {
            namespace: DEFAULT_NAMESPACE.to_string(),
            org: "org1".to_string(),
            node_name: "node1".to_string(),
            signing_key: "0xkey1".to_string(),
        }
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Configuration {
            node: node_config(),
            storage: StorageConfig::default(),
            batch: BatchConfig::default(),
            aggregator: AggregatorConfig::default(),
            operations: OperationConfig::default(),
            http: HttpConfig::default(),
            websocket: WsConfig::default(),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.toml");
        config.try_save(&path).unwrap();
        let loaded = Configuration::try_load(&path).unwrap();
        assert_eq!(loaded.node.org, "org1");
        assert_eq!(loaded.batch.max_messages, 50);
    }

    #[test]
    fn test_sections_default_when_absent() {
        let toml = r#"
            [node]
            org = "org1"
            node_name = "node1"
            signing_key = "0xkey1"
        "#;
        let config: Configuration = toml::from_str(toml).unwrap();
        assert_eq!(config.node.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.aggregator.read_page_size, 100);
        assert_eq!(config.http.address, DEFAULT_HTTP_ADDRESS);
    }
}
