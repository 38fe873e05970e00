//! Configuration of a `fluxframe` node.
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The number of rows in each chunk written by `FluxNode::write_frame`
pub const ROWS_PER_CHUNK: usize = 100_000;

/// Everything a node needs to know to join a cluster and run. Missing fields
/// of a TOML file take their default value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// The `IP:Port` of the registration server
    pub server_addr: String,
    /// The `IP` this node listens on for connections from other nodes
    pub my_ip: String,
    /// The port this node listens on, the OS picks one when `None`
    pub my_port: Option<u16>,
    /// The number of nodes in the cluster
    pub num_nodes: usize,
    /// The number of rows in each chunk of a newly written frame
    pub rows_per_chunk: usize,
    /// The largest number of remote objects the directory cache holds
    pub cache_entries: usize,
    /// The largest number of bytes the directory cache holds
    pub cache_bytes: usize,
    /// The number of threads used to run chunk tasks, `0` for one per core
    pub task_threads: usize,
    /// When set, numeric columns written by this node may be stored with
    /// this many decimal digits of precision
    pub lossy_float_digits: Option<u8>,
    /// How long to wait for another node to answer a request
    pub request_timeout_ms: u64,
    /// The size of the queue of messages received from other nodes
    pub channel_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            server_addr: "127.0.0.1:9000".to_string(),
            my_ip: "127.0.0.1".to_string(),
            my_port: None,
            num_nodes: 1,
            rows_per_chunk: ROWS_PER_CHUNK,
            cache_entries: 1024,
            cache_bytes: 256 * 1024 * 1024,
            task_threads: 0,
            lossy_float_digits: None,
            request_timeout_ms: 30_000,
            channel_capacity: 1024,
        }
    }
}

impl NodeConfig {
    /// Parses a configuration from TOML
    pub fn from_toml(s: &str) -> Result<Self, StoreError> {
        let config: NodeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the configuration file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let contents = std::fs::read_to_string(path)?;
        NodeConfig::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.num_nodes == 0 {
            return Err(StoreError::Config("num_nodes must be at least 1".into()));
        }
        if self.rows_per_chunk == 0 {
            return Err(StoreError::Config(
                "rows_per_chunk must be at least 1".into(),
            ));
        }
        if let Some(d) = self.lossy_float_digits {
            if d > 9 {
                return Err(StoreError::Config(format!(
                    "lossy_float_digits must be at most 9, got {}",
                    d
                )));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The number of threads to run chunk tasks on
    pub fn threads(&self) -> usize {
        if self.task_threads == 0 {
            num_cpus::get()
        } else {
            self.task_threads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config = NodeConfig::from_toml(
            r#"
            num_nodes = 3
            rows_per_chunk = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.num_nodes, 3);
        assert_eq!(config.rows_per_chunk, 10);
        assert_eq!(config.server_addr, "127.0.0.1:9000");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.threads() >= 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(matches!(
            NodeConfig::from_toml("num_nodes = 0"),
            Err(StoreError::Config(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml("num_nodes = \"two\""),
            Err(StoreError::Config(_))
        ));
        assert!(NodeConfig::from_toml("lossy_float_digits = 12").is_err());
    }
}
