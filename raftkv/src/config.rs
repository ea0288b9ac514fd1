//! Runtime configuration, loaded once at startup from a TOML file.

use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::sync::Mutex;

/// Global configuration instance
static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

/// Returns a reference to the global configuration instance
pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::default()))
}

/// Address of one cluster member. Node ids are indices into the member list.
#[derive(Debug, Deserialize, Clone)]
pub struct MemberConfig {
    pub host: String,
    pub port: u16,
}

/// Runtime configuration for a replica. Durations are seconds.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// This node's index in the membership
    pub id: u64,
    /// Port the RPC surfaces listen on
    pub port: u16,
    /// All cluster members, in id order
    pub members: Vec<MemberConfig>,
    /// Per-connection concurrency limit
    pub pool_size: usize,
    /// Maximum RPC message size in bytes
    pub max_message: usize,
    /// Transport channel buffer
    pub max_batch: usize,
    /// Peer connect timeout
    pub max_delay: f64,
    pub heartbeat_timeout: f64,
    pub heartbeat_interval: f64,
    pub election_timeout: f64,
    /// How far below applied_ts buffered records are kept before compaction
    pub applied_backlog: i64,
    pub rotate_interval: f64,
    pub flush_interval: f64,
    /// Maximum records or operations per replication message
    pub rpc_max_batch: usize,
    /// Data directory
    pub log: String,
    pub log_level: Option<String>,
    /// Prometheus text endpoint; disabled when absent
    pub metrics_port: Option<u16>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            id: 0,
            port: 4000,
            members: Vec::new(),
            pool_size: 4,
            max_message: 4 << 20,
            max_batch: 64,
            max_delay: 0.05,
            heartbeat_timeout: 0.5,
            heartbeat_interval: 0.1,
            election_timeout: 1.0,
            applied_backlog: 1024,
            rotate_interval: 600.0,
            flush_interval: 0.01,
            rpc_max_batch: 512,
            log: "./data".to_string(),
            log_level: None,
            metrics_port: None,
        }
    }
}

impl RuntimeConfig {
    /// Loads the configuration from a TOML file and installs it as the
    /// process-wide instance. Returns `None` when the file cannot be read or
    /// parsed.
    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("failed to read the runtime config file, {:?}", e);
                return None;
            }
        };
        let config: RuntimeConfig = match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("failed to parse the runtime config file, {:?}", e);
                return None;
            }
        };
        instance().lock().unwrap().clone_from(&config);
        Some(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
id = 1
port = 4001
pool_size = 4
max_message = 4194304
max_batch = 64
max_delay = 0.05
heartbeat_timeout = 0.5
heartbeat_interval = 0.1
election_timeout = 1.5
applied_backlog = 2048
rotate_interval = 600.0
flush_interval = 0.01
rpc_max_batch = 256
log = "/tmp/raftkv-1"
log_level = "debug"
metrics_port = 4011

[[members]]
host = "127.0.0.1"
port = 4000

[[members]]
host = "127.0.0.1"
port = 4001

[[members]]
host = "127.0.0.1"
port = 4002
"#
        )
        .unwrap();

        let config = RuntimeConfig::from_toml(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.id, 1);
        assert_eq!(config.members.len(), 3);
        assert_eq!(config.members[2].port, 4002);
        assert_eq!(config.election_timeout, 1.5);
        assert_eq!(config.metrics_port, Some(4011));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_missing_file_is_rejected() {
        assert!(RuntimeConfig::from_toml("/nonexistent/config.toml").is_none());
    }
}
