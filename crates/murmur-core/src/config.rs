//! Engine configuration loaded from environment variables.
//!
//! Every setting has a default so a node can start with zero
//! configuration. Invalid values are logged and the default is kept.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use murmur_net::TransportConfig;
use murmur_shared::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_LISTEN_PORT, HYBRID_THRESHOLD, KEEPALIVE_SECS,
    MAX_ATTACHMENT_SIZE, RECONNECT_BASE_MS, RECONNECT_MAX_MS, REORDER_WAIT_MS,
};
use murmur_store::Database;

const ENV_PREFIX: &str = "MURMUR_";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of all persisted state.
    /// Env: `MURMUR_DATA_DIR`
    /// Default: the platform data directory, or `./murmur-data`.
    pub data_dir: PathBuf,

    /// TCP address the node accepts peer links on.
    /// Env: `MURMUR_LISTEN_ADDR`
    /// Default: `0.0.0.0:4101`
    pub listen_addr: SocketAddr,

    /// `<hex key> <host:port>` address book for outbound links.
    /// Env: `MURMUR_PEERS_FILE`
    pub peers_file: Option<PathBuf>,

    /// Largest decoded attachment accepted for sending or receiving.
    /// Env: `MURMUR_MAX_ATTACHMENT_BYTES`
    pub max_attachment_bytes: usize,

    /// Plaintexts above this size use a wrapped content key.
    /// Env: `MURMUR_HYBRID_THRESHOLD`
    pub hybrid_threshold: usize,

    /// Env: `MURMUR_RECONNECT_BASE_MS`
    pub reconnect_base: Duration,

    /// Env: `MURMUR_RECONNECT_MAX_MS`
    pub reconnect_max: Duration,

    /// Env: `MURMUR_KEEPALIVE_SECS`
    pub keepalive_interval: Duration,

    pub connect_timeout: Duration,

    /// Longest wait on an inbound sequence gap.
    /// Env: `MURMUR_REORDER_WAIT_MS`
    pub reorder_wait: Duration,

    /// Per-subscriber event buffer.
    /// Env: `MURMUR_EVENT_CAPACITY`
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: Database::default_data_dir().unwrap_or_else(|_| PathBuf::from("./murmur-data")),
            listen_addr: ([0, 0, 0, 0], DEFAULT_LISTEN_PORT).into(),
            peers_file: None,
            max_attachment_bytes: MAX_ATTACHMENT_SIZE,
            hybrid_threshold: HYBRID_THRESHOLD,
            reconnect_base: Duration::from_millis(RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(RECONNECT_MAX_MS),
            keepalive_interval: Duration::from_secs(KEEPALIVE_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            reorder_wait: Duration::from_millis(REORDER_WAIT_MS),
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from `MURMUR_*` environment variables, falling
    /// back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(dir) = var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = var("PEERS_FILE") {
            if !path.is_empty() {
                config.peers_file = Some(PathBuf::from(path));
            }
        }

        apply(&mut config.listen_addr, "LISTEN_ADDR", var("LISTEN_ADDR"));
        apply(
            &mut config.max_attachment_bytes,
            "MAX_ATTACHMENT_BYTES",
            var("MAX_ATTACHMENT_BYTES"),
        );
        apply(&mut config.hybrid_threshold, "HYBRID_THRESHOLD", var("HYBRID_THRESHOLD"));
        apply(&mut config.event_capacity, "EVENT_CAPACITY", var("EVENT_CAPACITY"));

        let millis = |target: &mut Duration, name: &str| {
            let mut value = target.as_millis() as u64;
            apply(&mut value, name, var(name));
            *target = Duration::from_millis(value);
        };
        millis(&mut config.reconnect_base, "RECONNECT_BASE_MS");
        millis(&mut config.reconnect_max, "RECONNECT_MAX_MS");
        millis(&mut config.reorder_wait, "REORDER_WAIT_MS");

        let mut secs = config.keepalive_interval.as_secs();
        apply(&mut secs, "KEEPALIVE_SECS", var("KEEPALIVE_SECS"));
        config.keepalive_interval = Duration::from_secs(secs.max(1));

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            reconnect_base: self.reconnect_base,
            reconnect_max: self.reconnect_max,
            keepalive_interval: self.keepalive_interval,
            connect_timeout: self.connect_timeout,
            ..TransportConfig::default()
        }
    }
}

fn apply<T: FromStr>(target: &mut T, name: &str, raw: Option<String>) {
    let Some(raw) = raw else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(
            variable = %format!("{ENV_PREFIX}{name}"),
            value = %raw,
            "Invalid value, using default"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.listen_addr.port(), DEFAULT_LISTEN_PORT);
        assert_eq!(config.reorder_wait, Duration::from_secs(2));
        assert_eq!(config.reconnect_max, Duration::from_secs(60));
        assert!(config.peers_file.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = load(&[
            ("MURMUR_DATA_DIR", "/tmp/murmur-test"),
            ("MURMUR_LISTEN_ADDR", "127.0.0.1:9000"),
            ("MURMUR_PEERS_FILE", "/etc/murmur/peers"),
            ("MURMUR_MAX_ATTACHMENT_BYTES", "1024"),
            ("MURMUR_RECONNECT_BASE_MS", "250"),
            ("MURMUR_KEEPALIVE_SECS", "5"),
            ("MURMUR_REORDER_WAIT_MS", "100"),
            ("MURMUR_EVENT_CAPACITY", "16"),
        ]);

        assert_eq!(config.data_dir, PathBuf::from("/tmp/murmur-test"));
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.peers_file, Some(PathBuf::from("/etc/murmur/peers")));
        assert_eq!(config.max_attachment_bytes, 1024);
        assert_eq!(config.reconnect_base, Duration::from_millis(250));
        assert_eq!(config.keepalive_interval, Duration::from_secs(5));
        assert_eq!(config.reorder_wait, Duration::from_millis(100));
        assert_eq!(config.event_capacity, 16);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = load(&[
            ("MURMUR_LISTEN_ADDR", "not an address"),
            ("MURMUR_HYBRID_THRESHOLD", "-1"),
            ("MURMUR_REORDER_WAIT_MS", "soon"),
        ]);
        let defaults = EngineConfig::default();

        assert_eq!(config.listen_addr, defaults.listen_addr);
        assert_eq!(config.hybrid_threshold, defaults.hybrid_threshold);
        assert_eq!(config.reorder_wait, defaults.reorder_wait);
    }

    #[test]
    fn test_transport_config_follows_engine() {
        let config = load(&[("MURMUR_RECONNECT_MAX_MS", "5000")]);
        let transport = config.transport_config();
        assert_eq!(transport.reconnect_max, Duration::from_secs(5));
        assert_eq!(transport.keepalive_interval, config.keepalive_interval);
    }
}
