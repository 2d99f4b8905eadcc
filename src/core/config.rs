use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

fn default_bind() -> String {
    "127.0.0.1:6171".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_connect_deadline() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Top-level configuration for the broker runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Listener bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Whether subscription filters may use `+`/`#` wildcards. With this
    /// off, filters only ever match their literal topic.
    #[serde(default = "default_true")]
    pub wildcard_subscriptions: bool,
    /// Whether new subscriptions replay matching retained messages.
    #[serde(default = "default_true")]
    pub retained_replay: bool,
    /// Keep-alive sweep period in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// How long a fresh connection may take to complete handshake+connect.
    #[serde(default = "default_connect_deadline")]
    pub connect_deadline_secs: u64,
    /// Log filter applied when the broker runs from the CLI.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            wildcard_subscriptions: true,
            retained_replay: true,
            sweep_interval_secs: default_sweep_interval(),
            connect_deadline_secs: default_connect_deadline(),
            log_level: default_log_level(),
        }
    }
}

impl BrokerConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind address {:?}", self.bind))?;
        if self.connect_deadline_secs == 0 {
            bail!("connect_deadline_secs must be positive");
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        BrokerConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: BrokerConfig = toml::from_str(
            r#"
bind = "0.0.0.0:1883"
retained_replay = false
"#,
        )
        .unwrap();
        assert_eq!(config.bind, "0.0.0.0:1883");
        assert!(!config.retained_replay);
        assert!(config.wildcard_subscriptions);
        assert_eq!(config.sweep_interval_secs, 5);
        config.validate().unwrap();
    }

    #[test]
    fn bad_bind_is_rejected() {
        let config = BrokerConfig {
            bind: "not-an-addr".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let config = BrokerConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = BrokerConfig {
            connect_deadline_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_path_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photon.toml");
        std::fs::write(&path, "bind = \"127.0.0.1:0\"\nsweep_interval_secs = 1\n").unwrap();
        let config = BrokerConfig::from_path(&path).unwrap();
        assert_eq!(config.sweep_interval_secs, 1);
    }
}
