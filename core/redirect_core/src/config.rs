//! Engine configuration, loaded from a JSON file.
//!
//! ```json
//! {
//!   "max_packet_buffer": 1000,
//!   "expiration_delay_secs": 120,
//!   "reaper_interval_secs": 60,
//!   "workers": 4,
//!   "state_dir": "/var/lib/redirector",
//!   "targets": [{
//!     "filter": { "protocol": "tcp", "dst_host": "10.0.0.9", "dst_ports": [80] },
//!     "lih": "10.0.0.9",
//!     "backends": [{ "id": 3, "addr": "10.0.1.3" }],
//!     "uplinks": ["192.0.2.1"],
//!     "rule": { "module": "random", "config": { "value": "10" } }
//!   }]
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::target::Target;

pub const DEFAULT_MAX_PACKET_BUFFER: usize = 1000;
pub const DEFAULT_EXPIRATION_DELAY_SECS: u64 = 120;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One node of a decision tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub module: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// Evaluated when this node accepts
    #[serde(default)]
    pub accept: Option<Box<RuleConfig>>,
    /// Evaluated when this node rejects
    #[serde(default)]
    pub reject: Option<Box<RuleConfig>>,
}

fn default_max_packet_buffer() -> usize {
    DEFAULT_MAX_PACKET_BUFFER
}

fn default_expiration_delay_secs() -> u64 {
    DEFAULT_EXPIRATION_DELAY_SECS
}

fn default_reaper_interval_secs() -> u64 {
    DEFAULT_REAPER_INTERVAL_SECS
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Packets retained per flow for replay
    #[serde(default = "default_max_packet_buffer")]
    pub max_packet_buffer: usize,
    /// Idle time after which a flow is reaped
    #[serde(default = "default_expiration_delay_secs")]
    pub expiration_delay_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Where decision modules persist their state
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    pub targets: Vec<Target>,
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("no targets configured".into()));
        }
        if self.max_packet_buffer == 0 {
            return Err(ConfigError::Invalid("max_packet_buffer must be positive".into()));
        }
        if self.reaper_interval_secs == 0 {
            return Err(ConfigError::Invalid("reaper_interval_secs must be positive".into()));
        }
        for (i, target) in self.targets.iter().enumerate() {
            let mut seen = HashSet::new();
            for backend in &target.backends {
                if backend.id == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "target {}: backend id 0 is reserved",
                        i
                    )));
                }
                if !seen.insert(backend.id) {
                    return Err(ConfigError::Invalid(format!(
                        "target {}: duplicate backend id {}",
                        i, backend.id
                    )));
                }
            }
            if let Some(id) = target.backend {
                if target.backend(id).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "target {}: default backend {} is not configured",
                        i, id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn expiration_delay(&self) -> Duration {
        Duration::from_secs(self.expiration_delay_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Protocol;
    use std::net::Ipv4Addr;

    const SAMPLE: &str = r#"{
        "targets": [{
            "filter": { "protocol": "tcp", "dst_net": "10.0.0.0/24", "dst_ports": [80] },
            "lih": "10.0.0.9",
            "backends": [{ "id": 3, "addr": "10.0.1.3" }, { "id": 4, "addr": "10.0.1.4", "port": 8080 }],
            "uplinks": ["192.0.2.1"],
            "rule": {
                "module": "yesno",
                "config": { "value": "yes" },
                "accept": { "module": "random", "config": { "value": "2" } }
            }
        }]
    }"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = EngineConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.max_packet_buffer, DEFAULT_MAX_PACKET_BUFFER);
        assert_eq!(config.expiration_delay(), Duration::from_secs(120));
        assert_eq!(config.reaper_interval(), Duration::from_secs(60));
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert!(config.state_dir.is_none());

        let target = &config.targets[0];
        assert_eq!(target.filter.protocol, Some(Protocol::Tcp));
        assert_eq!(target.lih, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(target.backend(4).unwrap().port, Some(8080));
        assert_eq!(target.uplinks, vec![Ipv4Addr::new(192, 0, 2, 1)]);

        let rule = target.rule.as_ref().unwrap();
        assert_eq!(rule.module, "yesno");
        assert_eq!(rule.accept.as_ref().unwrap().module, "random");
        assert!(rule.reject.is_none());
    }

    #[test]
    fn test_rejects_empty_targets() {
        let err = EngineConfig::from_json(r#"{ "targets": [] }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_backend_zero() {
        let text = r#"{ "targets": [{ "filter": {}, "lih": "10.0.0.9",
            "backends": [{ "id": 0, "addr": "10.0.1.3" }] }] }"#;
        assert!(matches!(
            EngineConfig::from_json(text).unwrap_err(),
            ConfigError::Invalid(_)
        ));
    }

    #[test]
    fn test_rejects_duplicate_backend() {
        let text = r#"{ "targets": [{ "filter": {}, "lih": "10.0.0.9",
            "backends": [{ "id": 1, "addr": "10.0.1.3" }, { "id": 1, "addr": "10.0.1.4" }] }] }"#;
        assert!(matches!(
            EngineConfig::from_json(text).unwrap_err(),
            ConfigError::Invalid(_)
        ));
    }

    #[test]
    fn test_rejects_bad_json() {
        assert!(matches!(
            EngineConfig::from_json("{ not json").unwrap_err(),
            ConfigError::Json(_)
        ));
    }

    #[test]
    fn test_from_missing_file() {
        let err = EngineConfig::from_file(Path::new("/nonexistent/redirector.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
