use std::{fs, io, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub namespace: String,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub discovery_window_ms: u64,
    pub snapshot_timeout_ms: u64,
    pub snapshot_attempts: u32,
    pub claim_settle_ms: u64,
    pub claim_jitter_ms: u64,
    pub sweep_interval_ms: u64,
    pub single_active_tab: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            namespace: "tabsync".to_owned(),
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 2_000,
            discovery_window_ms: 300,
            snapshot_timeout_ms: 500,
            snapshot_attempts: 3,
            claim_settle_ms: 50,
            claim_jitter_ms: 25,
            sweep_interval_ms: 100,
            single_active_tab: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("metadata read failed: {0}")]
    Metadata(io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(io::Error),
    #[error("parse failed: {0}")]
    Parse(serde_json::Error),
    #[error("invalid value: {0}")]
    Invalid(String),
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".to_owned()));
        }
        let durations = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("discovery_window_ms", self.discovery_window_ms),
            ("snapshot_timeout_ms", self.snapshot_timeout_ms),
            ("claim_settle_ms", self.claim_settle_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }
        // The master refreshes its record once per beacon, which must happen at
        // least twice per timeout window.
        if self.heartbeat_interval_ms.saturating_mul(2) > self.heartbeat_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_timeout_ms ({}) must be at least twice heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.sweep_interval_ms > self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "sweep_interval_ms must not exceed heartbeat_interval_ms".to_owned(),
            ));
        }
        if self.snapshot_attempts == 0 {
            return Err(ConfigError::Invalid(
                "snapshot_attempts must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn claim_settle(&self) -> Duration {
        Duration::from_millis(self.claim_settle_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

pub fn parse_config_json(data: &str) -> Result<CoordinatorConfig, ConfigError> {
    let config: CoordinatorConfig = serde_json::from_str(data).map_err(ConfigError::Parse)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config_from_path(path: &Path) -> Result<CoordinatorConfig, ConfigError> {
    let meta = fs::metadata(path).map_err(ConfigError::Metadata)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigError::Read)?;
    parse_config_json(&data)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        CoordinatorConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = parse_config_json(r#"{"single_active_tab": true, "namespace": "chat"}"#)
            .expect("parse partial config");
        assert!(config.single_active_tab);
        assert_eq!(config.namespace, "chat");
        assert_eq!(config.heartbeat_interval_ms, 1_000);
        assert_eq!(config.discovery_window_ms, 300);
    }

    #[test]
    fn timeout_shorter_than_two_beacons_is_rejected() {
        let config = CoordinatorConfig {
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 1_500,
            ..CoordinatorConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("twice"), "unexpected error: {err}");
    }

    #[test]
    fn zero_durations_and_attempts_are_rejected() {
        let config = CoordinatorConfig {
            discovery_window_ms: 0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = CoordinatorConfig {
            snapshot_attempts: 0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_config_file_is_refused() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = dir.path().join("tabsync.json");

        let mut file = fs::File::create(&path).expect("create config");
        file.write_all(&vec![b' '; (MAX_CONFIG_BYTES as usize) + 1])
            .expect("write oversized config");
        drop(file);

        let err = load_config_from_path(&path).expect_err("oversized file should error");
        assert!(err.to_string().contains("too large"), "unexpected error: {err}");
    }
}
