use crate::error::{OrchestrateError, Result};
use crate::retry::RetryPolicy;
use devbox_common::RootVolumeSpec;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Operator settings, read from `~/.config/devbox/default.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DevboxConfig {
    pub region: String,
    pub default_az: String,
    pub dns_name: Option<String>,
    pub dns_zone: Option<String>,
    /// Bid used for replacements when the original has no market request.
    pub default_max_price: String,
    /// Hostname written into boot configs when the resource has no `Name` tag.
    pub fallback_hostname: String,
    pub root_volume: RootVolumeSpec,
}

impl Default for DevboxConfig {
    fn default() -> Self {
        Self {
            region: "us-east-2".to_string(),
            default_az: "us-east-2a".to_string(),
            dns_name: None,
            dns_zone: None,
            default_max_price: "2.00".to_string(),
            fallback_hostname: "dev-workstation".to_string(),
            root_volume: RootVolumeSpec::default(),
        }
    }
}

impl DevboxConfig {
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(p) = env::var("DEVBOX_CONFIG") {
            return Some(PathBuf::from(p));
        }
        dirs::home_dir().map(|h| h.join(".config").join("devbox").join("default.json"))
    }

    /// Defaults, then the config file (if any), then environment overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = match Self::default_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| env::var(key).ok());
        Ok(cfg)
    }

    /// A missing file yields the defaults; an unreadable or malformed one is an error.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(OrchestrateError::Config(format!(
                    "reading config {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&raw).map_err(|e| {
            OrchestrateError::Config(format!("parsing config {}: {}", path.display(), e))
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(region) = non_empty("DEVBOX_REGION") {
            self.region = region;
        }
        if let Some(name) = non_empty("DEVBOX_DNS_NAME") {
            self.dns_name = Some(name);
        }
        if let Some(zone) = non_empty("DEVBOX_DNS_ZONE") {
            self.dns_zone = Some(zone);
        }
        if let Some(price) = non_empty("DEVBOX_MAX_PRICE") {
            self.default_max_price = price;
        }
    }
}

/// Poll cadence, timeouts and retry bounds handed to every orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub instance_poll: Duration,
    pub volume_poll: Duration,
    pub snapshot_poll: Duration,
    pub instance_timeout: Duration,
    pub volume_timeout: Duration,
    pub snapshot_timeout: Duration,
    pub start_retry: RetryPolicy,
    pub price_window: Duration,
    pub price_batch_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            instance_poll: Duration::from_secs(5),
            volume_poll: Duration::from_secs(5),
            snapshot_poll: Duration::from_secs(15),
            instance_timeout: Duration::from_secs(5 * 60),
            volume_timeout: Duration::from_secs(2 * 60),
            snapshot_timeout: Duration::from_secs(30 * 60),
            start_retry: RetryPolicy::default(),
            price_window: Duration::from_secs(60 * 60),
            price_batch_size: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = DevboxConfig::from_file(Path::new("/nonexistent/devbox/default.json")).unwrap();
        assert_eq!(cfg, DevboxConfig::default());
        assert_eq!(cfg.root_volume.size_gib, 75);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = env::temp_dir().join(format!("devbox-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("default.json");
        std::fs::write(&path, r#"{"dns_name": "dev.example.com", "default_max_price": "0.75"}"#)
            .unwrap();

        let cfg = DevboxConfig::from_file(&path).unwrap();
        assert_eq!(cfg.dns_name.as_deref(), Some("dev.example.com"));
        assert_eq!(cfg.default_max_price, "0.75");
        assert_eq!(cfg.region, "us-east-2");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn malformed_file_names_the_path() {
        let dir = env::temp_dir().join(format!("devbox-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("default.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = DevboxConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("default.json"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("DEVBOX_REGION", "eu-west-1"),
            ("DEVBOX_MAX_PRICE", "1.10"),
            ("DEVBOX_DNS_ZONE", "  "),
        ]
        .into_iter()
        .collect();
        let mut cfg = DevboxConfig::default();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.region, "eu-west-1");
        assert_eq!(cfg.default_max_price, "1.10");
        assert_eq!(cfg.dns_zone, None);
    }

    #[test]
    fn orchestrator_defaults_match_operation_durations() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.snapshot_timeout, Duration::from_secs(1800));
        assert_eq!(cfg.start_retry.max_attempts, 6);
        assert_eq!(cfg.price_batch_size, 100);
    }
}
