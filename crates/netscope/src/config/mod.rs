//! Configuration types for netscope.

mod rules;

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use rules::{MatchConfig, MockRuleConfig, PathMatch, RespondConfig};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetscopeConfig {
    /// Disabled engines pass every request through without recording
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Default tracing filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub mock_endpoint: MockEndpointConfig,
    #[serde(default)]
    pub rules: Vec<MockRuleConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RecorderConfig {
    /// Completed transactions retained
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// In-flight transactions tracked
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
    /// Events buffered per subscriber before it lags
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Recorded body bytes per request or response; `null` keeps everything.
    /// Callers always get the full body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    /// Pending transactions older than this are evicted
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct MockEndpointConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    /// 0 picks an ephemeral port
    #[serde(default)]
    pub port: u16,
}

fn default_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_capacity() -> usize {
    500
}

fn default_pending_capacity() -> usize {
    256
}

fn default_event_buffer() -> usize {
    1024
}

fn default_max_body_bytes() -> Option<usize> {
    Some(1024 * 1024)
}

fn default_reaper_interval_secs() -> u64 {
    30
}

fn default_grace_secs() -> u64 {
    300
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            pending_capacity: default_pending_capacity(),
            event_buffer: default_event_buffer(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            grace_secs: default_grace_secs(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl Default for MockEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host: default_host(),
            port: 0,
        }
    }
}

impl Default for NetscopeConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            log_level: default_log_level(),
            recorder: RecorderConfig::default(),
            reaper: ReaperConfig::default(),
            mock_endpoint: MockEndpointConfig::default(),
            rules: Vec::new(),
        }
    }
}

impl NetscopeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&contents).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self, anyhow::Error> {
        let config: NetscopeConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.recorder.capacity == 0 {
            anyhow::bail!("recorder.capacity must be greater than 0");
        }
        if self.recorder.pending_capacity == 0 {
            anyhow::bail!("recorder.pending_capacity must be greater than 0");
        }
        if self.recorder.event_buffer == 0 {
            anyhow::bail!("recorder.event_buffer must be greater than 0");
        }
        if self.reaper.interval_secs == 0 {
            anyhow::bail!("reaper.interval_secs must be greater than 0");
        }
        if self.mock_endpoint.enabled && self.mock_endpoint.host.trim().is_empty() {
            anyhow::bail!("mock_endpoint.host must not be empty");
        }

        let mut ids = HashSet::new();
        for rule_config in &self.rules {
            if !ids.insert(rule_config.id.as_str()) {
                anyhow::bail!("Duplicate mock rule id '{}'", rule_config.id);
            }
            let rule = rule_config.to_rule()?;
            crate::resolver::check_rule(&rule)?;
            if rule_config.respond.is_some() && !self.mock_endpoint.enabled {
                anyhow::bail!(
                    "Mock rule '{}' serves a literal response, which requires \
                     'mock_endpoint.enabled: true'",
                    rule_config.id
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
log_level: debug
recorder:
  capacity: 100
reaper:
  grace_secs: 60
mock_endpoint:
  port: 0
rules:
  - id: user-42
    match:
      method: GET
      path:
        exact: /users/42
    redirect: http://localhost:9000/users/42
  - id: users
    priority: 10
    match:
      path:
        pattern: /users/{id}
    respond:
      status: 200
      headers:
        content-type: application/json
      body: '{"id": 1}'
"#;

        let config = NetscopeConfig::from_yaml(yaml).unwrap();
        assert!(config.enabled);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.recorder.capacity, 100);
        assert_eq!(config.recorder.pending_capacity, 256);
        assert_eq!(config.reaper.grace(), Duration::from_secs(60));
        assert_eq!(config.reaper.interval(), Duration::from_secs(30));
        assert_eq!(config.mock_endpoint.host, "127.0.0.1");
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[1].priority, 10);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = NetscopeConfig::from_yaml("{}").unwrap();
        assert!(config.enabled);
        assert_eq!(config.recorder, RecorderConfig::default());
        assert!(config.mock_endpoint.enabled);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_body_capture_limit_config() {
        assert_eq!(RecorderConfig::default().max_body_bytes, Some(1024 * 1024));

        let config = NetscopeConfig::from_yaml("recorder:\n  max_body_bytes: 512\n").unwrap();
        assert_eq!(config.recorder.max_body_bytes, Some(512));

        let config = NetscopeConfig::from_yaml("recorder:\n  max_body_bytes: null\n").unwrap();
        assert_eq!(config.recorder.max_body_bytes, None);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = NetscopeConfig::from_yaml("recorder:\n  capacity: 0\n").unwrap_err();
        assert!(err.to_string().contains("recorder.capacity"));
    }

    #[test]
    fn test_rejects_duplicate_rule_ids() {
        let yaml = r#"
rules:
  - id: same
    redirect: http://a/
  - id: same
    redirect: http://b/
"#;
        let err = NetscopeConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate mock rule id"));
    }

    #[test]
    fn test_rejects_invalid_pattern() {
        let yaml = r#"
rules:
  - id: broken
    match:
      path:
        pattern: /files/{*rest}/tail
    redirect: http://a/
"#;
        assert!(NetscopeConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_literal_requires_endpoint() {
        let yaml = r#"
mock_endpoint:
  enabled: false
rules:
  - id: literal
    respond:
      body: hi
"#;
        let err = NetscopeConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("mock_endpoint.enabled"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "enabled: false\nrecorder:\n  capacity: 3").unwrap();

        let config = NetscopeConfig::from_file(file.path()).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.recorder.capacity, 3);

        assert!(NetscopeConfig::from_file("/nonexistent/netscope.yaml").is_err());
    }
}
