//! Configuration management for Pressgate.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{PressgateError, Result};
use crate::ratelimit::RateLimitRules;

/// Prefix for environment variable overrides, e.g. `PRESSGATE_BATCH__MAX_CONCURRENT`.
const ENV_PREFIX: &str = "PRESSGATE";

/// Main configuration for the Pressgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PressgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Batch processing configuration
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080)
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML rules file; takes precedence over inline `rules`
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Inline rate limit rules
    #[serde(default)]
    pub rules: RateLimitRules,

    /// How often stale limiter state is compacted, in seconds
    #[serde(default = "default_compaction_interval")]
    pub compaction_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            rules: RateLimitRules::default(),
            compaction_interval_secs: default_compaction_interval(),
        }
    }
}

fn default_compaction_interval() -> u64 {
    60
}

impl RateLimitingConfig {
    /// Resolve and validate the rules to enforce.
    pub fn load_rules(&self) -> Result<RateLimitRules> {
        let rules = match &self.rules_path {
            Some(path) => RateLimitRules::from_file(path)?,
            None => self.rules.clone(),
        };
        rules.validate()?;
        Ok(rules)
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs.max(1))
    }
}

/// Batch processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum number of tasks running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-task time limit in seconds; unlimited when unset
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,

    /// Simulated external call latency for the built-in handlers, in milliseconds
    #[serde(default = "default_step_delay")]
    pub step_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            task_timeout_secs: None,
            step_delay_ms: default_step_delay(),
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}

fn default_step_delay() -> u64 {
    200
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(PressgateError::Config(
                "batch.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.task_timeout_secs == Some(0) {
            return Err(PressgateError::Config(
                "batch.task_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

impl PressgateConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| PressgateError::Config(e.to_string()))
    }

    /// Load configuration from defaults, an optional YAML file and
    /// `PRESSGATE_*` environment variables, in increasing precedence.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize::<PressgateConfig>())
            .map_err(|e| PressgateError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Limit;

    #[test]
    fn test_defaults() {
        let config = PressgateConfig::default();
        assert_eq!(config.server.bind_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.batch.max_concurrent, 3);
        assert_eq!(config.batch.task_timeout(), None);
        assert!(config.rate_limiting.load_rules().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  bind_addr: "0.0.0.0:9000"
rate_limiting:
  compaction_interval_secs: 30
  rules:
    per_ip:
      requests: 5
      window_secs: 10
batch:
  max_concurrent: 8
  task_timeout_secs: 120
"#;
        let config = PressgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.bind_addr.port(), 9000);
        assert_eq!(config.rate_limiting.compaction_interval(), Duration::from_secs(30));
        assert_eq!(config.rate_limiting.rules.per_ip, Limit::new(5, 10));
        assert_eq!(config.batch.max_concurrent, 8);
        assert_eq!(config.batch.task_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.batch.step_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = PressgateConfig::from_yaml("{}").unwrap();
        assert_eq!(config.batch.max_concurrent, 3);
        assert_eq!(config.rate_limiting.rules, RateLimitRules::default());
    }

    #[test]
    fn test_batch_validation() {
        let mut batch = BatchConfig::default();
        assert!(batch.validate().is_ok());

        batch.task_timeout_secs = Some(0);
        assert!(batch.validate().is_err());

        batch = BatchConfig {
            max_concurrent: 0,
            ..BatchConfig::default()
        };
        assert!(matches!(batch.validate(), Err(PressgateError::Config(_))));
    }

    #[test]
    fn test_invalid_inline_rules_are_rejected() {
        let mut config = RateLimitingConfig::default();
        config.rules.per_ip = Limit::new(0, 60);
        assert!(config.load_rules().is_err());
    }

    #[test]
    fn test_missing_rules_file() {
        let config = RateLimitingConfig {
            rules_path: Some("/nonexistent/pressgate-rules.yaml".to_string()),
            ..RateLimitingConfig::default()
        };
        assert!(matches!(config.load_rules(), Err(PressgateError::Io(_))));
    }

    #[test]
    fn test_load_without_file() {
        let config = PressgateConfig::load(None).unwrap();
        assert!(config.batch.max_concurrent >= 1);
    }
}
