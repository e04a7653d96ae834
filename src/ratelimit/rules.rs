//! Rate limit rules configuration.
//!
//! This module holds the thresholds the limiter enforces: a default limit, a
//! per-IP limit, a per-user limit, limits for specific endpoints and the
//! anomaly detection tuning. Every value has a default and can be overridden
//! from YAML.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::window::Limit;
use crate::error::{PressgateError, Result};

/// Complete set of rate limit rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRules {
    /// Fallback values for endpoint rules that leave a field out
    #[serde(default = "default_limit")]
    pub default: Limit,

    /// Limit applied to every request from one client IP
    #[serde(default = "default_per_ip")]
    pub per_ip: Limit,

    /// Limit applied to every request from one authenticated user
    #[serde(default = "default_per_user")]
    pub per_user: Limit,

    /// Endpoint-specific limits, keyed by route
    #[serde(default = "default_endpoints")]
    pub endpoints: HashMap<String, EndpointRule>,

    /// Suspicious activity detection
    #[serde(default)]
    pub anomaly: AnomalyRules,
}

/// A limit for one endpoint. Missing fields inherit from the default limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRule {
    /// Maximum requests per client in the window
    #[serde(default)]
    pub requests: Option<u64>,
    /// Window length in seconds
    #[serde(default)]
    pub window_secs: Option<u64>,
}

impl EndpointRule {
    /// Create a fully specified endpoint rule.
    pub const fn new(requests: u64, window_secs: u64) -> Self {
        Self {
            requests: Some(requests),
            window_secs: Some(window_secs),
        }
    }

    /// Resolve this rule against the default limit.
    pub fn resolve(&self, default: &Limit) -> Limit {
        Limit {
            requests: self.requests.unwrap_or(default.requests),
            window_secs: self.window_secs.unwrap_or(default.window_secs),
        }
    }
}

/// Tuning for suspicious activity detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyRules {
    /// Requests allowed from one IP in the detection window before it is blocked
    #[serde(default = "default_anomaly_threshold")]
    pub threshold: u64,

    /// Trailing window the threshold is measured over, in seconds
    #[serde(default = "default_detection_window")]
    pub detection_window_secs: u64,

    /// How long activity is remembered per IP, in seconds
    #[serde(default = "default_ledger_retention")]
    pub ledger_retention_secs: u64,

    /// How long a suspicious IP stays blocked, in seconds
    #[serde(default = "default_block_secs")]
    pub block_secs: u64,
}

impl Default for AnomalyRules {
    fn default() -> Self {
        Self {
            threshold: default_anomaly_threshold(),
            detection_window_secs: default_detection_window(),
            ledger_retention_secs: default_ledger_retention(),
            block_secs: default_block_secs(),
        }
    }
}

impl AnomalyRules {
    pub fn detection_window(&self) -> Duration {
        Duration::from_secs(self.detection_window_secs)
    }

    pub fn ledger_retention(&self) -> Duration {
        Duration::from_secs(self.ledger_retention_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }
}

fn default_limit() -> Limit {
    Limit::new(100, 60)
}

fn default_per_ip() -> Limit {
    Limit::new(60, 60)
}

fn default_per_user() -> Limit {
    Limit::new(120, 60)
}

fn default_endpoints() -> HashMap<String, EndpointRule> {
    HashMap::from([
        ("/api/batch/tasks".to_string(), EndpointRule::new(20, 60)),
        ("/api/batch/tasks/{id}/cancel".to_string(), EndpointRule::new(30, 60)),
    ])
}

fn default_anomaly_threshold() -> u64 {
    100
}

fn default_detection_window() -> u64 {
    60
}

fn default_ledger_retention() -> u64 {
    3600
}

fn default_block_secs() -> u64 {
    1800
}

impl Default for RateLimitRules {
    fn default() -> Self {
        Self {
            default: default_limit(),
            per_ip: default_per_ip(),
            per_user: default_per_user(),
            endpoints: default_endpoints(),
            anomaly: AnomalyRules::default(),
        }
    }
}

impl RateLimitRules {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| PressgateError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Get the resolved limit for an endpoint, if one is configured.
    pub fn endpoint_limit(&self, endpoint: &str) -> Option<Limit> {
        self.endpoints
            .get(endpoint)
            .map(|rule| rule.resolve(&self.default))
    }

    /// All endpoint limits with defaults applied.
    pub fn resolved_endpoints(&self) -> HashMap<String, Limit> {
        self.endpoints
            .iter()
            .map(|(path, rule)| (path.clone(), rule.resolve(&self.default)))
            .collect()
    }

    /// Check that every threshold is usable.
    pub fn validate(&self) -> Result<()> {
        check_limit("default", &self.default)?;
        check_limit("per_ip", &self.per_ip)?;
        check_limit("per_user", &self.per_user)?;

        let mut longest_endpoint_window = 0;
        for (path, limit) in self.resolved_endpoints() {
            check_limit(&format!("endpoint {}", path), &limit)?;
            longest_endpoint_window = longest_endpoint_window.max(limit.window_secs);
        }

        let anomaly = &self.anomaly;
        if anomaly.threshold == 0 {
            return Err(PressgateError::Config(
                "anomaly threshold must be greater than zero".to_string(),
            ));
        }
        if anomaly.detection_window_secs == 0 {
            return Err(PressgateError::Config(
                "anomaly detection window must be greater than zero".to_string(),
            ));
        }
        if anomaly.ledger_retention_secs < anomaly.detection_window_secs {
            return Err(PressgateError::Config(
                "anomaly ledger retention must cover the detection window".to_string(),
            ));
        }
        if anomaly.block_secs < longest_endpoint_window {
            return Err(PressgateError::Config(format!(
                "suspicious activity block ({}s) must not be shorter than the longest endpoint window ({}s)",
                anomaly.block_secs, longest_endpoint_window
            )));
        }

        Ok(())
    }
}

fn check_limit(name: &str, limit: &Limit) -> Result<()> {
    if limit.requests == 0 {
        return Err(PressgateError::Config(format!(
            "{} limit must allow at least one request",
            name
        )));
    }
    if limit.window_secs == 0 {
        return Err(PressgateError::Config(format!(
            "{} window must be greater than zero",
            name
        )));
    }
    Ok(())
}
