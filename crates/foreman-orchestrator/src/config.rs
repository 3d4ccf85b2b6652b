use crate::profiles::{REASONING_KEY, SEARCH_KEY};
use foreman_core::{ForemanError, ForemanResult};
use foreman_resilience::{BucketConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tuning knobs for a [`WorkflowCoordinator`](crate::WorkflowCoordinator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Tasks executing at once, across all workflows.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Token bucket per external service key.
    #[serde(default = "default_rate_limits")]
    pub rate_limits: HashMap<String, BucketConfig>,
    /// Bucket given to keys missing from `rate_limits`. Unset means such keys are refused.
    #[serde(default)]
    pub default_bucket: Option<BucketConfig>,
    /// Longest a single call waits for a rate-limit token.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Per-subscriber event backlog.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Capacity per resource type.
    #[serde(default)]
    pub resources: HashMap<String, u64>,
    /// Publish a utilization alert at or above this committed fraction.
    #[serde(default = "default_alert_threshold")]
    pub utilization_alert_threshold: f64,
}

fn default_max_workers() -> usize {
    4
}
fn default_rate_limits() -> HashMap<String, BucketConfig> {
    HashMap::from([
        (REASONING_KEY.to_string(), BucketConfig::new(10.0, 5.0)),
        (SEARCH_KEY.to_string(), BucketConfig::new(5.0, 2.0)),
    ])
}
fn default_acquire_timeout_ms() -> u64 {
    30_000
}
fn default_event_buffer() -> usize {
    256
}
fn default_alert_threshold() -> f64 {
    0.9
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            retry: RetryPolicy::default(),
            rate_limits: default_rate_limits(),
            default_bucket: None,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            event_buffer: default_event_buffer(),
            resources: HashMap::new(),
            utilization_alert_threshold: default_alert_threshold(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> ForemanResult<()> {
        if self.max_workers == 0 {
            return Err(ForemanError::Config("max_workers must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ForemanError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(self.utilization_alert_threshold > 0.0 && self.utilization_alert_threshold <= 1.0) {
            return Err(ForemanError::Config(format!(
                "utilization_alert_threshold must be in (0, 1], got {}",
                self.utilization_alert_threshold
            )));
        }
        let buckets = self
            .rate_limits
            .iter()
            .map(|(k, b)| (k.as_str(), b))
            .chain(self.default_bucket.as_ref().map(|b| ("default_bucket", b)));
        for (key, bucket) in buckets {
            if bucket.capacity < 1.0 || bucket.refill_per_second <= 0.0 {
                return Err(ForemanError::Config(format!(
                    "rate limit '{key}' needs capacity >= 1 and a positive refill rate"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limits[REASONING_KEY], BucketConfig::new(10.0, 5.0));
        assert_eq!(config.rate_limits[SEARCH_KEY], BucketConfig::new(5.0, 2.0));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"max_workers": 8, "resources": {"workers": 10}}"#).unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.resources["workers"], 10);
        assert_eq!(config.acquire_timeout_ms, 30_000);
        assert_eq!(config.rate_limits.len(), 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = CoordinatorConfig::default();
        config.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.utilization_alert_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.default_bucket = Some(BucketConfig::new(0.0, 1.0));
        assert!(config.validate().is_err());
    }
}
