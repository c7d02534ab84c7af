//! File-level configuration for breakers, limiters and retries.
//!
//! Settings use plain numeric units (`*_secs`, `*_ms`) and convert into the
//! runtime policy types after [`ResilienceConfig::validate`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::{CircuitBreakerConfig, RateLimiterConfig, RetryPolicy};

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Seconds the breaker stays open after the last failure.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Concurrent probes allowed while half-open (defaults to `success_threshold`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_open_max_calls: Option<u32>,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_success_threshold() -> u32 { 2 }
fn default_timeout_secs() -> u64 { 60 }

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_secs: default_timeout_secs(),
            half_open_max_calls: None,
        }
    }
}

impl BreakerSettings {
    pub fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                format!("{scope}.failure_threshold"),
                "must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid(
                format!("{scope}.success_threshold"),
                "must be at least 1",
            ));
        }
        if self.half_open_max_calls == Some(0) {
            return Err(ConfigError::invalid(
                format!("{scope}.half_open_max_calls"),
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(s: &BreakerSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold,
            success_threshold: s.success_threshold,
            timeout: Duration::from_secs(s.timeout_secs),
            half_open_max_calls: s.half_open_max_calls.unwrap_or(s.success_threshold),
        }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Upper bound on distinct keys tracked in memory.
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
}

fn default_max_requests() -> u32 { 60 }
fn default_period_secs() -> u64 { 60 }
fn default_max_keys() -> usize { 10_000 }

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            period_secs: default_period_secs(),
            max_keys: default_max_keys(),
        }
    }
}

impl LimiterSettings {
    pub fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::invalid(format!("{scope}.max_requests"), "must be at least 1"));
        }
        if self.period_secs == 0 {
            return Err(ConfigError::invalid(format!("{scope}.period_secs"), "must be at least 1"));
        }
        if self.max_keys == 0 {
            return Err(ConfigError::invalid(format!("{scope}.max_keys"), "must be at least 1"));
        }
        Ok(())
    }
}

impl From<&LimiterSettings> for RateLimiterConfig {
    fn from(s: &LimiterSettings) -> Self {
        Self {
            max_requests: s.max_requests,
            period: Duration::from_secs(s.period_secs),
            max_keys: s.max_keys,
        }
    }
}

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "bool_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 1_000 }
fn default_max_delay_ms() -> u64 { 60_000 }
fn default_exponential_base() -> f64 { 2.0 }
fn bool_true() -> bool { true }

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(self.exponential_base >= 1.0 && self.exponential_base.is_finite()) {
            return Err(ConfigError::invalid(
                "retry.exponential_base",
                format!("must be a finite number >= 1.0, got {}", self.exponential_base),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.initial_delay_ms",
                format!(
                    "{} exceeds max_delay_ms ({})",
                    self.initial_delay_ms, self.max_delay_ms
                ),
            ));
        }
        Ok(())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts,
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            exponential_base: s.exponential_base,
            jitter: s.jitter,
        }
    }
}

/// Log output settings, consumed by the binary that installs the subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directive string, e.g. `"info,callguard_core=debug"`.
    pub fn directives(&self) -> String {
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        let mut directives = self.level.clone();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Settings for breakers without a named override.
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
    /// Breaker name → override.
    #[serde(default)]
    pub breakers: HashMap<String, BreakerSettings>,
    /// Settings for the default limiter.
    #[serde(default)]
    pub rate_limiter: LimiterSettings,
    /// Additional named limiters (e.g. one per provider).
    #[serde(default)]
    pub limiters: HashMap<String, LimiterSettings>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub log: LogConfig,
}

impl ResilienceConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate("circuit_breaker")?;
        for (name, settings) in &self.breakers {
            settings.validate(&format!("breakers.{name}"))?;
        }
        self.rate_limiter.validate("rate_limiter")?;
        for (name, settings) in &self.limiters {
            settings.validate(&format!("limiters.{name}"))?;
        }
        self.retry.validate()
    }

    /// Breaker config for `name`, falling back to the default settings.
    pub fn breaker_config(&self, name: &str) -> CircuitBreakerConfig {
        self.breakers
            .get(name)
            .unwrap_or(&self.circuit_breaker)
            .into()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        (&self.retry).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ResilienceConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ResilienceConfig::default());
        let cb = config.breaker_config("anything");
        assert_eq!(cb.failure_threshold, 5);
        assert_eq!(cb.half_open_max_calls, 2);
        assert_eq!(cb.timeout, Duration::from_secs(60));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn named_breaker_override() {
        let config = ResilienceConfig::from_json_str(
            r#"{
                "circuit_breaker": { "failure_threshold": 3 },
                "breakers": { "openai": { "failure_threshold": 10, "timeout_secs": 5 } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.breaker_config("openai").failure_threshold, 10);
        assert_eq!(config.breaker_config("openai").timeout, Duration::from_secs(5));
        assert_eq!(config.breaker_config("search").failure_threshold, 3);
    }

    #[test]
    fn rejects_zero_threshold() {
        let err = ResilienceConfig::from_json_str(
            r#"{ "breakers": { "openai": { "failure_threshold": 0 } } }"#,
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("breakers.openai.failure_threshold"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn rejects_inverted_delays() {
        let err = ResilienceConfig::from_json_str(
            r#"{ "retry": { "initial_delay_ms": 5000, "max_delay_ms": 100 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn rejects_shrinking_base() {
        let err =
            ResilienceConfig::from_json_str(r#"{ "retry": { "exponential_base": 0.5 } }"#)
                .unwrap_err();
        assert!(err.to_string().contains("exponential_base"));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = ResilienceConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn log_directives_are_sorted() {
        let mut log = LogConfig::default();
        log.components.insert("callguard-core".into(), "debug".into());
        log.components.insert("anyhow".into(), "warn".into());
        assert_eq!(log.directives(), "info,anyhow=warn,callguard_core=debug");
    }
}
