//! Controller configuration from `PIPEWISE_*` environment variables
//!
//! Every key is optional. Durations use the same grammar as experiment
//! durations ("30s", "5m", "2h"); booleans accept "true" or "1".

use crate::controller::aggregator::AggregatorSettings;
use crate::controller::analysis::AnalysisSettings;
use crate::controller::experiment::{parse_duration, ControllerSettings, MachineSettings};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub health_port: u16,
    /// SQLite database file; `None` keeps experiments in memory
    pub database_path: Option<String>,
    pub prometheus_address: String,
    pub template_service_url: String,
    pub execution_service_url: String,
    pub collector_health_url: String,
    pub events_enabled: bool,
    pub events_sink_url: Option<String>,
    pub namespace: String,
    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub call_timeout: Duration,
    pub reconcile_interval: Duration,
    pub auto_start: bool,
    pub analysis_alpha: f64,
    pub analysis_confidence_level: f64,
    pub analysis_min_samples: usize,
    pub restart_threshold: u32,
    pub error_rate_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            health_port: 8080,
            database_path: None,
            prometheus_address: "http://localhost:9090".to_string(),
            template_service_url: "http://localhost:8081".to_string(),
            execution_service_url: "http://localhost:8082".to_string(),
            collector_health_url: "http://localhost:8083".to_string(),
            events_enabled: false,
            events_sink_url: None,
            namespace: "pipewise-experiments".to_string(),
            readiness_timeout: Duration::from_secs(300),
            readiness_poll_interval: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(10),
            auto_start: true,
            analysis_alpha: 0.05,
            analysis_confidence_level: 0.95,
            analysis_min_samples: 30,
            restart_threshold: 5,
            error_rate_threshold: 0.05,
        }
    }
}

impl Config {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Config::default();

        let config = Config {
            health_port: env.parsed("PIPEWISE_HEALTH_PORT", defaults.health_port)?,
            database_path: env.optional("PIPEWISE_DATABASE_PATH"),
            prometheus_address: env.string("PIPEWISE_PROMETHEUS_ADDRESS", defaults.prometheus_address),
            template_service_url: env
                .string("PIPEWISE_TEMPLATE_SERVICE_URL", defaults.template_service_url),
            execution_service_url: env
                .string("PIPEWISE_EXECUTION_SERVICE_URL", defaults.execution_service_url),
            collector_health_url: env
                .string("PIPEWISE_COLLECTOR_HEALTH_URL", defaults.collector_health_url),
            events_enabled: env.flag("PIPEWISE_EVENTS_ENABLED", defaults.events_enabled),
            events_sink_url: env.optional("PIPEWISE_EVENTS_SINK_URL"),
            namespace: env.string("PIPEWISE_NAMESPACE", defaults.namespace),
            readiness_timeout: env
                .duration("PIPEWISE_READINESS_TIMEOUT", defaults.readiness_timeout)?,
            readiness_poll_interval: env.duration(
                "PIPEWISE_READINESS_POLL_INTERVAL",
                defaults.readiness_poll_interval,
            )?,
            call_timeout: env.duration("PIPEWISE_CALL_TIMEOUT", defaults.call_timeout)?,
            reconcile_interval: env
                .duration("PIPEWISE_RECONCILE_INTERVAL", defaults.reconcile_interval)?,
            auto_start: env.flag("PIPEWISE_AUTO_START", defaults.auto_start),
            analysis_alpha: env.parsed("PIPEWISE_ANALYSIS_ALPHA", defaults.analysis_alpha)?,
            analysis_confidence_level: env.parsed(
                "PIPEWISE_ANALYSIS_CONFIDENCE_LEVEL",
                defaults.analysis_confidence_level,
            )?,
            analysis_min_samples: env
                .parsed("PIPEWISE_ANALYSIS_MIN_SAMPLES", defaults.analysis_min_samples)?,
            restart_threshold: env
                .parsed("PIPEWISE_RESTART_THRESHOLD", defaults.restart_threshold)?,
            error_rate_threshold: env
                .parsed("PIPEWISE_ERROR_RATE_THRESHOLD", defaults.error_rate_threshold)?,
        };

        for (key, value) in [
            ("PIPEWISE_ANALYSIS_ALPHA", config.analysis_alpha),
            (
                "PIPEWISE_ANALYSIS_CONFIDENCE_LEVEL",
                config.analysis_confidence_level,
            ),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.to_string(),
                    reason: "must be between 0 and 1".to_string(),
                });
            }
        }
        Ok(config)
    }

    pub fn machine_settings(&self) -> MachineSettings {
        MachineSettings {
            namespace: self.namespace.clone(),
            readiness_timeout: self.readiness_timeout,
            readiness_poll_interval: self.readiness_poll_interval,
            call_timeout: self.call_timeout,
        }
    }

    pub fn analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            alpha: self.analysis_alpha,
            confidence_level: self.analysis_confidence_level,
            min_samples: self.analysis_min_samples,
            ..Default::default()
        }
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            restart_threshold: self.restart_threshold,
            error_rate_threshold: self.error_rate_threshold,
            call_timeout: self.call_timeout,
            ..Default::default()
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            interval: self.reconcile_interval,
            auto_start: self.auto_start,
        }
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty, trimmed value
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.optional(key).unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.optional(key)
            .map(|v| v == "true" || v == "1")
            .unwrap_or(default)
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn duration(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => parse_duration(&value).ok_or_else(|| ConfigError::Invalid {
                key,
                value,
                reason: "expected a duration like 30s, 5m or 2h".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = config(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.database_path, None);
        assert_eq!(config.readiness_timeout, Duration::from_secs(300));
        assert!(config.auto_start);
        assert!(!config.events_enabled);
    }

    #[test]
    fn test_values_are_read() {
        let config = config(&[
            ("PIPEWISE_HEALTH_PORT", "9000"),
            ("PIPEWISE_DATABASE_PATH", "/var/lib/pipewise/db.sqlite"),
            ("PIPEWISE_EVENTS_ENABLED", "1"),
            ("PIPEWISE_EVENTS_SINK_URL", "http://events:8080"),
            ("PIPEWISE_READINESS_TIMEOUT", "10m"),
            ("PIPEWISE_AUTO_START", "false"),
            ("PIPEWISE_ANALYSIS_MIN_SAMPLES", "50"),
            ("PIPEWISE_ERROR_RATE_THRESHOLD", "0.1"),
        ])
        .unwrap();

        assert_eq!(config.health_port, 9000);
        assert_eq!(
            config.database_path.as_deref(),
            Some("/var/lib/pipewise/db.sqlite")
        );
        assert!(config.events_enabled);
        assert_eq!(config.events_sink_url.as_deref(), Some("http://events:8080"));
        assert_eq!(config.readiness_timeout, Duration::from_secs(600));
        assert!(!config.auto_start);
        assert_eq!(config.analysis_settings().min_samples, 50);
        assert_eq!(config.aggregator_settings().error_rate_threshold, 0.1);
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let config = config(&[("PIPEWISE_DATABASE_PATH", "  "), ("PIPEWISE_NAMESPACE", "")]).unwrap();
        assert_eq!(config.database_path, None);
        assert_eq!(config.namespace, "pipewise-experiments");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = config(&[("PIPEWISE_HEALTH_PORT", "http")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PIPEWISE_HEALTH_PORT", .. }));

        let err = config(&[("PIPEWISE_CALL_TIMEOUT", "soon")]).unwrap_err();
        assert!(err.to_string().contains("PIPEWISE_CALL_TIMEOUT"));

        let err = config(&[("PIPEWISE_ANALYSIS_ALPHA", "1.5")]).unwrap_err();
        assert!(err.to_string().contains("between 0 and 1"));
    }

    #[test]
    fn test_settings_are_derived() {
        let config = config(&[
            ("PIPEWISE_NAMESPACE", "trials"),
            ("PIPEWISE_CALL_TIMEOUT", "5s"),
            ("PIPEWISE_RECONCILE_INTERVAL", "1m"),
        ])
        .unwrap();

        let machine = config.machine_settings();
        assert_eq!(machine.namespace, "trials");
        assert_eq!(machine.call_timeout, Duration::from_secs(5));
        assert_eq!(config.aggregator_settings().call_timeout, Duration::from_secs(5));
        assert_eq!(config.controller_settings().interval, Duration::from_secs(60));
    }
}
