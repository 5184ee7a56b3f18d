//! Controller configuration.
//!
//! Values come from environment variables. Durations accept Go-style strings
//! (`10s`, `2m`, `1h30m`, `500ms`) or a bare number of seconds. A value that
//! cannot be parsed is replaced by its default and a warning is logged.

use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::errors::ConfigError;
use crate::event::DEFAULT_NAMESPACE;
use crate::leader::LeaseConfig;
use crate::observability::LogFormat;

/// Configuration of one controller replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Seconds between event dispatcher ticks.
    #[serde(default = "default_dispatch_interval")]
    pub event_dispatch_interval_seconds: f64,
    /// Seconds between sequence dispatcher ticks.
    #[serde(default = "default_dispatch_interval")]
    pub sequence_dispatch_interval_seconds: f64,
    /// Maximum events published per event dispatcher tick.
    #[serde(default = "default_batch_size")]
    pub event_dispatch_batch_size: usize,
    /// Message bus endpoint.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,
    /// Event type and subject prefix.
    #[serde(default = "default_event_namespace")]
    pub event_namespace: String,
    /// Configuration service endpoint serving shipyard documents.
    #[serde(default = "default_configuration_service")]
    pub configuration_service: String,
    /// Namespace of the lease resource.
    #[serde(default = "default_lease_namespace")]
    pub lease_namespace: String,
    /// Name of the lease resource.
    #[serde(default = "default_lease_name")]
    pub lease_name: String,
    /// Holder identity of this replica.
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Seconds an unrenewed lease stays valid.
    #[serde(default = "default_lease_duration")]
    pub lease_duration_seconds: f64,
    /// Seconds the leader keeps leading without a successful renewal.
    #[serde(default = "default_renew_deadline")]
    pub renew_deadline_seconds: f64,
    /// Seconds between lease acquisition attempts and renewals.
    #[serde(default = "default_retry_period")]
    pub retry_period_seconds: f64,
    /// Attempts made for a write that hits a state conflict.
    #[serde(default = "default_conflict_retries")]
    pub state_conflict_retries: usize,
    /// Log level filter.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_dispatch_interval() -> f64 {
    10.0
}

fn default_batch_size() -> usize {
    100
}

fn default_nats_url() -> String {
    "nats://keptn-nats".to_string()
}

fn default_event_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_configuration_service() -> String {
    "configuration-service:8080".to_string()
}

fn default_lease_namespace() -> String {
    "keptn".to_string()
}

fn default_lease_name() -> String {
    "shipyard-controller".to_string()
}

fn default_identity() -> String {
    format!("shipyard-controller-{}", crate::utils::generate_uuid())
}

fn default_lease_duration() -> f64 {
    15.0
}

fn default_renew_deadline() -> f64 {
    10.0
}

fn default_retry_period() -> f64 {
    2.0
}

fn default_conflict_retries() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            event_dispatch_interval_seconds: default_dispatch_interval(),
            sequence_dispatch_interval_seconds: default_dispatch_interval(),
            event_dispatch_batch_size: default_batch_size(),
            nats_url: default_nats_url(),
            event_namespace: default_event_namespace(),
            configuration_service: default_configuration_service(),
            lease_namespace: default_lease_namespace(),
            lease_name: default_lease_name(),
            identity: default_identity(),
            lease_duration_seconds: default_lease_duration(),
            renew_deadline_seconds: default_renew_deadline(),
            retry_period_seconds: default_retry_period(),
            state_conflict_retries: default_conflict_retries(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl ControllerConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from `lookup`, which maps a variable name to
    /// its value.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let durations: [(&str, &mut f64); 5] = [
            (
                "EVENT_DISPATCH_INTERVAL_SEC",
                &mut config.event_dispatch_interval_seconds,
            ),
            (
                "SEQUENCE_DISPATCH_INTERVAL_SEC",
                &mut config.sequence_dispatch_interval_seconds,
            ),
            ("LEASE_DURATION", &mut config.lease_duration_seconds),
            ("RENEW_DEADLINE", &mut config.renew_deadline_seconds),
            ("RETRY_PERIOD", &mut config.retry_period_seconds),
        ];
        for (key, field) in durations {
            if let Some(raw) = get(key) {
                match parse_duration(key, &raw) {
                    Ok(value) => *field = value.as_secs_f64(),
                    Err(e) => tracing::warn!(error = %e, default = *field, "Using default"),
                }
            }
        }

        let counts: [(&str, &mut usize); 2] = [
            ("EVENT_DISPATCH_BATCH_SIZE", &mut config.event_dispatch_batch_size),
            ("STATE_CONFLICT_RETRIES", &mut config.state_conflict_retries),
        ];
        for (key, field) in counts {
            if let Some(raw) = get(key) {
                match raw.trim().parse::<usize>() {
                    Ok(value) if value > 0 => *field = value,
                    _ => tracing::warn!(key, value = %raw, default = *field, "Using default"),
                }
            }
        }

        let strings: [(&str, &mut String); 7] = [
            ("NATS_URL", &mut config.nats_url),
            ("EVENT_NAMESPACE", &mut config.event_namespace),
            ("CONFIGURATION_SERVICE", &mut config.configuration_service),
            ("POD_NAMESPACE", &mut config.lease_namespace),
            ("LEASE_NAME", &mut config.lease_name),
            ("POD_NAME", &mut config.identity),
            ("LOG_LEVEL", &mut config.log_level),
        ];
        for (key, field) in strings {
            if let Some(value) = get(key) {
                *field = value.trim().to_string();
            }
        }

        if let Some(raw) = get("LOG_FORMAT") {
            match raw.parse() {
                Ok(format) => config.log_format = format,
                Err(e) => tracing::warn!(error = %e, "Using default log format"),
            }
        }

        config
    }

    /// Sets both dispatch intervals.
    #[must_use]
    pub fn with_dispatch_intervals(mut self, event: Duration, sequence: Duration) -> Self {
        self.event_dispatch_interval_seconds = event.as_secs_f64();
        self.sequence_dispatch_interval_seconds = sequence.as_secs_f64();
        self
    }

    /// Sets the lease timings.
    #[must_use]
    pub fn with_lease_timings(
        mut self,
        lease_duration: Duration,
        renew_deadline: Duration,
        retry_period: Duration,
    ) -> Self {
        self.lease_duration_seconds = lease_duration.as_secs_f64();
        self.renew_deadline_seconds = renew_deadline.as_secs_f64();
        self.retry_period_seconds = retry_period.as_secs_f64();
        self
    }

    /// Sets the holder identity.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Gets the event dispatch interval.
    #[must_use]
    pub fn event_dispatch_interval(&self) -> Duration {
        seconds(self.event_dispatch_interval_seconds)
    }

    /// Gets the sequence dispatch interval.
    #[must_use]
    pub fn sequence_dispatch_interval(&self) -> Duration {
        seconds(self.sequence_dispatch_interval_seconds)
    }

    /// Builds the lease settings of this replica.
    #[must_use]
    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig::new(
            format!("{}/{}", self.lease_namespace, self.lease_name),
            &self.identity,
        )
        .with_timings(
            seconds(self.lease_duration_seconds),
            seconds(self.renew_deadline_seconds),
            seconds(self.retry_period_seconds),
        )
    }

    /// Checks the values for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            (
                "EVENT_DISPATCH_INTERVAL_SEC",
                self.event_dispatch_interval_seconds,
            ),
            (
                "SEQUENCE_DISPATCH_INTERVAL_SEC",
                self.sequence_dispatch_interval_seconds,
            ),
            ("LEASE_DURATION", self.lease_duration_seconds),
            ("RENEW_DEADLINE", self.renew_deadline_seconds),
            ("RETRY_PERIOD", self.retry_period_seconds),
        ];
        for (key, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(key, "must be a positive duration"));
            }
        }
        if self.renew_deadline_seconds >= self.lease_duration_seconds {
            return Err(invalid(
                "RENEW_DEADLINE",
                "must be shorter than LEASE_DURATION",
            ));
        }
        if self.retry_period_seconds >= self.renew_deadline_seconds {
            return Err(invalid("RETRY_PERIOD", "must be shorter than RENEW_DEADLINE"));
        }
        if self.event_dispatch_batch_size == 0 {
            return Err(invalid("EVENT_DISPATCH_BATCH_SIZE", "must be at least 1"));
        }
        if self.state_conflict_retries == 0 {
            return Err(invalid("STATE_CONFLICT_RETRIES", "must be at least 1"));
        }
        if self.event_namespace.is_empty() || self.event_namespace.contains(['*', '>', ' ']) {
            return Err(invalid("EVENT_NAMESPACE", "must be a plain dotted subject prefix"));
        }
        if self.identity.is_empty() {
            return Err(invalid("POD_NAME", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[allow(clippy::expect_used)]
static GO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+(?:\.\d+)?(?:ns|us|µs|ms|s|m|h))+$").expect("duration pattern is valid")
});

#[allow(clippy::expect_used)]
static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)(ns|us|µs|ms|s|m|h)").expect("duration part pattern is valid")
});

/// Parses a Go-style duration or a bare number of seconds.
pub fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    let error = || ConfigError::InvalidDuration {
        key: key.to_string(),
        value: raw.to_string(),
    };

    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|_| error());
    }
    if !GO_DURATION.is_match(value) {
        return Err(error());
    }

    let mut total = 0.0_f64;
    for part in DURATION_PART.captures_iter(value) {
        let amount: f64 = part[1].parse().map_err(|_| error())?;
        let scale = match &part[2] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(error()),
        };
        total += amount * scale;
    }
    Duration::try_from_secs_f64(total).map_err(|_| error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::from_lookup(|_| None);
        assert_eq!(config.event_dispatch_interval(), Duration::from_secs(10));
        assert_eq!(config.sequence_dispatch_interval(), Duration::from_secs(10));
        assert_eq!(config.event_dispatch_batch_size, 100);
        assert_eq!(config.event_namespace, "sh.keptn.event");
        assert!(config.identity.starts_with("shipyard-controller-"));
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_go_durations() {
        assert_eq!(parse_duration("k", "10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("k", "2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("k", "1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("k", "500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("k", "1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("k", "7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("k", "ten seconds").is_err());
        assert!(parse_duration("k", "10x").is_err());
        assert!(parse_duration("k", "-5").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("EVENT_DISPATCH_INTERVAL_SEC", "2s"),
            ("SEQUENCE_DISPATCH_INTERVAL_SEC", "30"),
            ("EVENT_DISPATCH_BATCH_SIZE", "25"),
            ("EVENT_NAMESPACE", "acme.event"),
            ("POD_NAMESPACE", "ops"),
            ("LEASE_NAME", "controller"),
            ("POD_NAME", "replica-0"),
            ("LEASE_DURATION", "30s"),
            ("RENEW_DEADLINE", "20s"),
            ("RETRY_PERIOD", "4s"),
            ("LOG_FORMAT", "json"),
        ]));

        assert_eq!(config.event_dispatch_interval(), Duration::from_secs(2));
        assert_eq!(config.sequence_dispatch_interval(), Duration::from_secs(30));
        assert_eq!(config.event_dispatch_batch_size, 25);
        assert_eq!(config.event_namespace, "acme.event");
        assert_eq!(config.log_format, LogFormat::Json);

        let lease = config.lease_config();
        assert_eq!(lease.lease_name, "ops/controller");
        assert_eq!(lease.identity, "replica-0");
        assert_eq!(lease.lease_duration, Duration::from_secs(30));
        assert_eq!(lease.renew_deadline, Duration::from_secs(20));
        assert_eq!(lease.retry_period, Duration::from_secs(4));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("EVENT_DISPATCH_INTERVAL_SEC", "soon"),
            ("EVENT_DISPATCH_BATCH_SIZE", "-3"),
            ("STATE_CONFLICT_RETRIES", "0"),
            ("LOG_FORMAT", "xml"),
        ]));
        assert_eq!(config.event_dispatch_interval(), Duration::from_secs(10));
        assert_eq!(config.event_dispatch_batch_size, 100);
        assert_eq!(config.state_conflict_retries, 5);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_validate_rejects_inconsistent_lease_timings() {
        let config = ControllerConfig::new().with_lease_timings(
            Duration::from_secs(10),
            Duration::from_secs(10),
            Duration::from_secs(2),
        );
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RENEW_DEADLINE"));

        let zero = ControllerConfig::new()
            .with_dispatch_intervals(Duration::ZERO, Duration::from_secs(1));
        assert!(zero.validate().is_err());
    }
}
