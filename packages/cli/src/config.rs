// ABOUTME: Process configuration read from DOCKFORMER_* environment variables
// ABOUTME: Values are validated into typed settings and turned into library config structs

use dockformer_api::ApiConfig;
use dockformer_reconciler::{
    CallTimeouts, LogStreamerConfig, ReconcilerConfig, RetryPolicy, SupervisorConfig,
};
use dockformer_runtime::DockerRuntimeConfig;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid port number: {0}")]
    InvalidPort(#[from] ParseIntError),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("Invalid bind address: {0}")]
    InvalidBind(String),
    #[error("Invalid runtime '{0}' (expected docker or memory)")]
    InvalidRuntime(String),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Could not determine a data directory; set DOCKFORMER_DB_PATH")]
    NoDataDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RuntimeKind {
    Docker,
    Memory,
}

impl FromStr for RuntimeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(RuntimeKind::Docker),
            "memory" => Ok(RuntimeKind::Memory),
            _ => Err(ConfigError::InvalidRuntime(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    pub db_path: PathBuf,
    pub runtime: RuntimeKind,
    pub call_timeout: Duration,
    pub create_timeout: Duration,
    pub stop_timeout: Duration,
    pub refresh_interval: Duration,
    /// `None` when drift correction is disabled
    pub drift_interval: Option<Duration>,
    pub log_tail: usize,
    pub max_manifest_bytes: usize,
    pub manifest_history: u32,
    pub reconcile_on_start: bool,
    pub cors_origin: String,
    pub log_level: String,
    pub log_json: bool,
}

fn parse_value<T: FromStr>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

fn parse_bool(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue { key, value: v }),
    }
}

fn seconds(key: &'static str, raw: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    let secs = parse_value::<u64>(key, raw, default)?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn default_db_path() -> Result<PathBuf, ConfigError> {
    dirs::data_dir()
        .map(|dir| dir.join("dockformer").join("dockformer.db"))
        .ok_or(ConfigError::NoDataDir)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind = lookup("DOCKFORMER_BIND").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind = bind
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidBind(bind.clone()))?;

        let port = lookup("DOCKFORMER_PORT")
            .unwrap_or_else(|| "8080".to_string())
            .trim()
            .parse::<u16>()?;
        if port == 0 {
            return Err(ConfigError::PortOutOfRange(port));
        }

        let db_path = match lookup("DOCKFORMER_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };

        let runtime = lookup("DOCKFORMER_RUNTIME")
            .unwrap_or_else(|| "docker".to_string())
            .parse::<RuntimeKind>()?;

        let drift_secs = parse_value::<u64>(
            "DOCKFORMER_DRIFT_INTERVAL_SECS",
            lookup("DOCKFORMER_DRIFT_INTERVAL_SECS"),
            60,
        )?;

        let max_manifest_bytes = parse_value(
            "DOCKFORMER_MAX_MANIFEST_BYTES",
            lookup("DOCKFORMER_MAX_MANIFEST_BYTES"),
            1024 * 1024,
        )?;
        if max_manifest_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DOCKFORMER_MAX_MANIFEST_BYTES",
                value: "0".to_string(),
            });
        }

        Ok(Config {
            bind,
            port,
            db_path,
            runtime,
            call_timeout: seconds(
                "DOCKFORMER_CALL_TIMEOUT_SECS",
                lookup("DOCKFORMER_CALL_TIMEOUT_SECS"),
                30,
            )?,
            create_timeout: seconds(
                "DOCKFORMER_CREATE_TIMEOUT_SECS",
                lookup("DOCKFORMER_CREATE_TIMEOUT_SECS"),
                600,
            )?,
            stop_timeout: seconds(
                "DOCKFORMER_STOP_TIMEOUT_SECS",
                lookup("DOCKFORMER_STOP_TIMEOUT_SECS"),
                10,
            )?,
            refresh_interval: seconds(
                "DOCKFORMER_REFRESH_INTERVAL_SECS",
                lookup("DOCKFORMER_REFRESH_INTERVAL_SECS"),
                10,
            )?,
            drift_interval: (drift_secs > 0).then(|| Duration::from_secs(drift_secs)),
            log_tail: parse_value("DOCKFORMER_LOG_TAIL", lookup("DOCKFORMER_LOG_TAIL"), 100)?,
            max_manifest_bytes,
            manifest_history: parse_value(
                "DOCKFORMER_MANIFEST_HISTORY",
                lookup("DOCKFORMER_MANIFEST_HISTORY"),
                20,
            )?,
            reconcile_on_start: parse_bool(
                "DOCKFORMER_RECONCILE_ON_START",
                lookup("DOCKFORMER_RECONCILE_ON_START"),
                true,
            )?,
            cors_origin: lookup("CORS_ORIGIN")
                .unwrap_or_else(|| "http://localhost:5173".to_string()),
            log_level: lookup("DOCKFORMER_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_json: parse_bool(
                "DOCKFORMER_LOG_JSON",
                lookup("DOCKFORMER_LOG_JSON"),
                false,
            )?,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            timeouts: CallTimeouts {
                // Stopping waits for the grace period inside the call
                call: self.call_timeout.max(self.stop_timeout + Duration::from_secs(5)),
                create: self.create_timeout,
            },
            retry: RetryPolicy::default(),
            manifest_history: self.manifest_history,
        }
    }

    pub fn docker(&self) -> DockerRuntimeConfig {
        DockerRuntimeConfig {
            stop_grace: self.stop_timeout,
            pull_timeout: self.create_timeout,
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            refresh_interval: self.refresh_interval,
            drift_interval: self.drift_interval,
        }
    }

    pub fn log_streamer(&self) -> LogStreamerConfig {
        LogStreamerConfig {
            default_tail: self.log_tail,
            ..LogStreamerConfig::default()
        }
    }

    pub fn api(&self) -> ApiConfig {
        ApiConfig {
            max_manifest_bytes: self.max_manifest_bytes,
            ..ApiConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .chain([("DOCKFORMER_DB_PATH".to_string(), ":memory:".to_string())])
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_with(&[]).unwrap();
        assert_eq!(config.addr(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.runtime, RuntimeKind::Docker);
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.create_timeout, Duration::from_secs(600));
        assert_eq!(config.refresh_interval, Duration::from_secs(10));
        assert_eq!(config.drift_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.log_tail, 100);
        assert_eq!(config.max_manifest_bytes, 1024 * 1024);
        assert!(config.reconcile_on_start);
        assert_eq!(config.cors_origin, "http://localhost:5173");
        assert!(!config.log_json);
    }

    #[test]
    fn test_overrides() {
        let config = config_with(&[
            ("DOCKFORMER_BIND", "0.0.0.0"),
            ("DOCKFORMER_PORT", "9000"),
            ("DOCKFORMER_RUNTIME", "Memory"),
            ("DOCKFORMER_DRIFT_INTERVAL_SECS", "0"),
            ("DOCKFORMER_RECONCILE_ON_START", "false"),
            ("DOCKFORMER_LOG_JSON", "1"),
        ])
        .unwrap();

        assert_eq!(config.addr(), "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.runtime, RuntimeKind::Memory);
        assert_eq!(config.drift_interval, None);
        assert!(!config.reconcile_on_start);
        assert!(config.log_json);
        assert_eq!(config.db_path, PathBuf::from(":memory:"));
    }

    #[rstest]
    #[case("DOCKFORMER_PORT", "0")]
    #[case("DOCKFORMER_PORT", "not-a-number")]
    #[case("DOCKFORMER_BIND", "localhost:80")]
    #[case("DOCKFORMER_RUNTIME", "podman")]
    #[case("DOCKFORMER_CALL_TIMEOUT_SECS", "0")]
    #[case("DOCKFORMER_LOG_TAIL", "-1")]
    #[case("DOCKFORMER_RECONCILE_ON_START", "maybe")]
    #[case("DOCKFORMER_MAX_MANIFEST_BYTES", "0")]
    fn test_invalid_values_are_rejected(#[case] key: &str, #[case] value: &str) {
        assert!(config_with(&[(key, value)]).is_err(), "{}={}", key, value);
    }

    #[test]
    fn test_call_timeout_covers_stop_grace() {
        let config = config_with(&[
            ("DOCKFORMER_CALL_TIMEOUT_SECS", "5"),
            ("DOCKFORMER_STOP_TIMEOUT_SECS", "20"),
        ])
        .unwrap();
        assert_eq!(config.reconciler().timeouts.call, Duration::from_secs(25));
        assert_eq!(config.docker().stop_grace, Duration::from_secs(20));
    }
}
