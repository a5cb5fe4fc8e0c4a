//! Configuration management for Turnstile.
//!
//! Settings are read once at startup: built-in defaults, then an optional
//! YAML file, then environment variables. Policy keys use the `RATE_LIMIT_`
//! prefix, service keys the `TURNSTILE_` prefix. Both land in one flat
//! [`Settings`] value which is then resolved into typed, validated pieces.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use tracing::info;

use crate::error::{Result, TurnstileError};

const POLICY_ENV_PREFIX: &str = "RATE_LIMIT";
const SERVICE_ENV_PREFIX: &str = "TURNSTILE";
const POLICY_KEYS: [&str; 15] = [
    "enabled",
    "login_enabled",
    "login_max",
    "login_window_seconds",
    "block_seconds",
    "api_enabled",
    "api_max",
    "api_window_seconds",
    "api_block_seconds",
    "exclude_healthcheck",
    "protected_prefixes",
    "login_paths",
    "health_paths",
    "excluded_paths",
    "forwarded_header",
];
const SERVICE_KEYS: [&str; 5] = [
    "http_addr",
    "redis_url",
    "store_timeout_ms",
    "key_prefix",
    "sweep_interval_seconds",
];
const LIST_KEYS: [&str; 4] = [
    "protected_prefixes",
    "login_paths",
    "health_paths",
    "excluded_paths",
];

/// Raw settings as loaded from file and environment.
///
/// Numeric fields are signed so that a negative value reaches validation
/// and is reported as such instead of being coerced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Global kill switch for all limiting.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-scope switch for the login scope.
    #[serde(default = "default_true")]
    pub login_enabled: bool,

    #[serde(default = "default_login_max")]
    pub login_max: i64,

    #[serde(default = "default_login_window_seconds")]
    pub login_window_seconds: i64,

    /// Lockout duration for the login scope.
    #[serde(default = "default_block_seconds")]
    pub block_seconds: i64,

    #[serde(default = "default_true")]
    pub api_enabled: bool,

    #[serde(default = "default_api_max")]
    pub api_max: i64,

    #[serde(default = "default_api_window_seconds")]
    pub api_window_seconds: i64,

    #[serde(default = "default_api_block_seconds")]
    pub api_block_seconds: i64,

    /// Never throttle health-check paths.
    #[serde(default = "default_true")]
    pub exclude_healthcheck: bool,

    /// Path prefixes subject to limiting. Everything else bypasses it.
    #[serde(default = "default_protected_prefixes")]
    pub protected_prefixes: Vec<String>,

    /// Paths that belong to the login scope.
    #[serde(default = "default_login_paths")]
    pub login_paths: Vec<String>,

    #[serde(default = "default_health_paths")]
    pub health_paths: Vec<String>,

    /// Additional paths exempt from limiting in every scope.
    #[serde(default)]
    pub excluded_paths: Vec<String>,

    /// Header carrying the proxy chain, first entry is the client.
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,

    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Shared counter backend. Unset selects the in-process store.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: i64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            login_enabled: true,
            login_max: default_login_max(),
            login_window_seconds: default_login_window_seconds(),
            block_seconds: default_block_seconds(),
            api_enabled: true,
            api_max: default_api_max(),
            api_window_seconds: default_api_window_seconds(),
            api_block_seconds: default_api_block_seconds(),
            exclude_healthcheck: true,
            protected_prefixes: default_protected_prefixes(),
            login_paths: default_login_paths(),
            health_paths: default_health_paths(),
            excluded_paths: Vec::new(),
            forwarded_header: default_forwarded_header(),
            http_addr: default_http_addr(),
            redis_url: None,
            store_timeout_ms: default_store_timeout_ms(),
            key_prefix: default_key_prefix(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_login_max() -> i64 {
    5
}

fn default_login_window_seconds() -> i64 {
    900
}

fn default_block_seconds() -> i64 {
    600
}

fn default_api_max() -> i64 {
    100
}

fn default_api_window_seconds() -> i64 {
    60
}

fn default_api_block_seconds() -> i64 {
    60
}

fn default_protected_prefixes() -> Vec<String> {
    vec!["/api".to_string()]
}

fn default_login_paths() -> Vec<String> {
    vec!["/api/auth/login".to_string(), "/api/login".to_string()]
}

fn default_health_paths() -> Vec<String> {
    vec!["/api/health".to_string()]
}

fn default_forwarded_header() -> String {
    "x-forwarded-for".to_string()
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_store_timeout_ms() -> i64 {
    250
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

fn default_sweep_interval_seconds() -> i64 {
    60
}

impl Settings {
    /// Load settings from an optional YAML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, None)
    }

    /// Load settings with an explicit environment map instead of the
    /// process environment. `None` reads the real environment.
    pub fn load_from(path: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let env = env.unwrap_or_else(|| std::env::vars().collect());
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading settings file");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let settings: Settings = builder
            .add_source(env_source(POLICY_ENV_PREFIX, &POLICY_KEYS, &env))
            .add_source(env_source(SERVICE_ENV_PREFIX, &SERVICE_KEYS, &env))
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }

    /// Resolve and validate the service-level settings.
    pub fn service(&self) -> Result<ServiceConfig> {
        let http_addr: SocketAddr = self.http_addr.parse().map_err(|e| {
            TurnstileError::Config(format!("http_addr '{}' is not a socket address: {}", self.http_addr, e))
        })?;

        let redis_url = self
            .redis_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);

        if self.key_prefix.trim().is_empty() {
            return Err(TurnstileError::Config("key_prefix must not be empty".to_string()));
        }

        Ok(ServiceConfig {
            http_addr,
            store: StoreConfig {
                redis_url,
                timeout: Duration::from_millis(positive("store_timeout_ms", self.store_timeout_ms)?),
                key_prefix: self.key_prefix.trim().to_string(),
                sweep_interval: Duration::from_secs(positive(
                    "sweep_interval_seconds",
                    self.sweep_interval_seconds,
                )?),
            },
        })
    }
}

/// An environment source that only sees `prefix` variables naming one of
/// `keys`, so neither prefix can set the other's settings.
fn env_source(prefix: &str, keys: &[&str], vars: &config::Map<String, String>) -> Environment {
    let owned: config::Map<String, String> = vars
        .iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            name.strip_prefix(&prefix.to_ascii_lowercase())
                .and_then(|rest| rest.strip_prefix('_'))
                .is_some_and(|key| keys.contains(&key))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let mut env = Environment::with_prefix(prefix)
        .prefix_separator("_")
        .try_parsing(true)
        .list_separator(",");
    for key in LIST_KEYS {
        env = env.with_list_parse_key(key);
    }
    env.source(Some(owned))
}

/// Reject zero and negative values for a named setting.
pub(crate) fn positive(name: &str, value: i64) -> Result<u64> {
    if value <= 0 {
        return Err(TurnstileError::Config(format!(
            "{} must be strictly positive, got {}",
            name, value
        )));
    }
    Ok(value as u64)
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP server address
    pub http_addr: SocketAddr,
    /// Counter store selection and tuning
    pub store: StoreConfig,
}

/// Counter store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
    /// Upper bound on any single backend call.
    pub timeout: Duration,
    pub key_prefix: String,
    /// How often the local store drops expired records.
    pub sweep_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_without_environment() {
        let settings = Settings::load_from(None, env(&[])).unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.login_max, 5);
        assert_eq!(settings.login_window_seconds, 900);
        assert_eq!(settings.block_seconds, 600);
        assert!(settings.exclude_healthcheck);
        assert_eq!(settings.protected_prefixes, vec!["/api".to_string()]);
        assert!(settings.redis_url.is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let settings = Settings::load_from(
            None,
            env(&[
                ("RATE_LIMIT_ENABLED", "false"),
                ("RATE_LIMIT_LOGIN_MAX", "3"),
                ("RATE_LIMIT_LOGIN_WINDOW_SECONDS", "60"),
                ("RATE_LIMIT_BLOCK_SECONDS", "120"),
                ("RATE_LIMIT_EXCLUDE_HEALTHCHECK", "false"),
                ("RATE_LIMIT_PROTECTED_PREFIXES", "/api,/auth"),
                ("TURNSTILE_REDIS_URL", "redis://127.0.0.1:6379"),
                ("TURNSTILE_STORE_TIMEOUT_MS", "100"),
            ]),
        )
        .unwrap();

        assert!(!settings.enabled);
        assert_eq!(settings.login_max, 3);
        assert_eq!(settings.login_window_seconds, 60);
        assert_eq!(settings.block_seconds, 120);
        assert!(!settings.exclude_healthcheck);
        assert_eq!(
            settings.protected_prefixes,
            vec!["/api".to_string(), "/auth".to_string()]
        );
        assert_eq!(settings.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(settings.store_timeout_ms, 100);
    }

    #[test]
    fn test_each_prefix_only_sets_its_own_keys() {
        let settings = Settings::load_from(
            None,
            env(&[
                ("TURNSTILE_ENABLED", "false"),
                ("TURNSTILE_LOGIN_MAX", "1"),
                ("RATE_LIMIT_REDIS_URL", "redis://10.0.0.1:6379"),
                ("RATE_LIMIT_HTTP_ADDR", "0.0.0.0:9999"),
                ("TURNSTILE_KEY_PREFIX", "edge"),
                ("rate_limit_api_max", "7"),
            ]),
        )
        .unwrap();

        assert!(settings.enabled);
        assert_eq!(settings.login_max, 5);
        assert!(settings.redis_url.is_none());
        assert_eq!(settings.http_addr, "127.0.0.1:8080");
        assert_eq!(settings.key_prefix, "edge");
        assert_eq!(settings.api_max, 7);
    }

    #[test]
    fn test_unparseable_number_is_config_error() {
        let result = Settings::load_from(None, env(&[("RATE_LIMIT_LOGIN_MAX", "many")]));
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_service_config_resolution() {
        let service = Settings::default().service().unwrap();
        assert_eq!(service.http_addr, "127.0.0.1:8080".parse().unwrap());
        assert!(service.store.redis_url.is_none());
        assert_eq!(service.store.timeout, Duration::from_millis(250));
        assert_eq!(service.store.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_blank_redis_url_selects_local_store() {
        let settings = Settings {
            redis_url: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(settings.service().unwrap().store.redis_url.is_none());
    }

    #[test]
    fn test_invalid_service_settings_rejected() {
        let settings = Settings {
            store_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(settings.service(), Err(TurnstileError::Config(_))));

        let settings = Settings {
            http_addr: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(matches!(settings.service(), Err(TurnstileError::Config(_))));
    }
}
