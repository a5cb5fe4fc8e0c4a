//! Rate limit policy resolution.
//!
//! The policy is built once from [`Settings`] at startup and never changes
//! while serving. Anything ambiguous (a zero window, a negative limit, a
//! path that is not absolute) is rejected here so the process refuses to
//! start rather than guess.

use std::collections::HashSet;

use tracing::info;

use super::key::RateLimitScope;
use crate::config::{positive, Settings};
use crate::error::{Result, TurnstileError};

/// Limits for a single scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Whether this scope enforces anything
    pub enabled: bool,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Lockout length in seconds
    pub block_seconds: u64,
    /// Paths exempt from this scope
    pub excluded_paths: HashSet<String>,
}

impl RateLimitConfig {
    /// Build a validated scope configuration.
    pub fn new(
        enabled: bool,
        max_requests: u64,
        window_seconds: u64,
        block_seconds: u64,
    ) -> Result<Self> {
        if max_requests == 0 || window_seconds == 0 || block_seconds == 0 {
            return Err(TurnstileError::Config(format!(
                "limits must be strictly positive (max_requests={}, window_seconds={}, block_seconds={})",
                max_requests, window_seconds, block_seconds
            )));
        }
        // Timestamps are i64 milliseconds.
        let ceiling = (i64::MAX / 1000) as u64;
        if window_seconds > ceiling || block_seconds > ceiling {
            return Err(TurnstileError::Config(
                "window_seconds and block_seconds must fit in epoch milliseconds".to_string(),
            ));
        }

        Ok(Self {
            enabled,
            max_requests,
            window_seconds,
            block_seconds,
            excluded_paths: HashSet::new(),
        })
    }

    pub fn with_excluded_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn window_ms(&self) -> i64 {
        self.window_seconds as i64 * 1000
    }

    pub fn block_ms(&self) -> i64 {
        self.block_seconds as i64 * 1000
    }

    /// Store TTL for records of this scope.
    pub fn ttl_seconds(&self) -> u64 {
        self.window_seconds.max(self.block_seconds)
    }
}

/// The resolved, immutable policy for every scope.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    enabled: bool,
    exclude_healthcheck: bool,
    login: RateLimitConfig,
    default_api: RateLimitConfig,
    protected_prefixes: Vec<String>,
    login_paths: Vec<String>,
    health_paths: Vec<String>,
    forwarded_header: String,
}

impl RateLimitPolicy {
    /// Resolve the policy from raw settings, failing on any invalid value.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let excluded = validate_paths("excluded_paths", &settings.excluded_paths)?;

        let login = RateLimitConfig::new(
            settings.login_enabled,
            positive("login_max", settings.login_max)?,
            positive("login_window_seconds", settings.login_window_seconds)?,
            positive("block_seconds", settings.block_seconds)?,
        )?
        .with_excluded_paths(excluded.iter().cloned());

        let default_api = RateLimitConfig::new(
            settings.api_enabled,
            positive("api_max", settings.api_max)?,
            positive("api_window_seconds", settings.api_window_seconds)?,
            positive("api_block_seconds", settings.api_block_seconds)?,
        )?
        .with_excluded_paths(excluded);

        let protected_prefixes = validate_paths("protected_prefixes", &settings.protected_prefixes)?;
        if protected_prefixes.is_empty() {
            return Err(TurnstileError::Config(
                "protected_prefixes must name at least one prefix".to_string(),
            ));
        }

        let forwarded_header = settings.forwarded_header.trim().to_ascii_lowercase();
        if axum::http::HeaderName::from_bytes(forwarded_header.as_bytes()).is_err() {
            return Err(TurnstileError::Config(format!(
                "forwarded_header '{}' is not a valid header name",
                settings.forwarded_header
            )));
        }

        let policy = Self {
            enabled: settings.enabled,
            exclude_healthcheck: settings.exclude_healthcheck,
            login,
            default_api,
            protected_prefixes,
            login_paths: validate_paths("login_paths", &settings.login_paths)?,
            health_paths: validate_paths("health_paths", &settings.health_paths)?,
            forwarded_header,
        };

        info!(
            enabled = policy.enabled,
            login_max = policy.login.max_requests,
            login_window_seconds = policy.login.window_seconds,
            login_block_seconds = policy.login.block_seconds,
            api_max = policy.default_api.max_requests,
            api_window_seconds = policy.default_api.window_seconds,
            exclude_healthcheck = policy.exclude_healthcheck,
            "Rate limit policy resolved"
        );

        Ok(policy)
    }

    /// Limits for a scope.
    pub fn get_config(&self, scope: RateLimitScope) -> &RateLimitConfig {
        match scope {
            RateLimitScope::Login => &self.login,
            RateLimitScope::DefaultApi => &self.default_api,
        }
    }

    /// Global kill switch, independent of the per-scope flags.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn should_exclude_health_check(&self) -> bool {
        self.exclude_healthcheck
    }

    pub fn protected_prefixes(&self) -> &[String] {
        &self.protected_prefixes
    }

    pub fn login_paths(&self) -> &[String] {
        &self.login_paths
    }

    pub fn health_paths(&self) -> &[String] {
        &self.health_paths
    }

    /// Lowercased name of the proxy-chain header.
    pub fn forwarded_header(&self) -> &str {
        &self.forwarded_header
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude_healthcheck: true,
            login: RateLimitConfig {
                enabled: true,
                max_requests: 5,
                window_seconds: 900,
                block_seconds: 600,
                excluded_paths: HashSet::new(),
            },
            default_api: RateLimitConfig {
                enabled: true,
                max_requests: 100,
                window_seconds: 60,
                block_seconds: 60,
                excluded_paths: HashSet::new(),
            },
            protected_prefixes: vec!["/api".to_string()],
            login_paths: vec!["/api/auth/login".to_string(), "/api/login".to_string()],
            health_paths: vec!["/api/health".to_string()],
            forwarded_header: "x-forwarded-for".to_string(),
        }
    }
}

/// Trim, drop blanks and trailing slashes, and require absolute paths.
fn validate_paths(name: &str, paths: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(paths.len());
    for raw in paths {
        let path = raw.trim();
        if path.is_empty() {
            continue;
        }
        if !path.starts_with('/') {
            return Err(TurnstileError::Config(format!(
                "{} entry '{}' must start with '/'",
                name, path
            )));
        }
        let path = if path.len() > 1 { path.trim_end_matches('/') } else { path };
        out.push(path.to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_resolve() {
        let policy = RateLimitPolicy::from_settings(&Settings::default()).unwrap();
        assert!(policy.is_enabled());
        assert!(policy.should_exclude_health_check());

        let login = policy.get_config(RateLimitScope::Login);
        assert!(login.enabled);
        assert_eq!(login.max_requests, 5);
        assert_eq!(login.window_seconds, 900);
        assert_eq!(login.block_seconds, 600);
        assert_eq!(login.ttl_seconds(), 900);

        let api = policy.get_config(RateLimitScope::DefaultApi);
        assert_eq!(api.max_requests, 100);
        assert_eq!(api.window_seconds, 60);
    }

    #[test]
    fn test_default_policy_matches_default_settings() {
        let resolved = RateLimitPolicy::from_settings(&Settings::default()).unwrap();
        let default = RateLimitPolicy::default();
        for scope in RateLimitScope::ALL {
            assert_eq!(resolved.get_config(scope), default.get_config(scope));
        }
        assert_eq!(resolved.protected_prefixes(), default.protected_prefixes());
        assert_eq!(resolved.login_paths(), default.login_paths());
        assert_eq!(resolved.health_paths(), default.health_paths());
        assert_eq!(resolved.forwarded_header(), default.forwarded_header());
    }

    #[test]
    fn test_non_positive_values_fail_fast() {
        let cases = [
            Settings { login_max: 0, ..Default::default() },
            Settings { login_window_seconds: -1, ..Default::default() },
            Settings { block_seconds: 0, ..Default::default() },
            Settings { api_max: -5, ..Default::default() },
            Settings { api_block_seconds: 0, ..Default::default() },
        ];

        for settings in cases {
            let result = RateLimitPolicy::from_settings(&settings);
            assert!(matches!(result, Err(TurnstileError::Config(_))), "{:?}", settings);
        }
    }

    #[test]
    fn test_disabled_policy_still_validates() {
        let settings = Settings {
            enabled: false,
            login_max: 0,
            ..Default::default()
        };
        assert!(RateLimitPolicy::from_settings(&settings).is_err());
    }

    #[test]
    fn test_relative_paths_rejected() {
        let settings = Settings {
            protected_prefixes: vec!["api".to_string()],
            ..Default::default()
        };
        assert!(RateLimitPolicy::from_settings(&settings).is_err());

        let settings = Settings {
            protected_prefixes: vec![" ".to_string()],
            ..Default::default()
        };
        assert!(RateLimitPolicy::from_settings(&settings).is_err());
    }

    #[test]
    fn test_paths_are_normalized() {
        let settings = Settings {
            protected_prefixes: vec![" /api/ ".to_string()],
            excluded_paths: vec!["/api/status/".to_string()],
            ..Default::default()
        };
        let policy = RateLimitPolicy::from_settings(&settings).unwrap();
        assert_eq!(policy.protected_prefixes(), ["/api".to_string()]);
        assert!(policy
            .get_config(RateLimitScope::Login)
            .excluded_paths
            .contains("/api/status"));
    }

    #[test]
    fn test_invalid_forwarded_header_rejected() {
        let settings = Settings {
            forwarded_header: "x forwarded".to_string(),
            ..Default::default()
        };
        assert!(RateLimitPolicy::from_settings(&settings).is_err());
    }

    #[test]
    fn test_scope_config_validation() {
        assert!(RateLimitConfig::new(true, 0, 1, 1).is_err());
        assert!(RateLimitConfig::new(true, 1, 0, 1).is_err());
        assert!(RateLimitConfig::new(true, 1, 1, 0).is_err());
        assert!(RateLimitConfig::new(true, 1, u64::MAX, 1).is_err());

        let config = RateLimitConfig::new(true, 5, 900, 600).unwrap();
        assert_eq!(config.window_ms(), 900_000);
        assert_eq!(config.block_ms(), 600_000);
    }
}
