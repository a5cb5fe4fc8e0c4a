//! Path classification into rate limit scopes.

use crate::ratelimit::{RateLimitPolicy, RateLimitScope};

/// Maps request paths to the scope that governs them.
#[derive(Debug, Clone)]
pub struct RouteClassifier {
    protected_prefixes: Vec<String>,
    login_paths: Vec<String>,
    health_paths: Vec<String>,
    exclude_health: bool,
    login_excluded: Vec<String>,
    api_excluded: Vec<String>,
}

impl RouteClassifier {
    pub fn from_policy(policy: &RateLimitPolicy) -> Self {
        let excluded = |scope| {
            policy
                .get_config(scope)
                .excluded_paths
                .iter()
                .cloned()
                .collect::<Vec<_>>()
        };

        Self {
            protected_prefixes: policy.protected_prefixes().to_vec(),
            login_paths: policy.login_paths().to_vec(),
            health_paths: policy.health_paths().to_vec(),
            exclude_health: policy.should_exclude_health_check(),
            login_excluded: excluded(RateLimitScope::Login),
            api_excluded: excluded(RateLimitScope::DefaultApi),
        }
    }

    /// Whether requests to `path` are limited at all.
    pub fn is_protected(&self, path: &str) -> bool {
        self.classify(path).is_some()
    }

    /// The scope for `path`, or `None` when the request bypasses limiting.
    pub fn classify(&self, path: &str) -> Option<RateLimitScope> {
        if !self
            .protected_prefixes
            .iter()
            .any(|prefix| matches_prefix(path, prefix))
        {
            return None;
        }

        let path = normalize(path);
        if self.exclude_health && self.health_paths.iter().any(|p| p == path) {
            return None;
        }

        let (scope, excluded) = if self.login_paths.iter().any(|p| p == path) {
            (RateLimitScope::Login, &self.login_excluded)
        } else {
            (RateLimitScope::DefaultApi, &self.api_excluded)
        };

        if excluded.iter().any(|p| p == path) {
            return None;
        }
        Some(scope)
    }
}

/// Drop a trailing slash so `/api/login/` and `/api/login` agree.
fn normalize(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

/// Segment-aware prefix test: `/api` covers `/api` and `/api/x`, not `/apix`.
fn matches_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
