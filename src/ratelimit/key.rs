//! Scope and bucket key handling.

use std::fmt;

/// A policy domain. Each scope carries its own limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    /// Authentication endpoints
    Login,
    /// Every other protected API route
    DefaultApi,
}

impl RateLimitScope {
    /// All scopes, in a stable order.
    pub const ALL: [RateLimitScope; 2] = [RateLimitScope::Login, RateLimitScope::DefaultApi];

    /// Stable name used in store keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Login => "login",
            RateLimitScope::DefaultApi => "default-api",
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that identifies one logical counter bucket.
///
/// The same client gets independent buckets in different scopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    /// The scope this bucket belongs to
    pub scope: RateLimitScope,
    /// The client identifier, usually an address
    pub identifier: String,
}

impl ClientKey {
    pub fn new(scope: RateLimitScope, identifier: impl Into<String>) -> Self {
        Self {
            scope,
            identifier: identifier.into(),
        }
    }

    /// Convert the key to its storage form, `{prefix}:{scope}:{identifier}`.
    ///
    /// The identifier goes last so that IPv6 addresses, which contain `:`,
    /// cannot collide with the scope segment.
    pub fn to_storage_key(&self, prefix: &str) -> String {
        format!("{}:{}:{}", prefix, self.scope, self.identifier)
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.identifier)
    }
}
