//! Client identity extraction.

use std::net::SocketAddr;

use axum::http::{HeaderMap, HeaderName};
use tracing::debug;

use crate::error::TurnstileError;

/// Identifier shared by every client that cannot be resolved.
///
/// All such clients share one bucket, so one noisy unresolvable client can
/// exhaust the budget of the others.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Longest forwarded entry accepted as an identifier.
const MAX_IDENTIFIER_LEN: usize = 255;

/// Where an identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// First entry of the proxy-chain header
    Forwarded,
    /// Address of the direct peer
    Peer,
    /// Nothing usable; the shared sentinel
    Unknown,
}

/// A resolved client identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub identifier: String,
    pub source: IdentitySource,
}

/// Derives a stable per-request identifier from request metadata.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    forwarded_header: HeaderName,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            forwarded_header: HeaderName::from_static("x-forwarded-for"),
        }
    }
}

impl ClientIdentity {
    /// Read the proxy chain from `forwarded_header`.
    pub fn new(forwarded_header: &str) -> crate::error::Result<Self> {
        let forwarded_header = HeaderName::from_bytes(forwarded_header.as_bytes()).map_err(|e| {
            TurnstileError::Config(format!("invalid forwarded header '{}': {}", forwarded_header, e))
        })?;
        Ok(Self { forwarded_header })
    }

    /// Resolve the identifier: forwarded chain, then peer, then the sentinel.
    pub fn resolve(&self, headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> ResolvedIdentity {
        match self.forwarded(headers) {
            Ok(Some(identifier)) => {
                return ResolvedIdentity {
                    identifier,
                    source: IdentitySource::Forwarded,
                }
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Ignoring forwarded header"),
        }

        if let Some(addr) = remote_addr {
            return ResolvedIdentity {
                identifier: addr.ip().to_string(),
                source: IdentitySource::Peer,
            };
        }

        debug!(
            error = %TurnstileError::InvalidIdentifier("no forwarded header and no peer address".to_string()),
            "Falling back to shared client bucket"
        );
        ResolvedIdentity {
            identifier: UNKNOWN_CLIENT.to_string(),
            source: IdentitySource::Unknown,
        }
    }

    /// First entry of the forwarded chain, if the header is present.
    fn forwarded(&self, headers: &HeaderMap) -> Result<Option<String>, TurnstileError> {
        let Some(value) = headers.get(&self.forwarded_header) else {
            return Ok(None);
        };

        let value = value.to_str().map_err(|_| {
            TurnstileError::InvalidIdentifier(format!("{} is not visible ASCII", self.forwarded_header))
        })?;

        let first = value.split(',').next().unwrap_or_default().trim();
        if first.is_empty() {
            return Err(TurnstileError::InvalidIdentifier(format!(
                "{} has an empty first entry",
                self.forwarded_header
            )));
        }
        if first.len() > MAX_IDENTIFIER_LEN {
            return Err(TurnstileError::InvalidIdentifier(format!(
                "{} first entry is {} bytes long",
                self.forwarded_header,
                first.len()
            )));
        }

        Ok(Some(first.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.10:54321".parse().unwrap())
    }

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_first_forwarded_entry_wins() {
        let identity = ClientIdentity::default();
        let resolved = identity.resolve(
            &headers("x-forwarded-for", " 203.0.113.7 , 10.0.0.1, 10.0.0.2"),
            peer(),
        );
        assert_eq!(resolved.identifier, "203.0.113.7");
        assert_eq!(resolved.source, IdentitySource::Forwarded);
    }

    #[test]
    fn test_falls_back_to_peer() {
        let resolved = ClientIdentity::default().resolve(&HeaderMap::new(), peer());
        assert_eq!(resolved.identifier, "192.0.2.10");
        assert_eq!(resolved.source, IdentitySource::Peer);
    }

    #[test]
    fn test_malformed_forwarded_falls_back_to_peer() {
        let resolved = ClientIdentity::default().resolve(&headers("x-forwarded-for", " ,10.0.0.1"), peer());
        assert_eq!(resolved.source, IdentitySource::Peer);

        let long = "a".repeat(300);
        let resolved = ClientIdentity::default().resolve(&headers("x-forwarded-for", &long), peer());
        assert_eq!(resolved.source, IdentitySource::Peer);

        let mut non_ascii = HeaderMap::new();
        non_ascii.insert("x-forwarded-for", HeaderValue::from_bytes(b"\xfe\xff").unwrap());
        let resolved = ClientIdentity::default().resolve(&non_ascii, peer());
        assert_eq!(resolved.source, IdentitySource::Peer);
    }

    #[test]
    fn test_unknown_sentinel() {
        let resolved = ClientIdentity::default().resolve(&HeaderMap::new(), None);
        assert_eq!(resolved.identifier, UNKNOWN_CLIENT);
        assert_eq!(resolved.source, IdentitySource::Unknown);
    }

    #[test]
    fn test_custom_header() {
        let identity = ClientIdentity::new("X-Real-IP").unwrap();
        let resolved = identity.resolve(&headers("x-real-ip", "198.51.100.4"), peer());
        assert_eq!(resolved.identifier, "198.51.100.4");

        // The default header is ignored once another is configured.
        let resolved = identity.resolve(&headers("x-forwarded-for", "198.51.100.4"), peer());
        assert_eq!(resolved.source, IdentitySource::Peer);
    }

    #[test]
    fn test_invalid_header_name() {
        assert!(matches!(
            ClientIdentity::new("bad header"),
            Err(TurnstileError::Config(_))
        ));
    }
}
