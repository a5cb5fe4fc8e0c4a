//! Per-request admission control.
//!
//! [`Gatekeeper`] holds the framework-agnostic flow: classify the path,
//! honour the global switch, resolve the client, and ask the limiter.
//! [`rate_limit_middleware`] adapts it to axum and turns the admission into
//! a pass-through or a 429.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, Method};
use axum::middleware::Next;
use axum::response::Response;
use futures::FutureExt;
use tracing::{error, instrument, trace};
use uuid::Uuid;

use super::identity::ClientIdentity;
use super::outcome::{Outcome, OutcomeRecord, OutcomeSink, TracingSink};
use super::response;
use super::routes::RouteClassifier;
use crate::error::Result;
use crate::ratelimit::{ClientKey, RateLimitDecision, RateLimiter};

const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// The request metadata the gate looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

/// What to do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Not limited; continue without headers.
    Bypass,
    /// Counted and within limits; continue with headers.
    Allow(RateLimitDecision),
    /// The limiter failed and let the request through; continue without
    /// headers, since no real count backs them.
    FailOpen,
    /// Over the limit or locked out.
    Reject(RateLimitDecision),
}

impl Admission {
    pub fn outcome(&self) -> Outcome {
        match self {
            Admission::Bypass => Outcome::Bypassed,
            Admission::Allow(_) => Outcome::Allowed,
            Admission::FailOpen => Outcome::FailOpen,
            Admission::Reject(_) => Outcome::Rejected,
        }
    }
}

/// Wires classification, identity and limiting together for each request.
pub struct Gatekeeper {
    classifier: RouteClassifier,
    identity: ClientIdentity,
    limiter: Arc<RateLimiter>,
    sink: Arc<dyn OutcomeSink>,
}

impl Gatekeeper {
    /// Build a gate around `limiter`, taking routes and identity settings
    /// from its policy. Outcomes go to [`TracingSink`].
    pub fn new(limiter: Arc<RateLimiter>) -> Result<Self> {
        let policy = limiter.policy();
        let classifier = RouteClassifier::from_policy(policy);
        let identity = ClientIdentity::new(policy.forwarded_header())?;

        Ok(Self {
            classifier,
            identity,
            limiter,
            sink: Arc::new(TracingSink),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Decide whether a request may proceed.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn admit(&self, request: &RequestMeta<'_>) -> Admission {
        let Some(scope) = self.classifier.classify(request.path) else {
            trace!("Path not limited");
            return Admission::Bypass;
        };

        if !self.limiter.policy().is_enabled() {
            trace!("Rate limiting globally disabled");
            return Admission::Bypass;
        }

        let client = self.identity.resolve(request.headers, request.remote_addr);
        let key = ClientKey::new(scope, client.identifier);
        let check = self.limiter.check(&key, scope).await;

        if check.failed_open {
            Admission::FailOpen
        } else if check.decision.allowed {
            Admission::Allow(check.decision)
        } else {
            Admission::Reject(check.decision)
        }
    }

    fn record(&self, record: OutcomeRecord) {
        self.sink.record(&record);
    }
}

/// axum middleware for `axum::middleware::from_fn_with_state`.
///
/// A panic anywhere in the decision fails open. The downstream handler is
/// outside that guard.
pub async fn rate_limit_middleware(
    State(gate): State<Arc<Gatekeeper>>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let request_id = request_id(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let admission = {
        let meta = RequestMeta {
            method: &method,
            path: &path,
            headers: request.headers(),
            remote_addr,
        };
        match AssertUnwindSafe(gate.admit(&meta)).catch_unwind().await {
            Ok(admission) => admission,
            Err(panic) => {
                error!(
                    request_id = %request_id,
                    path = %path,
                    panic = panic_message(panic.as_ref()),
                    "Rate limit check panicked, failing open"
                );
                Admission::FailOpen
            }
        }
    };

    let outcome = admission.outcome();
    let response = match admission {
        Admission::Reject(decision) => response::build_429(&decision),
        Admission::Allow(decision) => {
            let mut response = next.run(request).await;
            response::apply_headers(&decision, response.headers_mut());
            response
        }
        Admission::Bypass | Admission::FailOpen => next.run(request).await,
    };

    gate.record(OutcomeRecord {
        request_id,
        method: method.to_string(),
        path,
        duration_ms: started.elapsed().as_millis() as u64,
        outcome,
    });

    response
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
