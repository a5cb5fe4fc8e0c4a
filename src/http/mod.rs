//! HTTP admission layer.
//!
//! Everything between an inbound request and the limiter: which paths are
//! limited, who the client is, how decisions become headers or a 429, and
//! the axum middleware that ties them together.

pub mod identity;
pub mod middleware;
pub mod outcome;
pub mod response;
pub mod routes;
pub mod server;

pub use identity::{ClientIdentity, IdentitySource, ResolvedIdentity, UNKNOWN_CLIENT};
pub use middleware::{rate_limit_middleware, Admission, Gatekeeper, RequestMeta};
pub use outcome::{Outcome, OutcomeRecord, OutcomeSink, TracingSink};
pub use routes::RouteClassifier;
pub use server::{protect, service_routes, HttpServer};
