//! Per-request outcome records.

use serde::Serialize;
use tracing::info;

/// What the gate did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Not subject to limiting
    Bypassed,
    Allowed,
    Rejected,
    /// Let through because the limiter could not decide
    FailOpen,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Bypassed => "bypassed",
            Outcome::Allowed => "allowed",
            Outcome::Rejected => "rejected",
            Outcome::FailOpen => "fail_open",
        }
    }
}

/// One structured record per gated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeRecord {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub duration_ms: u64,
    pub outcome: Outcome,
}

/// Receives outcome records. Storage and transport belong to the implementor.
pub trait OutcomeSink: Send + Sync {
    fn record(&self, record: &OutcomeRecord);
}

/// Emits each record as an `info` event on the `turnstile::outcome` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutcomeSink for TracingSink {
    fn record(&self, record: &OutcomeRecord) {
        info!(
            target: "turnstile::outcome",
            request_id = %record.request_id,
            method = %record.method,
            path = %record.path,
            duration_ms = record.duration_ms,
            outcome = record.outcome.as_str(),
            "Request gated"
        );
    }
}
