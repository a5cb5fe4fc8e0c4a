//! Rate limiting logic and state management.

mod clock;
mod counter;
mod decision;
mod key;
mod limiter;
mod policy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterRecord, CounterState};
pub use decision::RateLimitDecision;
pub use key::{ClientKey, RateLimitScope};
pub use limiter::{LimitCheck, RateLimiter};
pub use policy::{RateLimitConfig, RateLimitPolicy};
