//! Multi-window rate limiting.
//!
//! A request flows through [`identifier::resolve`], [`usage::evaluate`] and
//! [`decision::decide`], orchestrated by [`RateLimitingContext`].

pub mod decision;
pub mod host;
pub mod identifier;
mod limiter;
pub mod store;
pub mod usage;
pub mod window;

pub use decision::{Binding, Decision, HeaderSet};
pub use host::{RequestContext, ResponseControl, Scope};
pub use identifier::{Identifier, LimitBy};
pub use limiter::{Action, RateLimiter, RateLimitingContext, RequestState};
pub use store::{
    CasToken, CounterClient, CounterKey, CounterSnapshot, CounterStore, InMemoryCounterStore,
    IncrementOutcome, StoreError, MAX_CAS_ATTEMPTS,
};
pub use usage::{Evaluation, UsageError, UsageSnapshot};
pub use window::{Clock, FixedClock, Period, SystemClock, WindowAnchors};
