//! Per-request rate limiting keyed by egress IP and destination resource
//!
//! Clients opt in per request through the `X-Rate-Limit` header. Limiters
//! live in a shared [`RateLimiterStore`] and expire after a sliding TTL.

mod directive;
mod limiter;
mod store;

pub use directive::{
    resource_key, LimitMethod, RateLimitDirective, Resource, ResourceKind, DEFAULT_TTL,
};
pub use limiter::{create_limiter, FixedWindow, Limiter, TokenBucket};
pub use store::{LimiterKey, RateLimiterStore};
