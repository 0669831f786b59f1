//! Rate limiting algorithms
//!
//! Both limiters refill lazily on access and guard their state with a mutex,
//! so one instance can be shared by every request using the same egress IP.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use super::directive::{LimitMethod, RateLimitDirective};

/// Allow/deny gate shared by all algorithms
pub trait Limiter: Send + Sync {
    /// Consume one unit of capacity; `false` means the request must be denied
    fn allow(&self) -> bool;
}

/// Create the limiter named by a directive
pub fn create_limiter(directive: &RateLimitDirective) -> Arc<dyn Limiter> {
    match directive.method {
        LimitMethod::TokenBucket => Arc::new(TokenBucket::new(directive.rate, directive.period())),
        LimitMethod::FixedWindow => Arc::new(FixedWindow::new(directive.rate, directive.period())),
        LimitMethod::Unknown => {
            warn!("Unknown rate limit method, using token_bucket");
            Arc::new(TokenBucket::new(directive.rate, directive.period()))
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuous-refill token bucket
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    max_tokens: f64,
    /// Tokens added per second
    refill_rate: f64,
}

impl TokenBucket {
    /// A full bucket holding `rate` tokens, refilled over `period`
    pub fn new(rate: u32, period: Duration) -> Self {
        Self::new_at(rate, period, Instant::now())
    }

    fn new_at(rate: u32, period: Duration, now: Instant) -> Self {
        let max_tokens = f64::from(rate);
        Self {
            state: Mutex::new(BucketState {
                tokens: max_tokens,
                last_refill: now,
            }),
            max_tokens,
            refill_rate: max_tokens / period.as_secs_f64(),
        }
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.max_tokens);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Limiter for TokenBucket {
    fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }
}

#[derive(Debug)]
struct WindowState {
    count: u32,
    window_start: Instant,
}

/// Fixed-window counter
///
/// Up to twice the rate can pass across a window boundary.
#[derive(Debug)]
pub struct FixedWindow {
    state: Mutex<WindowState>,
    max_requests: u32,
    window_period: Duration,
}

impl FixedWindow {
    pub fn new(rate: u32, period: Duration) -> Self {
        Self::new_at(rate, period, Instant::now())
    }

    fn new_at(rate: u32, period: Duration, now: Instant) -> Self {
        Self {
            state: Mutex::new(WindowState {
                count: 0,
                window_start: now,
            }),
            max_requests: rate,
            window_period: period,
        }
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();

        if now.saturating_duration_since(state.window_start) >= self.window_period {
            state.window_start = now;
            state.count = 0;
        }

        if state.count < self.max_requests {
            state.count += 1;
            true
        } else {
            false
        }
    }
}

impl Limiter for FixedWindow {
    fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }
}
