//! Rate limiter registry keyed by egress IP and resource
//!
//! Entries are created on first use and evicted by a background sweep once
//! they have been idle for longer than their TTL.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::directive::{LimitMethod, RateLimitDirective};
use super::limiter::{create_limiter, Limiter};

/// Identity of a limiter
///
/// Directives that differ in method, rate or period get independent limiters
/// even for the same egress IP and resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    pub egress: IpAddr,
    pub resource: String,
    pub method: LimitMethod,
    pub rate: u32,
    pub period: u32,
}

impl LimiterKey {
    pub fn new(egress: IpAddr, resource: impl Into<String>, directive: &RateLimitDirective) -> Self {
        Self {
            egress,
            resource: resource.into(),
            method: directive.method,
            rate: directive.rate,
            period: directive.period,
        }
    }
}

struct LimiterEntry {
    limiter: Arc<dyn Limiter>,
    /// Milliseconds since the store's epoch
    last_used_ms: AtomicU64,
    ttl: Duration,
}

/// Process-wide registry of rate limiters
pub struct RateLimiterStore {
    entries: DashMap<LimiterKey, LimiterEntry>,
    epoch: Instant,
    sweep_interval: Duration,
    shutdown: CancellationToken,
}

impl RateLimiterStore {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            epoch: Instant::now(),
            sweep_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Return the limiter for this key, creating it on first use
    ///
    /// Every lookup slides the entry's idle deadline forward.
    pub fn get_or_create(
        &self,
        egress: IpAddr,
        resource: &str,
        directive: &RateLimitDirective,
    ) -> Arc<dyn Limiter> {
        self.get_or_create_at(LimiterKey::new(egress, resource, directive), directive, Instant::now())
    }

    fn get_or_create_at(
        &self,
        key: LimiterKey,
        directive: &RateLimitDirective,
        now: Instant,
    ) -> Arc<dyn Limiter> {
        let now_ms = self.millis_since_epoch(now);

        // Shared shard lock on hit
        if let Some(entry) = self.entries.get(&key) {
            entry.last_used_ms.store(now_ms, Ordering::Relaxed);
            return Arc::clone(&entry.limiter);
        }

        // Exclusive shard lock; a concurrent creator for the same key wins or joins here
        let entry = self.entries.entry(key).or_insert_with(|| {
            debug!(
                method = directive.method.as_str(),
                rate = directive.rate,
                period = directive.period,
                "Creating rate limiter"
            );
            LimiterEntry {
                limiter: create_limiter(directive),
                last_used_ms: AtomicU64::new(now_ms),
                ttl: directive.ttl(),
            }
        });
        entry.last_used_ms.store(now_ms, Ordering::Relaxed);
        Arc::clone(&entry.limiter)
    }

    /// Remove entries idle for longer than their TTL
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let now_ms = self.millis_since_epoch(now);
        let before = self.entries.len();

        self.entries.retain(|_, entry| {
            let idle_ms = now_ms.saturating_sub(entry.last_used_ms.load(Ordering::Relaxed));
            u128::from(idle_ms) <= entry.ttl.as_millis()
        });

        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(
                removed,
                remaining = self.entries.len(),
                "Evicted idle rate limiters"
            );
        }
        removed
    }

    /// Spawn the background sweep; it runs until [`stop`](Self::stop) is called
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move { store.run_sweeper().await })
    }

    #[instrument(skip(self))]
    async fn run_sweeper(&self) {
        info!(
            "Starting rate limiter sweep with {}s interval",
            self.sweep_interval.as_secs()
        );

        let mut tick = tokio::time::interval(self.sweep_interval);
        tick.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.sweep();
                }
                _ = self.shutdown.cancelled() => {
                    info!("Rate limiter sweep shutting down");
                    break;
                }
            }
        }
    }

    /// Stop the background sweep
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Number of live limiters
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }
}

impl Default for RateLimiterStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn directive(json: &str) -> RateLimitDirective {
        RateLimitDirective::parse(json).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_same_key_returns_same_limiter() {
        let store = RateLimiterStore::default();
        let d = directive(r#"{"rate":10,"period":60}"#);

        let a = store.get_or_create(ip("10.0.0.1"), "example.com", &d);
        let b = store.get_or_create(ip("10.0.0.1"), "example.com", &d);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_differing_components_get_distinct_limiters() {
        let store = RateLimiterStore::default();
        let base = directive(r#"{"rate":10,"period":60}"#);
        let a = store.get_or_create(ip("10.0.0.1"), "example.com", &base);

        let others = [
            store.get_or_create(ip("10.0.0.2"), "example.com", &base),
            store.get_or_create(ip("10.0.0.1"), "example.org", &base),
            store.get_or_create(
                ip("10.0.0.1"),
                "example.com",
                &directive(r#"{"method":"fixed_window","rate":10,"period":60}"#),
            ),
            store.get_or_create(
                ip("10.0.0.1"),
                "example.com",
                &directive(r#"{"rate":11,"period":60}"#),
            ),
            store.get_or_create(
                ip("10.0.0.1"),
                "example.com",
                &directive(r#"{"rate":10,"period":30}"#),
            ),
        ];

        for other in &others {
            assert!(!Arc::ptr_eq(&a, other));
        }
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn test_ttl_does_not_split_limiters() {
        let store = RateLimiterStore::default();
        let a = store.get_or_create(
            ip("10.0.0.1"),
            "example.com",
            &directive(r#"{"rate":1,"period":60,"ttl":10}"#),
        );
        let b = store.get_or_create(
            ip("10.0.0.1"),
            "example.com",
            &directive(r#"{"rate":1,"period":60,"ttl":20}"#),
        );
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_sweep_removes_expired_entries() {
        let store = RateLimiterStore::default();
        let d = directive(r#"{"rate":1,"period":1,"ttl":10}"#);
        let start = Instant::now();

        store.get_or_create_at(LimiterKey::new(ip("10.0.0.1"), "a.com", &d), &d, start);
        assert_eq!(store.sweep_at(start + Duration::from_secs(10)), 0);
        assert_eq!(store.len(), 1);

        assert_eq!(store.sweep_at(start + Duration::from_secs(11)), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_access_slides_ttl() {
        let store = RateLimiterStore::default();
        let d = directive(r#"{"rate":1,"period":1,"ttl":10}"#);
        let key = LimiterKey::new(ip("10.0.0.1"), "a.com", &d);
        let start = Instant::now();

        let first = store.get_or_create_at(key.clone(), &d, start);
        let second = store.get_or_create_at(key.clone(), &d, start + Duration::from_secs(8));
        assert!(Arc::ptr_eq(&first, &second));

        // Original deadline has passed, refreshed one has not
        assert_eq!(store.sweep_at(start + Duration::from_secs(11)), 0);
        assert_eq!(store.len(), 1);

        assert_eq!(store.sweep_at(start + Duration::from_secs(19)), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_uses_per_entry_ttl() {
        let store = RateLimiterStore::default();
        let short = directive(r#"{"rate":1,"period":1,"ttl":5}"#);
        let long = directive(r#"{"rate":2,"period":1,"ttl":60}"#);
        let start = Instant::now();

        store.get_or_create_at(LimiterKey::new(ip("10.0.0.1"), "a.com", &short), &short, start);
        store.get_or_create_at(LimiterKey::new(ip("10.0.0.1"), "a.com", &long), &long, start);

        assert_eq!(store.sweep_at(start + Duration::from_secs(30)), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_first_use_creates_one_limiter() {
        let store = Arc::new(RateLimiterStore::default());
        let d = directive(r#"{"rate":1000,"period":60}"#);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                let d = d.clone();
                thread::spawn(move || store.get_or_create(ip("10.0.0.1"), "example.com", &d))
            })
            .collect();

        let limiters: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for limiter in &limiters[1..] {
            assert!(Arc::ptr_eq(&limiters[0], limiter));
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let store = Arc::new(RateLimiterStore::new(Duration::from_millis(10)));
        let handle = store.spawn_sweeper();

        store.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_evicts_in_background() {
        let store = Arc::new(RateLimiterStore::new(Duration::from_millis(20)));
        let d = directive(r#"{"rate":1,"period":1,"ttl":1}"#);
        store.get_or_create(ip("10.0.0.1"), "a.com", &d);
        assert_eq!(store.len(), 1);

        let handle = store.spawn_sweeper();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(store.is_empty());

        store.stop();
        handle.await.unwrap();
    }
}
