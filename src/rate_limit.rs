use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use rearch::CapsuleHandle;
use tracing::{debug, instrument, trace};

use crate::config::settings_capsule;

pub const DEFAULT_MAX_REQUESTS: usize = 100;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

pub fn rate_limiter_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn RateLimiter> {
    let settings = get.as_ref(settings_capsule);
    Arc::new(SlidingWindowRateLimiter::new(
        settings.rate_limit_requests,
        settings.rate_limit_window,
    ))
}

/// Per-client admission control.
pub trait RateLimiter: Send + Sync {
    /// Returns `true` and records the request if `client_id` is under its cap.
    /// Rejected requests are not recorded.
    fn is_allowed(&self, client_id: &str) -> bool;

    /// Forgets clients with no requests left inside the window.
    fn prune(&self);

    fn window(&self) -> Duration;
}

/// Sliding-window log limiter keyed by client.
///
/// A check evicts, counts, and records under one write lock, so concurrent checks
/// for the same client can't lose or double count.
pub struct SlidingWindowRateLimiter {
    clients: RwLock<HashMap<String, VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl SlidingWindowRateLimiter {
    #[must_use]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    fn evict_stale(history: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while history
            .front()
            .is_some_and(|&admitted| now.saturating_duration_since(admitted) >= window)
        {
            history.pop_front();
        }
    }

    fn is_allowed_at(&self, client_id: &str, now: Instant) -> bool {
        let mut clients = self.clients.write();

        let history = clients.entry(client_id.to_owned()).or_default();
        Self::evict_stale(history, now, self.window);

        if history.len() < self.max_requests {
            history.push_back(now);
            trace!(client_id, recent = history.len(), "Request admitted");
            true
        } else {
            debug!(client_id, recent = history.len(), "Request rejected");
            false
        }
    }

    fn prune_at(&self, now: Instant) -> usize {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|_, history| {
            Self::evict_stale(history, now, self.window);
            !history.is_empty()
        });
        before - clients.len()
    }

    fn tracked_clients(&self) -> usize {
        self.clients.read().len()
    }
}

impl Default for SlidingWindowRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}

impl RateLimiter for SlidingWindowRateLimiter {
    fn is_allowed(&self, client_id: &str) -> bool {
        self.is_allowed_at(client_id, Instant::now())
    }

    #[instrument(skip(self))]
    fn prune(&self) {
        let removed = self.prune_at(Instant::now());
        if removed > 0 {
            debug!(removed, remaining = self.tracked_clients(), "Pruned idle clients");
        }
    }

    fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_rejects_request_over_cap() {
        let limiter = SlidingWindowRateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();

        for i in 0..3 {
            assert!(limiter.is_allowed_at("1.2.3.4", start + Duration::from_secs(i)));
        }
        assert!(!limiter.is_allowed_at("1.2.3.4", start + Duration::from_secs(10)));
    }

    #[test]
    fn test_admits_again_after_window() {
        let limiter = SlidingWindowRateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.is_allowed_at("client", start));
        assert!(limiter.is_allowed_at("client", start));
        assert!(!limiter.is_allowed_at("client", start + Duration::from_secs(59)));
        assert!(limiter.is_allowed_at("client", start + Duration::from_secs(60)));
    }

    #[test]
    fn test_window_slides_per_request() {
        let limiter = SlidingWindowRateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.is_allowed_at("client", start));
        assert!(limiter.is_allowed_at("client", start + Duration::from_secs(30)));
        // Only the first request has aged out here
        assert!(limiter.is_allowed_at("client", start + Duration::from_secs(60)));
        assert!(!limiter.is_allowed_at("client", start + Duration::from_secs(61)));
        assert!(limiter.is_allowed_at("client", start + Duration::from_secs(90)));
    }

    #[test]
    fn test_rejections_are_not_recorded() {
        let limiter = SlidingWindowRateLimiter::new(1, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.is_allowed_at("client", start));
        for i in 1..50 {
            assert!(!limiter.is_allowed_at("client", start + Duration::from_secs(i)));
        }
        assert!(limiter.is_allowed_at("client", start + Duration::from_secs(60)));
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = SlidingWindowRateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.is_allowed_at("a", now));
        assert!(!limiter.is_allowed_at("a", now));
        assert!(limiter.is_allowed_at("b", now));
    }

    #[test]
    fn test_zero_cap_rejects_everything() {
        let limiter = SlidingWindowRateLimiter::new(0, Duration::from_secs(60));
        assert!(!limiter.is_allowed("client"));
    }

    #[test]
    fn test_prune_drops_idle_clients() {
        let limiter = SlidingWindowRateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.is_allowed_at("old", start));
        assert!(limiter.is_allowed_at("fresh", start + Duration::from_secs(50)));
        assert_eq!(limiter.tracked_clients(), 2);

        assert_eq!(limiter.prune_at(start + Duration::from_secs(70)), 1);
        assert_eq!(limiter.tracked_clients(), 1);
        assert_eq!(limiter.prune_at(start + Duration::from_secs(200)), 1);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_cap() {
        let limiter = Arc::new(SlidingWindowRateLimiter::new(100, Duration::from_secs(3600)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || (0..50).filter(|_| limiter.is_allowed("shared")).count())
            })
            .collect();

        let admitted: usize = handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_default())
            .sum();
        assert_eq!(admitted, 100);
    }

    #[test]
    fn test_concurrent_clients_each_get_their_cap() {
        let limiter = Arc::new(SlidingWindowRateLimiter::new(10, Duration::from_secs(3600)));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || {
                    let client = format!("10.0.0.{}", i % 4);
                    (0..20).filter(|_| limiter.is_allowed(&client)).count()
                })
            })
            .collect();

        let admitted: usize = handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_default())
            .sum();
        assert_eq!(admitted, 4 * 10);
        assert_eq!(limiter.tracked_clients(), 4);
    }
}
