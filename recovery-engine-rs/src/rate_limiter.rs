//! # Rate Limiting
//!
//! Bounds how many errors are accepted for processing per rolling minute so
//! an error storm cannot flood the log or the UI.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

/// Length of the rolling window
pub const WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window limiter over admitted error timestamps
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum admissions within [`WINDOW`]
    limit: usize,
    /// Admission instants, oldest first
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter admitting `limit_per_minute` errors per rolling minute.
    /// A limit of 0 rejects everything.
    pub fn new(limit_per_minute: usize) -> Self {
        Self {
            limit: limit_per_minute,
            admitted: Mutex::new(VecDeque::with_capacity(limit_per_minute.min(1024))),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Admits one error now
    pub fn admit(&self) -> bool {
        self.admit_at(Instant::now())
    }

    /// Admits one error at `now`. Expiry and insertion happen under one lock,
    /// so concurrent callers never exceed the limit.
    pub fn admit_at(&self, now: Instant) -> bool {
        if self.limit == 0 {
            return false;
        }

        let mut admitted = self.admitted.lock().unwrap_or_else(PoisonError::into_inner);
        Self::expire(&mut admitted, now);

        if admitted.len() >= self.limit {
            debug!(
                limit = self.limit,
                in_window = admitted.len(),
                "Error rejected by rate limiter"
            );
            return false;
        }

        admitted.push_back(now);
        true
    }

    /// Number of admissions inside the trailing window
    pub fn in_window(&self) -> usize {
        let mut admitted = self.admitted.lock().unwrap_or_else(PoisonError::into_inner);
        Self::expire(&mut admitted, Instant::now());
        admitted.len()
    }

    fn expire(admitted: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = admitted.front() {
            if now.saturating_duration_since(*oldest) >= WINDOW {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_admits_up_to_limit() {
        let limiter = RateLimiter::new(3);
        let now = Instant::now();

        let admitted = (0..5).filter(|_| limiter.admit_at(now)).count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_window_rolls_forward() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();

        assert!(limiter.admit_at(start));
        assert!(limiter.admit_at(start + Duration::from_secs(30)));
        assert!(!limiter.admit_at(start + Duration::from_secs(59)));

        // The first admission has left the window
        assert!(limiter.admit_at(start + Duration::from_secs(60)));
        assert!(!limiter.admit_at(start + Duration::from_secs(61)));
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let limiter = RateLimiter::new(0);
        assert!(!limiter.admit());
        assert!(!limiter.admit());
        assert_eq!(limiter.in_window(), 0);
    }

    #[test]
    fn test_concurrent_admissions_respect_limit() {
        let limiter = Arc::new(RateLimiter::new(25));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.admit())
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|admitted| *admitted)
            .count();

        assert_eq!(admitted, 25);
        assert_eq!(limiter.in_window(), 25);
    }
}
