//! Per-domain sliding-window request gate.
//!
//! Each domain keeps the timestamps of its recent requests. A request is let
//! through only while fewer than `requests_per_window` of them fall inside the
//! trailing window; otherwise the caller sleeps until the oldest one expires.
//! Throttling responses stretch the window through a backoff multiplier that
//! decays again on sustained success.

use rand::{thread_rng, Rng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::cli::config::RateLimitSettings;

/// Process-wide limiter shared by every running task
pub struct RateLimiter {
    settings: RateLimitSettings,
    domains: Mutex<HashMap<String, Arc<AsyncMutex<DomainWindow>>>>,
}

#[derive(Debug)]
struct DomainWindow {
    /// Issue times of admitted requests, oldest first; may hold reservations slightly in the future
    hits: VecDeque<Instant>,
    backoff: f64,
    success_streak: u32,
}

impl DomainWindow {
    fn new() -> Self {
        Self {
            hits: VecDeque::new(),
            backoff: 1.0,
            success_streak: 0,
        }
    }

    fn prune(&mut self, now: Instant, span: Duration) {
        while let Some(oldest) = self.hits.front() {
            if *oldest + span <= now {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, at: Instant) {
        let index = self.hits.partition_point(|hit| *hit <= at);
        self.hits.insert(index, at);
    }
}

/// Decision made while holding a domain's lock
enum Admission {
    Granted { delay: Duration },
    Wait(Duration),
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            domains: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until a request to `domain` is permitted; returns the time spent waiting
    pub async fn await_slot(&self, domain: &str) -> Duration {
        if !self.settings.enabled {
            return Duration::ZERO;
        }

        let window = self.window_for(domain);
        let started = Instant::now();

        loop {
            let admission = {
                let mut state = window.lock().await;
                let now = Instant::now();
                let span = self.settings.window().mul_f64(state.backoff);
                state.prune(now, span);

                if state.hits.len() < self.settings.requests_per_window {
                    // Space out consecutive hits on a domain that is already busy
                    let delay = if state.hits.is_empty() {
                        Duration::ZERO
                    } else {
                        self.politeness_delay() + self.jitter()
                    };
                    state.record(now + delay);
                    Admission::Granted { delay }
                } else {
                    let oldest = state.hits.front().copied().unwrap_or(now);
                    Admission::Wait((oldest + span).saturating_duration_since(now) + self.jitter())
                }
            };

            match admission {
                Admission::Granted { delay } => {
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    break;
                }
                Admission::Wait(wait) => {
                    warn!(domain, wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
                    sleep(wait).await;
                }
            }
        }

        let waited = started.elapsed();
        debug!(domain, waited_ms = waited.as_millis() as u64, "Request slot granted");
        waited
    }

    /// Feed back a response status; throttling grows the backoff, success decays it
    pub async fn report_response(&self, domain: &str, status: u16) {
        let window = self.window_for(domain);
        let mut state = window.lock().await;

        if status == 429 || status == 503 {
            state.backoff = (state.backoff * 2.0).min(self.settings.max_backoff.max(1.0));
            state.success_streak = 0;
            warn!(domain, status, backoff = state.backoff, "Throttled, increasing backoff");
        } else if status < 400 {
            state.success_streak += 1;
            if state.backoff > 1.0 && state.success_streak >= self.settings.decay_after.max(1) {
                state.backoff = (state.backoff / 2.0).max(1.0);
                state.success_streak = 0;
                debug!(domain, backoff = state.backoff, "Backoff decayed");
            }
        }
    }

    /// Current backoff multiplier for a domain (1.0 when unknown)
    pub async fn backoff(&self, domain: &str) -> f64 {
        let window = self.window_for(domain);
        let state = window.lock().await;
        state.backoff
    }

    fn window_for(&self, domain: &str) -> Arc<AsyncMutex<DomainWindow>> {
        let mut domains = self
            .domains
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        domains
            .entry(domain.to_lowercase())
            .or_insert_with(|| Arc::new(AsyncMutex::new(DomainWindow::new())))
            .clone()
    }

    fn jitter(&self) -> Duration {
        if self.settings.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(thread_rng().gen_range(0..self.settings.jitter_ms))
    }

    fn politeness_delay(&self) -> Duration {
        let (min, max) = self.settings.politeness_delay_ms;
        if max == 0 || min > max {
            return Duration::ZERO;
        }
        Duration::from_millis(thread_rng().gen_range(min..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(requests: usize, window_secs: u64) -> RateLimitSettings {
        RateLimitSettings {
            enabled: true,
            requests_per_window: requests,
            window_secs,
            jitter_ms: 0,
            politeness_delay_ms: (0, 0),
            max_backoff: 8.0,
            decay_after: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_request_waits_for_oldest_to_expire() {
        let limiter = RateLimiter::new(settings(2, 10));

        assert_eq!(limiter.await_slot("a.com").await, Duration::ZERO);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(limiter.await_slot("a.com").await, Duration::ZERO);

        // Oldest entry was recorded at t=0, so the third request may go at t=10
        let waited = limiter.await_slot("a.com").await;
        assert!(waited >= Duration::from_secs(7), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(8), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_domains_are_independent() {
        let limiter = RateLimiter::new(settings(1, 60));

        assert_eq!(limiter.await_slot("a.com").await, Duration::ZERO);
        assert_eq!(limiter.await_slot("b.com").await, Duration::ZERO);
        assert_eq!(limiter.await_slot("B.COM").await, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_exceed_window() {
        let limiter = Arc::new(RateLimiter::new(settings(2, 10)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.await_slot("busy.com").await;
                Instant::now()
            }));
        }

        let mut granted = Vec::new();
        for handle in handles {
            granted.push(handle.await.unwrap().duration_since(start));
        }
        granted.sort();

        // Any three consecutive grants must span at least a full window
        for triple in granted.windows(3) {
            assert!(triple[2] - triple[0] >= Duration::from_secs(10), "grants {:?}", granted);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_stretches_window_and_decays() {
        let limiter = RateLimiter::new(settings(1, 10));

        limiter.report_response("a.com", 429).await;
        assert_eq!(limiter.backoff("a.com").await, 2.0);

        limiter.await_slot("a.com").await;
        let waited = limiter.await_slot("a.com").await;
        assert!(waited >= Duration::from_secs(20), "waited {:?}", waited);

        for _ in 0..4 {
            limiter.report_response("a.com", 429).await;
        }
        assert_eq!(limiter.backoff("a.com").await, 8.0);

        for _ in 0..3 {
            limiter.report_response("a.com", 200).await;
        }
        assert_eq!(limiter.backoff("a.com").await, 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_stays_within_bound_after_expiry() {
        let mut config = settings(1, 10);
        config.jitter_ms = 500;
        let limiter = RateLimiter::new(config);

        for i in 0..8 {
            let domain = format!("site{}.com", i);
            assert_eq!(limiter.await_slot(&domain).await, Duration::ZERO);

            let waited = limiter.await_slot(&domain).await;
            assert!(waited >= Duration::from_secs(10), "waited {:?}", waited);
            assert!(waited < Duration::from_millis(10_500), "waited {:?}", waited);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_politeness_delay_between_hits() {
        let mut config = settings(5, 60);
        config.politeness_delay_ms = (1000, 1000);
        let limiter = RateLimiter::new(config);

        assert_eq!(limiter.await_slot("a.com").await, Duration::ZERO);
        assert_eq!(limiter.await_slot("a.com").await, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_disabled_limiter_never_waits() {
        let mut config = settings(1, 3600);
        config.enabled = false;
        let limiter = RateLimiter::new(config);

        for _ in 0..5 {
            assert_eq!(limiter.await_slot("a.com").await, Duration::ZERO);
        }
    }
}
