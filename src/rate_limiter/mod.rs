//! Hierarchical token/rolling-window rate limiter shared by every network
//! caller within one exchange instance.
//!
//! Ported from Hummingbot's `AsyncRequestContextBase.acquire` (see
//! `examples/original_source/hummingbot/core/api_throttler/async_request_context_base.py`):
//! a single mutex guards a flat task log; admission is a flush-then-check
//! loop with a fixed retry interval, generalized from a "mutex over a
//! shared map, sliding window" shape used elsewhere in this codebase for
//! inbound IP throttling to outbound, per-limit-id admission with linked
//! limits.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

const MAX_CAPACITY_WARNING_INTERVAL: Duration = Duration::from_secs(30);

/// A linked limit consumed alongside a named limit's own capacity, at its
/// own weight.
#[derive(Debug, Clone)]
pub struct LinkedLimit {
    pub id: String,
    pub weight: u32,
}

/// A rate limit definition: `limit` admissions per `interval`, at `weight`
/// per admission, plus any `linked_limits` that must also have capacity.
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub id: String,
    pub limit: u32,
    pub interval: Duration,
    pub weight: u32,
    pub linked_limits: Vec<LinkedLimit>,
}

impl RateLimit {
    pub fn new(id: impl Into<String>, limit: u32, interval: Duration) -> Self {
        Self {
            id: id.into(),
            limit,
            interval,
            weight: 1,
            linked_limits: Vec::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn linked(mut self, id: impl Into<String>, weight: u32) -> Self {
        self.linked_limits.push(LinkedLimit {
            id: id.into(),
            weight,
        });
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct TaskLog {
    timestamp: Instant,
    weight: u32,
}

/// A no-op guard returned by `acquire`. Admission already happened by the
/// time this is constructed; dropping it does nothing, since the task
/// log ages admissions out on its own rather than on release.
pub struct RateLimiterGuard;

pub struct RateLimiter {
    limits: HashMap<String, RateLimit>,
    task_log: Mutex<HashMap<String, Vec<TaskLog>>>,
    safety_margin_pct: f64,
    retry_interval: Duration,
    last_capacity_warning: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(limits: Vec<RateLimit>, safety_margin_pct: f64, retry_interval: Duration) -> Self {
        let limits = limits.into_iter().map(|l| (l.id.clone(), l)).collect();
        Self {
            limits,
            task_log: Mutex::new(HashMap::new()),
            safety_margin_pct,
            retry_interval,
            last_capacity_warning: Mutex::new(None),
        }
    }

    /// Block until admission is granted under the named limit and every
    /// limit it links to, then record the admission and return.
    pub async fn acquire(&self, limit_id: &str) -> RateLimiterGuard {
        let Some(limit) = self.limits.get(limit_id) else {
            // An unconfigured limit id has no capacity constraint: admit
            // immediately. Exchange plugins that forget to register a
            // limit id should not deadlock the pipeline.
            return RateLimiterGuard;
        };

        loop {
            {
                let mut log = self.task_log.lock();
                self.flush(&mut log);
                if self.within_capacity(&log, limit) {
                    self.record_admission(&mut log, limit);
                    return RateLimiterGuard;
                }
            }
            self.warn_if_saturated(limit_id);
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn flush(&self, log: &mut HashMap<String, Vec<TaskLog>>) {
        let now = Instant::now();
        for (id, entries) in log.iter_mut() {
            let Some(limit) = self.limits.get(id) else {
                entries.clear();
                continue;
            };
            let ttl = limit.interval.mul_f64(1.0 + self.safety_margin_pct);
            entries.retain(|entry| now.duration_since(entry.timestamp) <= ttl);
        }
    }

    fn used(&self, log: &HashMap<String, Vec<TaskLog>>, limit: &RateLimit) -> u32 {
        let now = Instant::now();
        log.get(&limit.id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| now.duration_since(e.timestamp) <= limit.interval)
                    .map(|e| e.weight)
                    .sum()
            })
            .unwrap_or(0)
    }

    fn within_capacity(&self, log: &HashMap<String, Vec<TaskLog>>, limit: &RateLimit) -> bool {
        if self.used(log, limit) + limit.weight > limit.limit {
            return false;
        }
        for link in &limit.linked_limits {
            let Some(linked) = self.limits.get(&link.id) else {
                continue;
            };
            if self.used(log, linked) + link.weight > linked.limit {
                return false;
            }
        }
        true
    }

    fn record_admission(&self, log: &mut HashMap<String, Vec<TaskLog>>, limit: &RateLimit) {
        let now = Instant::now();
        log.entry(limit.id.clone()).or_default().push(TaskLog {
            timestamp: now,
            weight: limit.weight,
        });
        for link in &limit.linked_limits {
            log.entry(link.id.clone()).or_default().push(TaskLog {
                timestamp: now,
                weight: link.weight,
            });
        }
    }

    fn warn_if_saturated(&self, limit_id: &str) {
        let now = Instant::now();
        let mut last = self.last_capacity_warning.lock();
        if last
            .map(|t| now.duration_since(t) < MAX_CAPACITY_WARNING_INTERVAL)
            .unwrap_or(false)
        {
            return;
        }
        *last = Some(now);
        warn!(limit_id, "rate limit at capacity, backing off");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_limit_immediately() {
        let limiter = RateLimiter::new(
            vec![RateLimit::new("A", 2, Duration::from_secs(1))],
            0.0,
            Duration::from_millis(10),
        );
        let start = Instant::now();
        limiter.acquire("A").await;
        limiter.acquire("A").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn third_acquire_waits_for_window() {
        // RateLimit{id="A", limit=2, interval=300ms}; three concurrent
        // acquires at t=0 — two complete immediately, the third waits.
        let limiter = std::sync::Arc::new(RateLimiter::new(
            vec![RateLimit::new("A", 2, Duration::from_millis(300))],
            0.0,
            Duration::from_millis(10),
        ));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire("A").await;
                start.elapsed()
            }));
        }
        let mut elapsed: Vec<Duration> = Vec::new();
        for h in handles {
            elapsed.push(h.await.unwrap());
        }
        elapsed.sort();
        assert!(elapsed[0] < Duration::from_millis(100));
        assert!(elapsed[1] < Duration::from_millis(100));
        assert!(elapsed[2] >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn linked_limit_must_also_have_capacity() {
        let limiter = RateLimiter::new(
            vec![
                RateLimit::new("order", 100, Duration::from_secs(1)).linked("pool", 1),
                RateLimit::new("pool", 1, Duration::from_secs(10)),
            ],
            0.0,
            Duration::from_millis(10),
        );
        limiter.acquire("order").await;

        let second = tokio::time::timeout(Duration::from_millis(50), limiter.acquire("order"))
            .await;
        assert!(second.is_err(), "pool capacity should block the second order acquire");
    }

    #[tokio::test]
    async fn unconfigured_limit_admits_immediately() {
        let limiter = RateLimiter::new(vec![], 0.05, Duration::from_millis(100));
        let start = Instant::now();
        limiter.acquire("unknown").await;
        assert!(start.elapsed() < Duration::from_millis(20));
    }
}
