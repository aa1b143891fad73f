//! Per-domain rate limiter (C3).
//!
//! A single process-wide `host -> last_scheduled_time` map, injected into
//! the worker pool as a shared dependency rather than read as a true global
//! (keeps tests deterministic). Grounded in the teacher's use of
//! `DashMap` as a concurrent map shared across worker tasks.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Minimum gap enforced even when a domain specifies no crawl-delay.
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

pub struct RateLimiter {
    // Stored as milliseconds-since-limiter-creation so the map can hold a
    // plain atomic rather than a lock per entry.
    last_scheduled: DashMap<String, AtomicI64>,
    epoch: Instant,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            last_scheduled: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    /// Reserve the next available slot for `host` and sleep until it
    /// arrives. The reservation is written before sleeping, so concurrent
    /// callers for the same host queue up instead of racing to the same
    /// wake time (prevents a thundering herd when many workers arrive at
    /// once).
    pub async fn wait(&self, host: &str, min_interval: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let min_interval = min_interval.max(DEFAULT_MIN_INTERVAL);
        let now_ms = self.epoch.elapsed().as_millis() as i64;

        let reserved_ms = {
            let entry = self
                .last_scheduled
                .entry(host.to_string())
                .or_insert_with(|| AtomicI64::new(i64::MIN));
            let mut reserved = entry.load(Ordering::SeqCst);
            loop {
                let earliest = reserved.saturating_add(min_interval.as_millis() as i64);
                let next = earliest.max(now_ms);
                match entry.compare_exchange(reserved, next, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => break next,
                    Err(observed) => reserved = observed,
                }
            }
        };

        let sleep_ms = (reserved_ms - now_ms).max(0) as u64;
        if sleep_ms == 0 {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => Ok(()),
            _ = cancel.cancelled() => Err(Cancelled),
        }
    }

    /// Drop entries idle longer than `older_than`, bounding map growth
    /// (expected distinct-host working set stays well under 10,000).
    pub fn cleanup(&self, older_than: Duration) {
        let now_ms = self.epoch.elapsed().as_millis() as i64;
        let cutoff = older_than.as_millis() as i64;
        self.last_scheduled
            .retain(|_, last| now_ms - last.load(Ordering::SeqCst) < cutoff);
    }

    pub fn len(&self) -> usize {
        self.last_scheduled.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Cancelled;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serialises_same_host_with_minimum_gap() {
        let limiter = RateLimiter::new();
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.wait("a.example", Duration::from_millis(50), &cancel).await.unwrap();
        limiter.wait("a.example", Duration::from_millis(50), &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn distinct_hosts_do_not_block_each_other() {
        let limiter = RateLimiter::new();
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.wait("a.example", Duration::from_secs(5), &cancel).await.unwrap();
        limiter.wait("b.example", Duration::from_secs(5), &cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let limiter = RateLimiter::new();
        let cancel = CancellationToken::new();
        limiter.wait("a.example", Duration::from_millis(10), &cancel).await.unwrap();

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cancel2.cancel();
        });

        let result = limiter.wait("a.example", Duration::from_secs(10), &cancel).await;
        assert!(result.is_err());
    }

    #[test]
    fn cleanup_evicts_idle_entries() {
        let limiter = RateLimiter::new();
        limiter.last_scheduled.insert("old.example".into(), AtomicI64::new(i64::MIN / 2));
        limiter.cleanup(Duration::from_secs(1));
        assert_eq!(limiter.len(), 0);
    }
}
