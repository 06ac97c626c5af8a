//! Per-(tenant, service) request quotas over three wall-clock-aligned
//! fixed windows: minute, hour, day.
//!
//! Admission is atomic across all three windows: a rejected request leaves
//! every counter untouched, an admitted one increments all three. The
//! in-memory store keeps its buckets in a sharded concurrent map so
//! unrelated tenants never contend on a lock; an optional Redis store
//! keeps the counters shared across gateway replicas and is the only path
//! that can degrade into fail-open / fail-closed behavior.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use nimbus_shared::tenant::ResolvedLimits;
use nimbus_shared::types::{ServiceId, TenantId};

use crate::config::FailMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    pub fn size_secs(&self) -> i64 {
        match self {
            Window::Minute => 60,
            Window::Hour => 3_600,
            Window::Day => 86_400,
        }
    }

    pub fn align(&self, epoch_secs: i64) -> i64 {
        epoch_secs - epoch_secs.rem_euclid(self.size_secs())
    }

    /// Buckets are reclaimable strictly after start + size + grace, with
    /// grace = 2 x window size.
    pub fn expires_at(&self, window_start: i64) -> i64 {
        window_start + 3 * self.size_secs()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowLimits {
    pub minute: u64,
    pub hour: u64,
    pub day: u64,
}

impl From<&ResolvedLimits> for WindowLimits {
    fn from(limits: &ResolvedLimits) -> Self {
        Self {
            minute: limits.requests_per_minute,
            hour: limits.requests_per_hour,
            day: limits.requests_per_day,
        }
    }
}

/// Values for the X-RateLimit-* response headers; the minute window is the
/// tightest and is what clients see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_secs: u64,
    /// True when the counter backend was unreachable and the request was
    /// admitted without enforcement.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admit(AdmitInfo),
    Reject { reason: String, retry_after: u64 },
}

/// Counter backend error; triggers degraded-mode handling in the limiter.
#[derive(Debug)]
pub struct StoreUnavailable(pub String);

impl std::fmt::Display for StoreUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rate-limit store unavailable: {}", self.0)
    }
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically evaluates and, on admission, consumes one slot in each
    /// window. `now_epoch` is wall-clock seconds.
    async fn check_and_consume(
        &self,
        tenant_id: &str,
        service_id: &str,
        limits: WindowLimits,
        now_epoch: i64,
    ) -> Result<Decision, StoreUnavailable>;
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    window_start: i64,
    count: u64,
    first_seen: i64,
    last_seen: i64,
}

impl WindowCounter {
    fn fresh(window: Window, now: i64) -> Self {
        Self {
            window_start: window.align(now),
            count: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Rolls into the current window if this one has passed. Counts never
    /// decrease within a window; a roll starts a fresh bucket.
    fn roll(&mut self, window: Window, now: i64) {
        if now >= self.window_start + window.size_secs() {
            *self = Self::fresh(window, now);
        }
    }

    fn seconds_to_roll(&self, window: Window, now: i64) -> u64 {
        (self.window_start + window.size_secs() - now).max(1) as u64
    }

    fn expired(&self, window: Window, now: i64) -> bool {
        now >= window.expires_at(self.window_start)
    }
}

#[derive(Debug, Clone, Copy)]
struct PairCounters {
    minute: WindowCounter,
    hour: WindowCounter,
    day: WindowCounter,
}

impl PairCounters {
    fn fresh(now: i64) -> Self {
        Self {
            minute: WindowCounter::fresh(Window::Minute, now),
            hour: WindowCounter::fresh(Window::Hour, now),
            day: WindowCounter::fresh(Window::Day, now),
        }
    }
}

/// In-memory counter store over a sharded concurrent map. Infallible; the
/// per-key entry guard is held only for the single-bucket critical
/// section.
#[derive(Default)]
pub struct MemoryCounterStore {
    buckets: DashMap<(TenantId, ServiceId), PairCounters>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decide(
        &self,
        tenant_id: &str,
        service_id: &str,
        limits: WindowLimits,
        now: i64,
    ) -> Decision {
        // The entry guard keeps the whole three-window evaluation and
        // increment atomic for this (tenant, service) pair.
        let mut counters = self
            .buckets
            .entry((tenant_id.to_string(), service_id.to_string()))
            .or_insert_with(|| PairCounters::fresh(now));

        counters.minute.roll(Window::Minute, now);
        counters.hour.roll(Window::Hour, now);
        counters.day.roll(Window::Day, now);

        let checks = [
            (Window::Minute, counters.minute, limits.minute),
            (Window::Hour, counters.hour, limits.hour),
            (Window::Day, counters.day, limits.day),
        ];
        let offending: Vec<_> = checks
            .iter()
            .filter(|(_, counter, limit)| counter.count + 1 > *limit)
            .collect();

        if let Some((tightest, _, _)) = offending.first() {
            // The smallest wait that clears every offending window.
            let retry_after = offending
                .iter()
                .map(|(window, counter, _)| counter.seconds_to_roll(*window, now))
                .max()
                .unwrap_or(1);
            return Decision::Reject {
                reason: format!("{} window limit reached", tightest.label()),
                retry_after,
            };
        }

        counters.minute.count += 1;
        counters.hour.count += 1;
        counters.day.count += 1;
        counters.minute.last_seen = now;
        counters.hour.last_seen = now;
        counters.day.last_seen = now;

        Decision::Admit(AdmitInfo {
            limit: limits.minute,
            remaining: limits.minute - counters.minute.count,
            reset_secs: counters.minute.seconds_to_roll(Window::Minute, now),
            degraded: false,
        })
    }

    /// Drops bucket entries whose every window is past its grace period.
    /// `retain` walks the map one internal shard at a time, so admission
    /// calls are never blocked beyond a single shard.
    pub fn sweep(&self, now: i64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, c| {
            !(c.minute.expired(Window::Minute, now)
                && c.hour.expired(Window::Hour, now)
                && c.day.expired(Window::Day, now))
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn check_and_consume(
        &self,
        tenant_id: &str,
        service_id: &str,
        limits: WindowLimits,
        now_epoch: i64,
    ) -> Result<Decision, StoreUnavailable> {
        Ok(self.decide(tenant_id, service_id, limits, now_epoch))
    }
}

/// Check-then-consume in one round trip; counters are only incremented
/// when every window stays within its limit.
const REDIS_CHECK_SCRIPT: &str = r#"
local m = tonumber(redis.call('GET', KEYS[1]) or '0')
local h = tonumber(redis.call('GET', KEYS[2]) or '0')
local d = tonumber(redis.call('GET', KEYS[3]) or '0')
if m < tonumber(ARGV[1]) and h < tonumber(ARGV[2]) and d < tonumber(ARGV[3]) then
  redis.call('INCR', KEYS[1])
  redis.call('EXPIRE', KEYS[1], ARGV[4])
  redis.call('INCR', KEYS[2])
  redis.call('EXPIRE', KEYS[2], ARGV[5])
  redis.call('INCR', KEYS[3])
  redis.call('EXPIRE', KEYS[3], ARGV[6])
  return {1, m + 1, h + 1, d + 1}
end
return {0, m, h, d}
"#;

/// Distributed counters shared across gateway replicas, keyed
/// `(tenant, service, window_start)`.
pub struct RedisCounterStore {
    client: redis::Client,
    script: redis::Script,
}

impl RedisCounterStore {
    pub fn new(url: &str) -> Result<Self, StoreUnavailable> {
        let client = redis::Client::open(url).map_err(|e| StoreUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            script: redis::Script::new(REDIS_CHECK_SCRIPT),
        })
    }

    fn key(tenant_id: &str, service_id: &str, window: Window, now: i64) -> String {
        format!(
            "rate:{}:{}:{}:{}",
            tenant_id,
            service_id,
            window.label(),
            window.align(now)
        )
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn check_and_consume(
        &self,
        tenant_id: &str,
        service_id: &str,
        limits: WindowLimits,
        now_epoch: i64,
    ) -> Result<Decision, StoreUnavailable> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| StoreUnavailable(e.to_string()))?;

        let (admitted, minute, hour, day): (u8, u64, u64, u64) = self
            .script
            .key(Self::key(tenant_id, service_id, Window::Minute, now_epoch))
            .key(Self::key(tenant_id, service_id, Window::Hour, now_epoch))
            .key(Self::key(tenant_id, service_id, Window::Day, now_epoch))
            .arg(limits.minute)
            .arg(limits.hour)
            .arg(limits.day)
            .arg(Window::Minute.size_secs() * 3)
            .arg(Window::Hour.size_secs() * 3)
            .arg(Window::Day.size_secs() * 3)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreUnavailable(e.to_string()))?;

        let minute_reset = (Window::Minute.align(now_epoch) + Window::Minute.size_secs()
            - now_epoch)
            .max(1) as u64;

        if admitted == 1 {
            return Ok(Decision::Admit(AdmitInfo {
                limit: limits.minute,
                remaining: limits.minute.saturating_sub(minute),
                reset_secs: minute_reset,
                degraded: false,
            }));
        }

        let mut offending: Vec<(Window, u64)> = Vec::new();
        if minute >= limits.minute {
            offending.push((Window::Minute, minute_reset));
        }
        if hour >= limits.hour {
            let reset = (Window::Hour.align(now_epoch) + Window::Hour.size_secs() - now_epoch)
                .max(1) as u64;
            offending.push((Window::Hour, reset));
        }
        if day >= limits.day {
            let reset = (Window::Day.align(now_epoch) + Window::Day.size_secs() - now_epoch)
                .max(1) as u64;
            offending.push((Window::Day, reset));
        }
        let reason = offending
            .first()
            .map(|(w, _)| format!("{} window limit reached", w.label()))
            .unwrap_or_else(|| "window limit reached".to_string());
        let retry_after = offending.iter().map(|(_, r)| *r).max().unwrap_or(1);

        Ok(Decision::Reject {
            reason,
            retry_after,
        })
    }
}

/// The limiter the request pipeline talks to. Owns degraded-mode policy
/// and the fail-open observability counter.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    fail_mode: FailMode,
    fail_open_events: AtomicU64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, fail_mode: FailMode) -> Self {
        Self {
            store,
            fail_mode,
            fail_open_events: AtomicU64::new(0),
        }
    }

    pub async fn check_and_consume(
        &self,
        tenant_id: &str,
        service_id: &str,
        limits: &ResolvedLimits,
    ) -> Decision {
        self.check_and_consume_at(
            tenant_id,
            service_id,
            limits,
            chrono::Utc::now().timestamp(),
        )
        .await
    }

    pub async fn check_and_consume_at(
        &self,
        tenant_id: &str,
        service_id: &str,
        limits: &ResolvedLimits,
        now_epoch: i64,
    ) -> Decision {
        match self
            .store
            .check_and_consume(tenant_id, service_id, limits.into(), now_epoch)
            .await
        {
            Ok(decision) => {
                if let Decision::Reject {
                    reason,
                    retry_after,
                } = &decision
                {
                    debug!(
                        tenant_id = tenant_id,
                        service_id = service_id,
                        reason = %reason,
                        retry_after = retry_after,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => match self.fail_mode {
                FailMode::Open => {
                    self.fail_open_events.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        tenant_id = tenant_id,
                        service_id = service_id,
                        error = %e,
                        "Rate-limit store unavailable; admitting without enforcement"
                    );
                    Decision::Admit(AdmitInfo {
                        limit: limits.requests_per_minute,
                        remaining: 0,
                        reset_secs: 60,
                        degraded: true,
                    })
                }
                FailMode::Closed => {
                    warn!(
                        tenant_id = tenant_id,
                        service_id = service_id,
                        error = %e,
                        "Rate-limit store unavailable; rejecting (fail-closed)"
                    );
                    Decision::Reject {
                        reason: "rate limiter unavailable".to_string(),
                        retry_after: 30,
                    }
                }
            },
        }
    }

    /// Number of requests admitted without enforcement since boot.
    pub fn fail_open_events(&self) -> u64 {
        self.fail_open_events.load(Ordering::Relaxed)
    }
}

/// Spawns the background bucket sweeper for the in-memory store.
pub fn spawn_sweeper(store: Arc<MemoryCounterStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reclaimed = store.sweep(chrono::Utc::now().timestamp());
            if reclaimed > 0 {
                debug!(reclaimed = reclaimed, "Swept expired rate buckets");
            }
        }
    })
}

/// Per-tenant in-flight request cap. A dropped permit releases the slot.
#[derive(Default)]
pub struct ConcurrencyLimiter {
    in_flight: DashMap<TenantId, u64>,
}

pub struct ConcurrencyPermit {
    tenant_id: TenantId,
    limiter: Arc<ConcurrencyLimiter>,
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(
        self: &Arc<Self>,
        tenant_id: &str,
        cap: u64,
    ) -> Option<ConcurrencyPermit> {
        let mut count = self.in_flight.entry(tenant_id.to_string()).or_insert(0);
        if *count >= cap {
            return None;
        }
        *count += 1;
        drop(count);
        Some(ConcurrencyPermit {
            tenant_id: tenant_id.to_string(),
            limiter: self.clone(),
        })
    }

    pub fn in_flight(&self, tenant_id: &str) -> u64 {
        self.in_flight
            .get(tenant_id)
            .map(|count| *count)
            .unwrap_or(0)
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        let emptied = match self.limiter.in_flight.get_mut(&self.tenant_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if emptied {
            // Re-checked under the entry lock: a concurrent acquire wins.
            self.limiter
                .in_flight
                .remove_if(&self.tenant_id, |_, count| *count == 0);
        }
    }
}
