use super::trace::integer_header;
use super::FilterResult;
use crate::config::{KeyStrategy, RateLimitConfig};
use crate::error::GatewayError;
use crate::proxy::context::{RequestContext, ResponseContext};
use dashmap::DashMap;
use http::HeaderName;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

static X_RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Token-bucket rate limiter keyed by an arbitrary string.
///
/// Buckets are created full on first use and refilled lazily on access:
/// `tokens = min(capacity, tokens + elapsed * refill_per_sec)`. There is no
/// timer per bucket. Synchronisation is per key: the `DashMap` shard lock is
/// only held to fetch the bucket, then the bucket's own mutex serialises the
/// refill-and-take step.
///
/// **GC**: buckets not touched for `idle_ttl` are evicted by a background
/// sweep, so dynamic keys (per-IP, per-path) do not grow without bound.
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    capacity: f64,
    refill_per_sec: f64,
    idle_ttl: Duration,
    /// Reference point for `last_access` timestamps.
    origin: Instant,
}

/// `tokio::sync::Mutex` so that waiting for a hot key yields to the runtime
/// instead of blocking the worker thread.
struct Bucket {
    inner: Mutex<BucketInner>,
    /// Microseconds since `RateLimiter::origin`. Updated outside the lock.
    last_access: AtomicU64,
}

struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

/// GC runs every this many seconds.
const GC_INTERVAL_SECS: u64 = 60;
/// Hard cap on buckets. When exceeded after the idle sweep, the least recently
/// used buckets are force-evicted.
const MAX_ENTRIES: usize = 100_000;

impl RateLimiter {
    pub fn new(capacity: f64, refill_per_sec: f64, idle_ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity,
            refill_per_sec,
            idle_ttl,
            origin: Instant::now(),
        }
    }

    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    /// Take `cost` tokens from `key`'s bucket. Returns the tokens left on
    /// success, `None` when the bucket is short. A denial leaves the bucket
    /// untouched apart from the refill.
    pub async fn acquire(&self, key: &str, cost: f64) -> Option<f64> {
        // Fast path: key already exists, no allocation.
        let bucket = if let Some(entry) = self.buckets.get(key) {
            entry.value().clone()
        } else {
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Bucket {
                        inner: Mutex::new(BucketInner {
                            tokens: self.capacity,
                            last_refill: Instant::now(),
                        }),
                        last_access: AtomicU64::new(self.now_us()),
                    })
                })
                .clone()
        };

        bucket.last_access.store(self.now_us(), Ordering::Relaxed);

        let mut b = bucket.inner.lock().await;
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last_refill).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        b.last_refill = now;

        if b.tokens >= cost {
            b.tokens -= cost;
            Some(b.tokens)
        } else {
            None
        }
    }

    /// Returns `true` if allowed, `false` if rate limited.
    pub async fn try_acquire(&self, key: &str, cost: f64) -> bool {
        self.acquire(key, cost).await.is_some()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Spawn a background sweep. The task holds only a weak reference and
    /// exits once the limiter is dropped (e.g. after a route table reload).
    /// Outside a tokio runtime this is a no-op.
    pub fn start_gc(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let limiter: Weak<Self> = Arc::downgrade(self);
        handle.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(GC_INTERVAL_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                match limiter.upgrade() {
                    Some(l) => l.evict_idle(),
                    None => return,
                }
            }
        });
    }

    /// Remove buckets idle for longer than the TTL, then enforce `MAX_ENTRIES`.
    pub fn evict_idle(&self) {
        let now = self.now_us();
        let ttl_us = self.idle_ttl.as_micros() as u64;
        self.buckets
            .retain(|_, b| now.saturating_sub(b.last_access.load(Ordering::Relaxed)) < ttl_us);

        if self.buckets.len() > MAX_ENTRIES {
            self.force_evict(now);
        }
    }

    fn force_evict(&self, now: u64) {
        let overflow = self.buckets.len().saturating_sub(MAX_ENTRIES);
        if overflow == 0 {
            return;
        }
        // Collect (key, age) pairs, sort by age descending, remove the oldest.
        let mut entries: Vec<(String, u64)> = self
            .buckets
            .iter()
            .map(|r| {
                let age = now.saturating_sub(r.value().last_access.load(Ordering::Relaxed));
                (r.key().clone(), age)
            })
            .collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in entries.into_iter().take(overflow) {
            self.buckets.remove(&key);
        }
    }
}

/// Derives the bucket key from a request by trying strategies in order.
pub struct KeyResolver {
    strategies: Vec<KeyStrategy>,
    user_id_header: HeaderName,
    api_key_header: HeaderName,
}

impl KeyResolver {
    pub fn new(cfg: &RateLimitConfig) -> Result<Self, GatewayError> {
        let header = |name: &str| {
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                GatewayError::Config(format!("invalid rate limit header name '{name}'"))
            })
        };
        Ok(Self {
            strategies: cfg.key_strategies.clone(),
            user_id_header: header(&cfg.user_id_header)?,
            api_key_header: header(&cfg.api_key_header)?,
        })
    }

    /// Keys are prefixed by strategy so a user id can never collide with an
    /// IP or a path. Falls back to the path when no strategy applies.
    pub fn resolve(&self, ctx: &RequestContext) -> String {
        for strategy in &self.strategies {
            let key = match strategy {
                KeyStrategy::UserId => header_value(ctx, &self.user_id_header)
                    .map(|v| format!("user:{v}")),
                KeyStrategy::ApiKey => header_value(ctx, &self.api_key_header)
                    .map(|v| format!("api_key:{v}")),
                KeyStrategy::RemoteAddr => Some(format!("ip:{}", ctx.remote_addr.ip())),
                KeyStrategy::Path => Some(format!("path:{}", ctx.inbound_path)),
            };
            if let Some(k) = key {
                return k;
            }
        }
        format!("path:{}", ctx.inbound_path)
    }
}

fn header_value<'a>(ctx: &'a RequestContext, name: &HeaderName) -> Option<&'a str> {
    ctx.headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// The `rate_limit` route filter: one limiter per route.
pub struct RouteRateLimit {
    route_id: String,
    limiter: Arc<RateLimiter>,
    keys: KeyResolver,
}

impl RouteRateLimit {
    pub fn new(route_id: &str, cfg: &RateLimitConfig) -> Result<Self, GatewayError> {
        let limiter = Arc::new(RateLimiter::new(
            cfg.capacity,
            cfg.refill_per_sec,
            Duration::from_secs(cfg.idle_ttl_secs),
        ));
        limiter.start_gc();
        Ok(Self {
            route_id: route_id.to_string(),
            limiter,
            keys: KeyResolver::new(cfg)?,
        })
    }

    pub(super) async fn on_request(&self, ctx: &mut RequestContext) -> FilterResult {
        let key = self.keys.resolve(ctx);

        match self.limiter.acquire(&key, 1.0).await {
            Some(remaining) => {
                ctx.rate_limit_remaining = Some(remaining.floor() as u64);
                metrics::counter!(
                    "gateway_rate_limit_allowed_total",
                    "route" => self.route_id.clone(),
                )
                .increment(1);
                FilterResult::Continue
            }
            None => {
                tracing::debug!(
                    "filter: rate_limit: rejected, route={}, key={}, request_id={}",
                    self.route_id,
                    key,
                    ctx.correlation_id
                );
                metrics::counter!(
                    "gateway_rate_limit_rejected_total",
                    "route" => self.route_id.clone(),
                )
                .increment(1);
                FilterResult::Reject(GatewayError::RateLimited)
            }
        }
    }

    pub(super) fn on_response(&self, ctx: &RequestContext, resp: &mut ResponseContext) {
        if let Some(remaining) = ctx.rate_limit_remaining {
            resp.headers
                .insert(X_RATE_LIMIT_REMAINING.clone(), integer_header(remaining));
        }
    }
}
