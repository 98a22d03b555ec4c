//! Per-client admission control.
//!
//! Every client key (the peer IP without its port) owns a token bucket that
//! refills continuously at `requests_per_second` up to `burst` tokens. The
//! registry map sits behind a read/write lock so lookups of existing buckets
//! run concurrently; the write lock is only taken to create a bucket on first
//! sight or to evict idle ones. Each bucket has its own mutex, so token
//! consumption for one key is linearized without serializing other keys.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use tokio::{sync::oneshot, task::JoinHandle};

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSettings {
    pub requests_per_second: f64,
    pub burst: u32,
    pub idle_ttl: Duration,
}

impl RateLimitSettings {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            requests_per_second: config.requests_per_second,
            burst: config.burst,
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

#[derive(Debug)]
struct TokenBucketState {
    available_tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
    evicted: bool,
}

#[derive(Debug)]
pub struct ClientRateLimiter {
    settings: RateLimitSettings,
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucketState>>>>,
}

impl ClientRateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> RateLimitSettings {
        self.settings
    }

    /// Consumes one token for `key`, returning whether the request is admitted.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        loop {
            let bucket = self.bucket(key, now);
            if let Some(admitted) = self.consume(&bucket, now) {
                return admitted;
            }
        }
    }

    /// `None` when the sweeper evicted the bucket after it was looked up;
    /// the caller must fetch the live one instead of spending a dead token.
    fn consume(&self, bucket: &Mutex<TokenBucketState>, now: Instant) -> Option<bool> {
        let mut state = bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.evicted {
            return None;
        }
        Some(take_token(
            &mut state,
            now,
            self.settings.requests_per_second,
            f64::from(self.settings.burst),
        ))
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Drops buckets that have not been touched for longer than the idle TTL.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let idle_ttl = self.settings.idle_ttl;
        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let mut state = bucket
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let keep = now.saturating_duration_since(state.last_seen) < idle_ttl;
            state.evicted = !keep;
            keep
        });
        before - buckets.len()
    }

    fn bucket(&self, key: &str, now: Instant) -> Arc<Mutex<TokenBucketState>> {
        if let Some(bucket) = self
            .buckets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
        {
            return Arc::clone(bucket);
        }

        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Another task may have created it between the two lock acquisitions.
        let bucket = buckets.entry(key.to_owned()).or_insert_with(|| {
            Arc::new(Mutex::new(TokenBucketState {
                available_tokens: f64::from(self.settings.burst),
                last_refill: now,
                last_seen: now,
                evicted: false,
            }))
        });
        Arc::clone(bucket)
    }
}

fn take_token(
    state: &mut TokenBucketState,
    now: Instant,
    tokens_per_second: f64,
    burst_tokens: f64,
) -> bool {
    let elapsed = now.saturating_duration_since(state.last_refill);
    if now > state.last_refill {
        state.last_refill = now;
    }
    if now > state.last_seen {
        state.last_seen = now;
    }

    let replenished = elapsed.as_secs_f64() * tokens_per_second;
    state.available_tokens = (state.available_tokens + replenished).min(burst_tokens);
    if state.available_tokens >= 1.0 {
        state.available_tokens -= 1.0;
        true
    } else {
        false
    }
}

#[derive(Debug)]
pub struct SweeperHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

/// Spawns the periodic idle-bucket eviction task.
pub fn spawn_sweeper(limiter: Arc<ClientRateLimiter>, interval: Duration) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    let evicted = limiter.sweep_idle(Instant::now());
                    if evicted > 0 {
                        tracing::debug!(
                            evicted,
                            remaining = limiter.tracked_clients(),
                            "evicted idle rate limit buckets"
                        );
                    }
                }
            }
        }
    });

    SweeperHandle { shutdown_tx, join }
}
