// Token-bucket admission control for external tool invocations

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub calls_per_second: f64,
    pub burst_size: u32,
    /// Number of admission attempts before a request is denied.
    pub max_retries: u32,
    /// Upper bound on a single wait between attempts.
    pub retry_delay: Duration,
    /// Refill multiplier applied while the bucket is below half full.
    pub starvation_boost: f64,
    pub monitor_interval: Duration,
    pub warn_throttle_ratio: f64,
    pub stats_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_second: 150.0,
            burst_size: 10,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            starvation_boost: 1.5,
            monitor_interval: Duration::from_secs(60),
            warn_throttle_ratio: 0.2,
            stats_window: Duration::from_secs(3600),
        }
    }
}

/// Result of asking the limiter for tokens. Denial is an ordinary value:
/// the caller decides whether to skip, queue or abort.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Granted,
    Denied { available: f64 },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub throttled_requests: u64,
    pub throttle_rate: f64,
    pub current_tokens: f64,
    pub burst_size: u32,
    pub mean_interval_secs: Option<f64>,
    pub window_secs: f64,
    /// High-throttle warnings raised by the monitor since the limiter was created.
    pub throttle_warnings: u64,
}

#[derive(Debug)]
struct WindowStats {
    total_requests: u64,
    throttled_requests: u64,
    last_grant: Option<Instant>,
    interval_total: Duration,
    interval_count: u64,
    started: Instant,
}

impl WindowStats {
    fn new(now: Instant) -> Self {
        Self {
            total_requests: 0,
            throttled_requests: 0,
            last_grant: None,
            interval_total: Duration::ZERO,
            interval_count: 0,
            started: now,
        }
    }

    fn record_grant(&mut self, now: Instant) {
        if let Some(prev) = self.last_grant {
            self.interval_total += now.saturating_duration_since(prev);
            self.interval_count += 1;
        }
        self.last_grant = Some(now);
    }

    fn throttle_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.throttled_requests as f64 / self.total_requests as f64
        }
    }

    /// Start a fresh window once `window` has elapsed. Returns `true` on reset.
    fn reset_if_elapsed(&mut self, now: Instant, window: Duration) -> bool {
        if now.saturating_duration_since(self.started) >= window {
            *self = Self::new(now);
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
    stats: WindowStats,
    throttle_warnings: u64,
}

impl BucketState {
    /// Lazy refill proportional to elapsed time, boosted while starved.
    fn refill(&mut self, now: Instant, config: &RateLimitConfig) {
        let burst = config.burst_size as f64;
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        let mut new_tokens = elapsed * config.calls_per_second;
        if self.tokens < burst / 2.0 {
            new_tokens *= config.starvation_boost;
        }
        self.tokens = (self.tokens + new_tokens).clamp(0.0, burst);
        self.last_update = now;
    }

    fn take(&mut self, tokens: f64, now: Instant) -> bool {
        if self.tokens >= tokens {
            self.tokens = (self.tokens - tokens).max(0.0);
            self.stats.record_grant(now);
            true
        } else {
            false
        }
    }
}

/// Token-bucket limiter shared by every invocation a module issues.
///
/// All bucket state sits behind one async mutex. Waiting between attempts
/// happens outside the lock so other callers keep making progress.
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    state: Arc<Mutex<BucketState>>,
    monitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let now = Instant::now();
        let state = BucketState {
            tokens: config.burst_size as f64,
            last_update: now,
            stats: WindowStats::new(now),
            throttle_warnings: 0,
        };
        Self {
            name: name.into(),
            config,
            state: Arc::new(Mutex::new(state)),
            monitor: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take `tokens` from the bucket, waiting up to `max_retries` times for
    /// the bucket to refill.
    pub async fn acquire(&self, tokens: u32) -> Admission {
        self.acquire_with_attempts(tokens, self.config.max_retries.max(1))
            .await
    }

    /// Take `tokens` only if they are available right now.
    pub async fn try_acquire(&self, tokens: u32) -> Admission {
        self.acquire_with_attempts(tokens, 1).await
    }

    async fn acquire_with_attempts(&self, tokens: u32, attempts: u32) -> Admission {
        let wanted = tokens as f64;
        let cps = self.config.calls_per_second;

        {
            let mut state = self.state.lock().await;
            state.stats.total_requests += 1;
            if tokens > self.config.burst_size {
                state.stats.throttled_requests += 1;
                warn!(
                    limiter = %self.name,
                    requested = tokens,
                    burst_size = self.config.burst_size,
                    "Request exceeds burst size and can never be granted"
                );
                return Admission::Denied {
                    available: state.tokens,
                };
            }
        }

        let mut throttled = false;
        for attempt in 0..attempts {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.refill(now, &self.config);
                if state.take(wanted, now) {
                    return Admission::Granted;
                }
                if !throttled {
                    state.stats.throttled_requests += 1;
                    throttled = true;
                }
                if attempt + 1 == attempts {
                    warn!(
                        limiter = %self.name,
                        requested = tokens,
                        available = state.tokens,
                        "Rate limit exceeded"
                    );
                    return Admission::Denied {
                        available: state.tokens,
                    };
                }
                // A very low rate can ask for a wait no Duration can hold.
                Duration::try_from_secs_f64((wanted - state.tokens) / cps)
                    .map_or(self.config.retry_delay, |wait| wait.min(self.config.retry_delay))
            };

            debug!(
                limiter = %self.name,
                attempt = attempt + 1,
                delay_ms = wait.as_millis() as u64,
                "Waiting for tokens"
            );
            tokio::time::sleep(wait).await;
        }

        // Only reachable with zero attempts.
        let state = self.state.lock().await;
        Admission::Denied {
            available: state.tokens,
        }
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock().await;
        let stats = &state.stats;
        RateLimiterStats {
            total_requests: stats.total_requests,
            throttled_requests: stats.throttled_requests,
            throttle_rate: stats.throttle_rate(),
            current_tokens: state.tokens,
            burst_size: self.config.burst_size,
            mean_interval_secs: (stats.interval_count > 0)
                .then(|| stats.interval_total.as_secs_f64() / stats.interval_count as f64),
            window_secs: Instant::now()
                .saturating_duration_since(stats.started)
                .as_secs_f64(),
            throttle_warnings: state.throttle_warnings,
        }
    }

    /// Spawn the background task that watches the throttle ratio. Calling
    /// this while a monitor is running does nothing.
    pub async fn start_monitoring(&self) {
        let mut slot = self.monitor.lock().await;
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let state = self.state.clone();
        let config = self.config.clone();
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(config.monitor_interval) => {}
                }

                let mut state = state.lock().await;
                if state.stats.reset_if_elapsed(Instant::now(), config.stats_window) {
                    debug!(limiter = %name, "Reset rate limiter statistics window");
                    continue;
                }

                let rate = state.stats.throttle_rate();
                if state.stats.throttled_requests > 0 && rate > config.warn_throttle_ratio {
                    state.throttle_warnings += 1;
                    warn!(
                        limiter = %name,
                        "High throttle rate {:.1}%, consider adjusting rate limits",
                        rate * 100.0
                    );
                }
            }
        });

        info!(limiter = %self.name, "Rate limiter monitoring started");
        *slot = Some((token, handle));
    }

    pub async fn stop_monitoring(&self) {
        let taken = self.monitor.lock().await.take();
        if let Some((token, handle)) = taken {
            token.cancel();
            let _ = handle.await;
            debug!(limiter = %self.name, "Rate limiter monitoring stopped");
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some((token, _)) = self.monitor.get_mut().take() {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}
