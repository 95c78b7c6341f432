//! Push channel link health and reconnection backoff.
//!
//! Provides:
//! - **Exponential backoff** with deterministic jitter between reconnect attempts
//! - **Link state** shared between the connection manager, pollers and contexts
//! - **Push freshness**: time since the last push frame, used to relax polling
//!
//! Times are measured on tokio's clock so paused-time tests drive them.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Reconnect behaviour of the push channel.
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    /// Delay before the first reconnect attempt (default: 1s)
    pub initial_delay: Duration,
    /// Cap on the delay between attempts (default: 30s)
    pub max_delay: Duration,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0-1.0, default: 0.2 = ±10% around the base)
    pub jitter_factor: f64,
    /// Consecutive failed attempts before the link is declared degraded
    /// (0 = never give up)
    pub max_reconnect_attempts: u32,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            max_reconnect_attempts: 8,
        }
    }
}

/// Link state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    /// Never connected
    Idle = 0,
    Connected = 1,
    /// Lost, reconnect attempts in progress
    Reconnecting = 2,
    /// Reconnect attempts exhausted; polling carries the sync
    Degraded = 3,
    /// Torn down on request
    Closed = 4,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LinkState::Connected,
            2 => LinkState::Reconnecting,
            3 => LinkState::Degraded,
            4 => LinkState::Closed,
            _ => LinkState::Idle,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Idle => write!(f, "idle"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Reconnecting => write!(f, "reconnecting"),
            LinkState::Degraded => write!(f, "degraded"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// Shared view of the push channel's health.
///
/// Cheap to clone; every clone observes the same state.
#[derive(Clone)]
pub struct ConnectionHealthMonitor {
    inner: Arc<HealthMonitorInner>,
}

struct HealthMonitorInner {
    config: ReconnectionConfig,
    state: AtomicU8,
    /// Nanos since `start_time` of the last push frame, 0 = never
    last_push: AtomicU64,
    has_pushed: AtomicBool,
    consecutive_failures: AtomicU64,
    current_attempt: AtomicU64,
    start_time: Instant,
}

impl ConnectionHealthMonitor {
    pub fn new() -> Self {
        Self::with_config(ReconnectionConfig::default())
    }

    pub fn with_config(config: ReconnectionConfig) -> Self {
        Self {
            inner: Arc::new(HealthMonitorInner {
                config,
                state: AtomicU8::new(LinkState::Idle as u8),
                last_push: AtomicU64::new(0),
                has_pushed: AtomicBool::new(false),
                consecutive_failures: AtomicU64::new(0),
                current_attempt: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &ReconnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.inner.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: LinkState) {
        self.inner.state.store(state as u8, Ordering::Relaxed);
    }

    /// Record a push frame from the server.
    pub fn record_push(&self) {
        let nanos = self.inner.start_time.elapsed().as_nanos() as u64;
        self.inner.last_push.store(nanos, Ordering::Relaxed);
        self.inner.has_pushed.store(true, Ordering::Relaxed);
    }

    /// Time since the last push frame, `None` if none arrived yet.
    pub fn time_since_last_push(&self) -> Option<Duration> {
        if !self.inner.has_pushed.load(Ordering::Relaxed) {
            return None;
        }
        let last = self.inner.last_push.load(Ordering::Relaxed);
        let now = self.inner.start_time.elapsed().as_nanos() as u64;
        Some(Duration::from_nanos(now.saturating_sub(last)))
    }

    pub fn record_connected(&self) {
        self.inner.current_attempt.store(0, Ordering::Relaxed);
        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
        self.set_state(LinkState::Connected);
    }

    /// The link dropped; reconnect attempts follow.
    pub fn record_lost(&self) {
        if self.state() != LinkState::Closed {
            self.set_state(LinkState::Reconnecting);
        }
    }

    pub fn start_reconnection(&self) {
        self.set_state(LinkState::Reconnecting);
        self.inner.current_attempt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnection_success(&self) {
        self.record_connected();
    }

    /// Record a failed attempt. Returns `false` once the attempt budget is
    /// spent, leaving the link degraded.
    pub fn reconnection_failed(&self) -> bool {
        let failures = self
            .inner
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        let max = self.inner.config.max_reconnect_attempts;
        if max > 0 && failures >= u64::from(max) {
            self.set_state(LinkState::Degraded);
            return false;
        }
        true
    }

    /// Mark the link degraded without spending the attempt budget.
    pub fn mark_degraded(&self) {
        self.set_state(LinkState::Degraded);
    }

    pub fn mark_closed(&self) {
        self.set_state(LinkState::Closed);
    }

    /// Delay before the next reconnect attempt.
    pub fn next_reconnection_delay(&self) -> Duration {
        let attempt = self.inner.current_attempt.load(Ordering::Relaxed) as u32;
        calculate_backoff_delay(
            attempt.saturating_sub(1),
            self.inner.config.initial_delay,
            self.inner.config.max_delay,
            self.inner.config.backoff_multiplier,
            self.inner.config.jitter_factor,
        )
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.inner.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn current_attempt(&self) -> u64 {
        self.inner.current_attempt.load(Ordering::Relaxed)
    }

    /// Clear failure counters ahead of a manual connect.
    pub fn reset(&self) {
        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
        self.inner.current_attempt.store(0, Ordering::Relaxed);
        self.set_state(LinkState::Idle);
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            state: self.state(),
            secs_since_last_push: self.time_since_last_push().map(|d| d.as_secs_f64()),
            consecutive_failures: self.consecutive_failures(),
            current_attempt: self.current_attempt(),
        }
    }
}

impl Default for ConnectionHealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time health snapshot, printed by the `status` command.
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub state: LinkState,
    pub secs_since_last_push: Option<f64>,
    pub consecutive_failures: u64,
    pub current_attempt: u64,
}

/// Exponential backoff delay with jitter.
///
/// `attempt` is 0-based. Jitter alternates above and below the base by half
/// the factor so the sequence is reproducible.
pub fn calculate_backoff_delay(
    attempt: u32,
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
) -> Duration {
    let base_secs = initial.as_secs_f64() * multiplier.powi(attempt as i32);
    let capped_secs = base_secs.min(max.as_secs_f64());

    let jitter_factor = if attempt.is_multiple_of(2) {
        1.0 + jitter * 0.5
    } else {
        1.0 - jitter * 0.5
    };
    Duration::from_secs_f64((capped_secs * jitter_factor).max(0.0))
}

/// Run `connect_fn` until it succeeds or the attempt budget is spent,
/// sleeping the backoff delay before each attempt.
pub async fn reconnect_with_backoff<F, Fut, T, E>(
    monitor: &ConnectionHealthMonitor,
    mut connect_fn: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
{
    monitor.start_reconnection();

    loop {
        tokio::time::sleep(monitor.next_reconnection_delay()).await;

        match connect_fn().await {
            Ok(value) => {
                monitor.reconnection_success();
                return Ok(value);
            }
            Err(e) => {
                if !monitor.reconnection_failed() {
                    return Err(e);
                }
                monitor.start_reconnection();
            }
        }
    }
}
