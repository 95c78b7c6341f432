//! REST fallback polling.
//!
//! Re-fetches the canonical list for one context on an adaptive interval and
//! feeds it through the same reconciliation path as push events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::entity::{Entity, MergePolicy, MergeReport};
use super::notify::{LinkEvent, Notification, Notifier};
use super::reconcile::{lock, SharedReconciler};
use super::reconnection::{ConnectionHealthMonitor, LinkState};
use crate::logging::targets;
use crate::prelude::Result;

/// Where a poller gets its canonical list from.
#[async_trait]
pub trait SnapshotSource<E: Entity>: Send + Sync {
    /// Label used in logs and sync-loss notifications.
    fn name(&self) -> String;

    async fn fetch(&self) -> Result<Vec<E>>;

    fn policy(&self) -> MergePolicy;

    /// Local entities an authoritative response may remove.
    fn in_scope(&self, _entity: &E) -> bool {
        true
    }
}

/// Polling interval policy.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Interval while the push channel is connected (default: 15s)
    pub baseline: Duration,
    /// Interval while the push channel is down (default: 3s)
    pub degraded: Duration,
    /// Interval while pushes are flowing (default: 60s)
    pub relaxed: Duration,
    /// A push within this window counts as flowing (default: 30s)
    pub quiet_window: Duration,
    /// Consecutive failures before sync loss is surfaced (default: 3)
    pub failure_threshold: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            baseline: Duration::from_secs(15),
            degraded: Duration::from_secs(3),
            relaxed: Duration::from_secs(60),
            quiet_window: Duration::from_secs(30),
            failure_threshold: 3,
        }
    }
}

impl PollPolicy {
    pub fn next_interval(&self, link: LinkState, since_last_push: Option<Duration>) -> Duration {
        if !link.is_connected() {
            return self.degraded;
        }
        match since_last_push {
            Some(age) if age < self.quiet_window => self.relaxed,
            _ => self.baseline,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Merged(MergeReport),
    Failed { consecutive: u32 },
    /// The target store was closed; the poller stops.
    Detached,
}

pub struct FallbackPoller<E: Entity> {
    source: Arc<dyn SnapshotSource<E>>,
    target: SharedReconciler<E>,
    policy: PollPolicy,
    health: ConnectionHealthMonitor,
    notifier: Notifier,
    consecutive_failures: u32,
    sync_lost: bool,
}

impl<E: Entity> FallbackPoller<E> {
    pub fn new(
        source: Arc<dyn SnapshotSource<E>>,
        target: SharedReconciler<E>,
        policy: PollPolicy,
        health: ConnectionHealthMonitor,
        notifier: Notifier,
    ) -> Self {
        Self {
            source,
            target,
            policy,
            health,
            notifier,
            consecutive_failures: 0,
            sync_lost: false,
        }
    }

    pub fn next_interval(&self) -> Duration {
        self.policy
            .next_interval(self.health.state(), self.health.time_since_last_push())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Fetch once and merge.
    pub async fn poll_once(&mut self) -> PollOutcome {
        if lock(&self.target).is_closed() {
            return PollOutcome::Detached;
        }
        match self.source.fetch().await {
            Ok(batch) => {
                let source = Arc::clone(&self.source);
                let report = {
                    let mut rec = lock(&self.target);
                    if rec.is_closed() {
                        return PollOutcome::Detached;
                    }
                    rec.apply_batch(batch, source.policy(), |e| source.in_scope(e))
                };
                debug!(
                    target: targets::POLLER,
                    context = %self.source.name(),
                    inserted = report.inserted,
                    updated = report.updated,
                    removed = report.removed.len(),
                    "Poll merged"
                );
                self.consecutive_failures = 0;
                if self.sync_lost {
                    self.sync_lost = false;
                    info!(target: targets::POLLER, context = %self.source.name(), "Sync restored");
                    self.notifier.notify(Notification::SyncRestored {
                        context: self.source.name(),
                    });
                }
                PollOutcome::Merged(report)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    target: targets::POLLER,
                    context = %self.source.name(),
                    failures = self.consecutive_failures,
                    error = %e,
                    "Poll failed"
                );
                if !self.sync_lost && self.consecutive_failures >= self.policy.failure_threshold {
                    self.sync_lost = true;
                    self.notifier.notify(Notification::SyncLost {
                        context: self.source.name(),
                        consecutive_failures: self.consecutive_failures,
                    });
                }
                PollOutcome::Failed {
                    consecutive: self.consecutive_failures,
                }
            }
        }
    }

    /// Poll immediately, then on the adaptive interval until `shutdown`
    /// flips or the target is closed. Link changes re-evaluate the pending
    /// sleep so losing the channel shortens it at once.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut link_events: broadcast::Receiver<LinkEvent>,
        mut on_outcome: impl FnMut(&PollOutcome) + Send,
    ) {
        let mut link_open = true;
        'ticks: loop {
            if *shutdown.borrow() {
                break;
            }
            let outcome = self.poll_once().await;
            if outcome == PollOutcome::Detached {
                break;
            }
            on_outcome(&outcome);

            let ticked_at = Instant::now();
            let mut deadline = ticked_at + self.next_interval();
            loop {
                tokio::select! {
                    _ = time::sleep_until(deadline) => continue 'ticks,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'ticks;
                        }
                    }
                    event = link_events.recv(), if link_open => {
                        match event {
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                                deadline = ticked_at + self.next_interval();
                            }
                            Err(broadcast::error::RecvError::Closed) => link_open = false,
                        }
                    }
                }
            }
        }
        debug!(target: targets::POLLER, context = %self.source.name(), "Poller stopped");
    }
}
