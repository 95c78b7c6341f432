//! Per-view sync driver.
//!
//! A [`SyncContext`] wires one channel listener, an [`EventRouter`] and the
//! fallback pollers for a single view (the order list, one order, one chat)
//! onto the session's shared reconcilers, and tears all of it down through
//! [`SyncContext::close`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::notify::{LinkEvent, Notifier};
use super::poller::{FallbackPoller, PollOutcome, PollPolicy, SnapshotSource};
use super::reconcile::SharedReconciler;
use super::router::{AliasTable, EventRouter, RouteTargets, RouterConfig};
use super::state::{ContextEvent, ContextState};
use crate::logging::targets;
use crate::prelude::Result;
use crate::types::{ChatMessage, Order};
use crate::ws::{ListenerId, OutboundEvent, PushChannel};
use crate::Error;

pub struct ContextBuilder {
    name: String,
    channel: Arc<dyn PushChannel>,
    notifier: Notifier,
    targets: RouteTargets,
    join: Option<OutboundEvent>,
    order_source: Option<Arc<dyn SnapshotSource<Order>>>,
    message_source: Option<Arc<dyn SnapshotSource<ChatMessage>>>,
    aliases: AliasTable,
    router_config: RouterConfig,
    poll_policy: PollPolicy,
}

impl ContextBuilder {
    pub fn orders(mut self, orders: SharedReconciler<Order>) -> Self {
        self.targets.orders = Some(orders);
        self
    }

    pub fn messages(mut self, messages: SharedReconciler<ChatMessage>) -> Self {
        self.targets.messages = Some(messages);
        self
    }

    /// Room to join on start, left again on close.
    pub fn join(mut self, event: OutboundEvent) -> Self {
        self.join = Some(event);
        self
    }

    pub fn poll_orders(mut self, source: Arc<dyn SnapshotSource<Order>>) -> Self {
        self.order_source = Some(source);
        self
    }

    pub fn poll_messages(mut self, source: Arc<dyn SnapshotSource<ChatMessage>>) -> Self {
        self.message_source = Some(source);
        self
    }

    pub fn aliases(mut self, aliases: AliasTable) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn router_config(mut self, config: RouterConfig) -> Self {
        self.router_config = config;
        self
    }

    pub fn poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll_policy = policy;
        self
    }

    /// Register the listener, join the room and spawn the router and poller
    /// tasks. Must run inside a tokio runtime.
    pub async fn start(self) -> Result<SyncContext> {
        if self.order_source.is_some() && self.targets.orders.is_none() {
            return Err(Error::Config(format!("{}: order poller without an order store", self.name)));
        }
        if self.message_source.is_some() && self.targets.messages.is_none() {
            return Err(Error::Config(format!(
                "{}: message poller without a message store",
                self.name
            )));
        }

        let (state_tx, _) = watch::channel(ContextState::Uninitialized);
        let state = Arc::new(state_tx);
        advance(&state, &self.name, ContextEvent::Start);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));
        let router = Arc::new(Mutex::new(EventRouter::new(self.aliases, &self.router_config)));
        let health = self.channel.health();

        // subscribe before joining so nothing between the two is missed
        let mut listener = self.channel.listen();
        let link_rx = self.channel.link_events();

        if let Some(join) = &self.join {
            match self.channel.join(join.clone()).await {
                Ok(()) => advance(&state, &self.name, ContextEvent::ConnectSucceeded),
                Err(e) => {
                    warn!(target: targets::CONTEXT, context = %self.name, error = %e, "Join failed, relying on polling");
                    advance(&state, &self.name, ContextEvent::TransportFailed);
                }
            }
        } else if health.state().is_connected() {
            advance(&state, &self.name, ContextEvent::ConnectSucceeded);
        }

        let mut tasks = Vec::new();

        {
            let name = self.name.clone();
            let state = Arc::clone(&state);
            let closed = Arc::clone(&closed);
            let router = Arc::clone(&router);
            let route_targets = self.targets.clone();
            let notifier = self.notifier.clone();
            let mut shutdown = shutdown_rx.clone();
            let mut link_rx = link_rx;
            let mut link_open = true;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        event = listener.events.recv() => {
                            let Some(event) = event else {
                                debug!(target: targets::CONTEXT, context = %name, "Listener released");
                                break;
                            };
                            if closed.load(Ordering::Acquire) {
                                break;
                            }
                            let notifications = router
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .route(&event, &route_targets);
                            for n in notifications {
                                notifier.notify(n);
                            }
                        }
                        link = link_rx.recv(), if link_open => match link {
                            Ok(LinkEvent::Connected) => advance(&state, &name, ContextEvent::ConnectSucceeded),
                            Ok(LinkEvent::Disconnected) | Ok(LinkEvent::Degraded) => {
                                advance(&state, &name, ContextEvent::TransportFailed)
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                debug!(target: targets::CONTEXT, context = %name, skipped = n, "Link events lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => link_open = false,
                        },
                    }
                }
            }));
        }

        if let (Some(source), Some(target)) = (self.order_source, &self.targets.orders) {
            tasks.push(spawn_poller(
                FallbackPoller::new(
                    source,
                    target.clone(),
                    self.poll_policy.clone(),
                    health.clone(),
                    self.notifier.clone(),
                ),
                &self.name,
                &state,
                &shutdown_rx,
                self.channel.link_events(),
            ));
        }
        if let (Some(source), Some(target)) = (self.message_source, &self.targets.messages) {
            tasks.push(spawn_poller(
                FallbackPoller::new(
                    source,
                    target.clone(),
                    self.poll_policy.clone(),
                    health.clone(),
                    self.notifier.clone(),
                ),
                &self.name,
                &state,
                &shutdown_rx,
                self.channel.link_events(),
            ));
        }

        let initial = *state.borrow();
        info!(target: targets::CONTEXT, context = %self.name, state = %initial, "Sync context started");

        Ok(SyncContext {
            name: self.name,
            channel: self.channel,
            state,
            shutdown: shutdown_tx,
            closed,
            router,
            listener: Some(listener.id),
            join: self.join,
            tasks,
        })
    }
}

fn spawn_poller<E: super::Entity>(
    poller: FallbackPoller<E>,
    name: &str,
    state: &Arc<watch::Sender<ContextState>>,
    shutdown: &watch::Receiver<bool>,
    link_events: broadcast::Receiver<LinkEvent>,
) -> JoinHandle<()> {
    let name = name.to_string();
    let state = Arc::clone(state);
    tokio::spawn(poller.run(shutdown.clone(), link_events, move |outcome| {
        if let PollOutcome::Merged(_) = outcome {
            advance(&state, &name, ContextEvent::PollSucceeded);
        }
    }))
}

/// Apply `event` to the context state, ignoring events a closed context
/// cannot take.
fn advance(state: &watch::Sender<ContextState>, name: &str, event: ContextEvent) {
    state.send_if_modified(|current| match current.on(event) {
        Ok(next) if next != *current => {
            debug!(target: targets::CONTEXT, context = name, from = %current, to = %next, "Context transition");
            *current = next;
            true
        }
        Ok(_) | Err(Error::ContextClosed) => false,
        Err(e) => {
            debug!(target: targets::CONTEXT, context = name, error = %e, "Transition ignored");
            false
        }
    });
}

/// A running sync context. Dropping it closes it.
pub struct SyncContext {
    name: String,
    channel: Arc<dyn PushChannel>,
    state: Arc<watch::Sender<ContextState>>,
    shutdown: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
    router: Arc<Mutex<EventRouter>>,
    listener: Option<ListenerId>,
    join: Option<OutboundEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncContext {
    pub fn builder(
        name: impl Into<String>,
        channel: Arc<dyn PushChannel>,
        notifier: Notifier,
    ) -> ContextBuilder {
        ContextBuilder {
            name: name.into(),
            channel,
            notifier,
            targets: RouteTargets::default(),
            join: None,
            order_source: None,
            message_source: None,
            aliases: AliasTable::with_defaults(),
            router_config: RouterConfig::default(),
            poll_policy: PollPolicy::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ContextState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ContextState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Users currently typing in `chat_id`, as seen by this context.
    pub fn typing_in(&self, chat_id: &str) -> Vec<String> {
        self.router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .typing()
            .typing_in(chat_id)
    }

    /// Tear the context down: stop its tasks, release its listener and leave
    /// its room. Idempotent. Events arriving afterwards are dropped.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(id) = self.listener.take() {
            if let Err(e) = self.channel.release(id) {
                debug!(target: targets::CONTEXT, context = %self.name, error = %e, "Listener already released");
            }
        }
        if let Some(join) = self.join.take() {
            self.channel.forget(&join);
            if let (Some(leave), Ok(handle)) = (join.leave(), Handle::try_current()) {
                let channel = Arc::clone(&self.channel);
                handle.spawn(async move {
                    if let Err(e) = channel.emit(leave).await {
                        debug!(target: targets::CONTEXT, error = %e, "Leave not sent");
                    }
                });
            }
        }
        advance(&self.state, &self.name, ContextEvent::Teardown);
        info!(target: targets::CONTEXT, context = %self.name, "Sync context closed");
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        self.close();
    }
}
