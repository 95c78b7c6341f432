use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    spawn,
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        protocol,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::message_types::{Frame, OutboundEvent, PushEvent};
use super::{Listener, ListenerId, PushChannel};
use crate::{
    auth::Credentials,
    logging::targets,
    prelude::*,
    sync::{reconnect_with_backoff, ConnectionHealthMonitor, LinkEvent, ReconnectionConfig},
    Error,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, protocol::Message>;
type WsReader = SplitStream<WsStream>;
type AckSender = oneshot::Sender<Result<Value>>;

/// Push channel connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnection: ReconnectionConfig,
    /// Interval between application-level pings (default: 25s)
    pub ping_interval: Duration,
    /// No pong for this long forces a reconnect (default: 60s)
    pub pong_timeout: Duration,
    /// Default wait for a request acknowledgement (default: 5s)
    pub ack_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnection: ReconnectionConfig::default(),
            ping_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

/// Owns the single WebSocket connection to the storefront backend.
///
/// Holds no business state: inbound push frames are fanned out to listeners
/// untouched, lifecycle changes are broadcast as [`LinkEvent`]s.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    config: ConnectionConfig,
    health: ConnectionHealthMonitor,
    writer: Mutex<Option<WsWriter>>,
    /// Serializes `connect` so concurrent callers open one connection
    connecting: Mutex<()>,
    listeners: StdMutex<HashMap<ListenerId, mpsc::UnboundedSender<Arc<PushEvent>>>>,
    next_listener: AtomicU32,
    pending_acks: StdMutex<HashMap<u64, AckSender>>,
    next_request: AtomicU64,
    /// Join events replayed after every reconnect
    joined: StdMutex<Vec<OutboundEvent>>,
    link_tx: broadcast::Sender<LinkEvent>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    stop_flag: AtomicBool,
    started: Instant,
    /// Nanos since `started` of the last pong
    last_pong: AtomicU64,
}

impl ConnectionManager {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, ConnectionConfig::default())
    }

    pub fn with_config(url: impl Into<String>, config: ConnectionConfig) -> Self {
        let (link_tx, _) = broadcast::channel(32);
        let health = ConnectionHealthMonitor::with_config(config.reconnection.clone());
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                config,
                health,
                writer: Mutex::new(None),
                connecting: Mutex::new(()),
                listeners: StdMutex::new(HashMap::new()),
                next_listener: AtomicU32::new(1),
                pending_acks: StdMutex::new(HashMap::new()),
                next_request: AtomicU64::new(1),
                joined: StdMutex::new(Vec::new()),
                link_tx,
                tasks: StdMutex::new(Vec::new()),
                stop_flag: AtomicBool::new(false),
                started: Instant::now(),
                last_pong: AtomicU64::new(0),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub async fn is_open(&self) -> bool {
        self.inner.writer.lock().await.is_some()
    }

    /// Close the socket without tearing down, letting the reader task run
    /// its reconnect loop.
    pub async fn force_reconnect(&self) {
        info!(target: targets::CONNECTION, "Force reconnect requested");
        let mut writer = self.inner.writer.lock().await;
        if let Some(w) = writer.as_mut() {
            if let Err(err) = w.send(protocol::Message::Close(None)).await {
                warn!(target: targets::CONNECTION, "Error sending close frame: {err}");
            }
        }
    }

    async fn open(url: &str, token: &str) -> Result<WsStream> {
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::ws_connection(e.to_string()))?;
        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::ws_connection(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| Error::ws_connection(e.to_string()))?;
        Ok(stream)
    }
}

impl Inner {
    fn emit_link(&self, event: LinkEvent) {
        // no receivers is fine
        let _ = self.link_tx.send(event);
    }

    fn record_pong(&self) {
        let nanos = self.started.elapsed().as_nanos() as u64;
        self.last_pong.store(nanos, Ordering::Relaxed);
    }

    fn time_since_last_pong(&self) -> Duration {
        let last = self.last_pong.load(Ordering::Relaxed);
        let now = self.started.elapsed().as_nanos() as u64;
        Duration::from_nanos(now.saturating_sub(last))
    }

    fn dispatch(&self, event: PushEvent) {
        self.health.record_push();
        let event = Arc::new(event);
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|id, tx| match tx.send(Arc::clone(&event)) {
            Ok(()) => true,
            Err(_) => {
                debug!(target: targets::CONNECTION, listener = id, "Dropping listener with closed receiver");
                false
            }
        });
    }

    fn settle_ack(&self, frame: Frame) {
        let Some(request_id) = frame.ack else {
            return;
        };
        let sender = self
            .pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);
        let Some(sender) = sender else {
            warn!(target: targets::CONNECTION, request_id, "Ack for unknown request");
            return;
        };
        let result = match frame.error {
            Some(reason) => Err(Error::client_error(422, reason, None)),
            None => Ok(frame.data),
        };
        let _ = sender.send(result);
    }

    /// Fail every request still waiting for an ack so callers fall back
    /// immediately instead of waiting out the timeout.
    fn fail_pending(&self, reason: &str) {
        let drained: Vec<(u64, AckSender)> = self
            .pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !drained.is_empty() {
            warn!(target: targets::CONNECTION, count = drained.len(), reason, "Failing orphaned channel requests");
        }
        for (_, sender) in drained {
            let _ = sender.send(Err(Error::WsSend(reason.to_string())));
        }
    }

    fn handle_message(&self, message: protocol::Message) {
        match message {
            protocol::Message::Text(text) => {
                let frame = match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(target: targets::CONNECTION, error = %err, "Unparseable frame dropped");
                        return;
                    }
                };
                if frame.is_ack() {
                    self.settle_ack(frame);
                } else if frame.is_pong() {
                    self.record_pong();
                } else {
                    self.dispatch(PushEvent::from(frame));
                }
            }
            protocol::Message::Pong(_) => self.record_pong(),
            _ => {}
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let text = serde_json::to_string(frame).map_err(|e| Error::JsonParse(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;
        writer
            .send(protocol::Message::Text(text))
            .await
            .map_err(|e| Error::WsSend(e.to_string()))
    }

    async fn rejoin(&self) {
        let joined = self
            .joined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for event in joined {
            let result = match event.clone().into_frame(None) {
                Ok(frame) => self.send_frame(&frame).await,
                Err(e) => Err(e),
            };
            if let Err(err) = result {
                error!(target: targets::CONNECTION, ?event, "Could not rejoin: {err}");
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn abort_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }

    /// Install a freshly opened stream, start its reader and pinger and
    /// replay joins.
    async fn attach(self: &Arc<Self>, stream: WsStream, token: &str) {
        let (writer, reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        self.record_pong();
        self.health.record_connected();

        let reader_task = spawn(Arc::clone(self).run_reader(reader, token.to_string()));
        let ping_task = spawn(Arc::clone(self).run_pinger());
        self.track(reader_task);
        self.track(ping_task);

        self.rejoin().await;
        self.emit_link(LinkEvent::Connected);
    }

    /// Keep retrying a first connect that failed, with the same backoff as a
    /// dropped link.
    async fn retry_connect(self: Arc<Self>, token: String) {
        let url = self.url.clone();
        let outcome = reconnect_with_backoff(&self.health, || {
            let attempt = self.health.current_attempt();
            info!(target: targets::CONNECTION, attempt, "Retrying push channel connect");
            ConnectionManager::open(&url, &token)
        })
        .await;
        if self.stop_flag.load(Ordering::Relaxed) {
            return;
        }

        match outcome {
            Ok(stream) => {
                let _connecting = self.connecting.lock().await;
                if self.writer.lock().await.is_some() {
                    debug!(target: targets::CONNECTION, "Push channel opened elsewhere, dropping retry stream");
                    return;
                }
                self.attach(stream, &token).await;
                info!(target: targets::CONNECTION, url = %self.url, "Push channel connected after retry");
            }
            Err(err) => {
                error!(
                    target: targets::CONNECTION,
                    failures = self.health.consecutive_failures(),
                    "Connect attempts exhausted, link degraded: {err}"
                );
                self.emit_link(LinkEvent::Degraded);
            }
        }
    }

    async fn run_reader(self: Arc<Self>, mut reader: WsReader, token: String) {
        while !self.stop_flag.load(Ordering::Relaxed) {
            match reader.next().await {
                Some(Ok(message)) => {
                    self.handle_message(message);
                    continue;
                }
                Some(Err(err)) => {
                    warn!(target: targets::CONNECTION, "Push channel read error: {err}");
                }
                None => {
                    warn!(target: targets::CONNECTION, "Push channel closed by peer");
                }
            }

            if self.stop_flag.load(Ordering::Relaxed) {
                break;
            }
            self.writer.lock().await.take();
            self.fail_pending("Connection reset");
            self.health.record_lost();
            self.emit_link(LinkEvent::Disconnected);

            let url = self.url.clone();
            let outcome = reconnect_with_backoff(&self.health, || {
                let attempt = self.health.current_attempt();
                info!(target: targets::CONNECTION, attempt, "Reconnecting push channel");
                ConnectionManager::open(&url, &token)
            })
            .await;

            match outcome {
                Ok(stream) => {
                    if self.stop_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    let (new_writer, new_reader) = stream.split();
                    reader = new_reader;
                    *self.writer.lock().await = Some(new_writer);
                    self.record_pong();
                    self.rejoin().await;
                    info!(target: targets::CONNECTION, "Push channel reconnected");
                    self.emit_link(LinkEvent::Connected);
                }
                Err(err) => {
                    error!(
                        target: targets::CONNECTION,
                        failures = self.health.consecutive_failures(),
                        "Reconnect attempts exhausted, link degraded: {err}"
                    );
                    self.emit_link(LinkEvent::Degraded);
                    break;
                }
            }
        }
        debug!(target: targets::CONNECTION, "Push channel reader stopped");
    }

    async fn run_pinger(self: Arc<Self>) {
        let interval = self.config.ping_interval;
        let pong_timeout = self.config.pong_timeout;
        loop {
            time::sleep(interval).await;
            if self.stop_flag.load(Ordering::Relaxed) {
                break;
            }
            if !self.health.state().is_connected() {
                continue;
            }

            let since_pong = self.time_since_last_pong();
            if since_pong > pong_timeout {
                warn!(
                    target: targets::CONNECTION,
                    since_pong_secs = since_pong.as_secs_f64(),
                    "Pong timeout, forcing reconnect"
                );
                let mut writer = self.writer.lock().await;
                if let Some(w) = writer.as_mut() {
                    if let Err(err) = w.send(protocol::Message::Close(None)).await {
                        debug!(target: targets::CONNECTION, "Error sending close frame: {err}");
                    }
                }
                continue;
            }

            if let Err(err) = self.send_frame(&Frame::ping()).await {
                debug!(target: targets::CONNECTION, "Ping failed: {err}");
                continue;
            }
            let mut writer = self.writer.lock().await;
            if let Some(w) = writer.as_mut() {
                if let Err(err) = w.send(protocol::Message::Ping(Vec::new())).await {
                    debug!(target: targets::CONNECTION, "Protocol ping failed: {err}");
                }
            }
        }
    }
}

#[async_trait]
impl PushChannel for ConnectionManager {
    async fn connect(&self, credentials: &Credentials) -> Result<()> {
        let _connecting = self.inner.connecting.lock().await;
        if self.inner.writer.lock().await.is_some() {
            debug!(target: targets::CONNECTION, "Push channel already open");
            return Ok(());
        }

        self.inner.abort_tasks();
        self.inner.stop_flag.store(false, Ordering::Relaxed);
        self.inner.health.reset();

        let stream = match Self::open(&self.inner.url, &credentials.token).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: targets::CONNECTION, error = %e, "Push channel connect failed, retrying in background");
                self.inner.health.record_lost();
                let retry = spawn(Arc::clone(&self.inner).retry_connect(credentials.token.clone()));
                self.inner.track(retry);
                return Err(e);
            }
        };
        self.inner.attach(stream, &credentials.token).await;
        info!(target: targets::CONNECTION, url = %self.inner.url, "Push channel connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.stop_flag.store(true, Ordering::Relaxed);
        self.inner.health.mark_closed();
        self.inner.abort_tasks();

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(err) = writer.send(protocol::Message::Close(None)).await {
                debug!(target: targets::CONNECTION, "Error sending close frame: {err}");
            }
        }
        let released = {
            let mut listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let n = listeners.len();
            listeners.clear();
            n
        };
        self.inner
            .joined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner.fail_pending("Channel disconnected");
        info!(target: targets::CONNECTION, released, "Push channel disconnected");
        self.inner.emit_link(LinkEvent::Disconnected);
    }

    fn listen(&self) -> Listener {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        Listener { id, events: rx }
    }

    fn release(&self, id: ListenerId) -> Result<()> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::ListenerNotFound)
    }

    async fn emit(&self, event: OutboundEvent) -> Result<()> {
        let frame = event.into_frame(None)?;
        self.inner.send_frame(&frame).await
    }

    async fn request(&self, event: OutboundEvent, timeout: Duration) -> Result<Value> {
        let request_id = self.inner.next_request.fetch_add(1, Ordering::SeqCst);
        let frame = event.into_frame(Some(request_id))?;

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, tx);

        let forget = || {
            self.inner
                .pending_acks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&request_id);
        };

        debug!(target: targets::CONNECTION, request_id, event = %frame.event, "Sending channel request");
        if let Err(e) = self.inner.send_frame(&frame).await {
            forget();
            return Err(e);
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::WsSend("Ack channel closed".to_string())),
            Err(_) => {
                forget();
                Err(Error::AckTimeout {
                    request_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn join(&self, event: OutboundEvent) -> Result<()> {
        {
            let mut joined = self
                .inner
                .joined
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !joined.contains(&event) {
                joined.push(event.clone());
            }
        }
        self.emit(event).await
    }

    fn forget(&self, event: &OutboundEvent) {
        self.inner
            .joined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|e| e != event);
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.link_tx.subscribe()
    }

    fn health(&self) -> ConnectionHealthMonitor {
        self.inner.health.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.stop_flag.store(true, Ordering::Relaxed);
        self.inner.abort_tasks();
    }
}
