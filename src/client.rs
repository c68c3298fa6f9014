//! RPC client (spec §4.5): dials a server, performs the handshake,
//! multiplexes concurrent requests by task id, manages liveness, and
//! reconnects with exponential backoff.
//!
//! Dials over a TCP-or-Unix `Transport`, then runs a receive loop that
//! demultiplexes replies by `taskId` instead of waiting on a single
//! outstanding command, plus the reconnect/liveness machinery a
//! dial-once-per-command client wouldn't need.

use crate::config::Config;
use crate::error::{ErrorRegistry, RelayError};
use crate::proxy::ModuleProxy;
use crate::singleton::ReadyState;
use crate::task::{Task, TaskSlot};
use crate::transport;
use crate::wire::{Frame, FrameCodec};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

type Handler = Box<dyn Fn(Value) + Send + Sync>;

/// Client-side state shared between the public handle and its
/// background tasks. Held behind an `Arc`; `RemoteStandIn`s hold only a
/// `Weak` reference so the client can be dropped while stand-ins are
/// still installed on module proxies (spec §3 RemoteStandIn lifecycle).
pub struct ClientInner {
    pub(crate) config: Config,
    client_id: String,
    server_id: RwLock<String>,
    connected: AtomicBool,
    closed: AtomicBool,
    next_task_id: AtomicU64,
    pub(crate) tasks: DashMap<u64, TaskSlot>,
    subscriptions: DashMap<String, Mutex<Vec<(u64, Handler)>>>,
    next_sub_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Frame>,
    last_active_ms: AtomicI64,
    error_registry: ErrorRegistry,
    modules: DashMap<String, Arc<ModuleProxy>>,
}

impl ClientInner {
    pub(crate) fn send(&self, frame: Frame) -> Result<(), RelayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::Closed);
        }
        self.outbound.send(frame).map_err(|_| RelayError::Closed)
    }

    pub(crate) fn alloc_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn server_id(&self) -> String {
        self.server_id.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn error_registry(&self) -> &ErrorRegistry {
        &self.error_registry
    }

    /// Build a pending task for a remote method call (used by
    /// `RemoteStandIn::call` — spec §4.3 route selection hands out a
    /// stand-in, not a raw client).
    pub(crate) fn new_task(
        self: &Arc<Self>,
        mod_name: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Task {
        let task_id = self.alloc_task_id();
        Task::new(self.clone(), task_id, mod_name.into(), method.into(), args)
    }

    fn touch(&self) {
        self.last_active_ms
            .store(now_ms(), Ordering::Relaxed);
    }

    fn mark_connected(&self, server_id: String) {
        *self.server_id.write() = server_id.clone();
        self.connected.store(true, Ordering::Release);
        for entry in self.modules.iter() {
            entry.value().mark_stand_in_ready(&server_id);
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        let server_id = self.server_id.read().clone();
        for entry in self.modules.iter() {
            entry.value().mark_stand_in_not_ready(&server_id);
        }
        self.fail_all_tasks(RelayError::Transport(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "channel disconnected",
        )));
    }

    fn fail_all_tasks(&self, _err: RelayError) {
        for (_, slot) in self.tasks.clone().into_iter() {
            match slot {
                TaskSlot::Single(tx) => {
                    let _ = tx.send(Err(RelayError::Closed));
                }
                TaskSlot::Stream(tx) => {
                    let _ = tx.send(Err(RelayError::Closed));
                }
            }
        }
        self.tasks.clear();
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Public handle to a running client channel (spec §3 RPC client).
pub struct RpcClient {
    inner: Arc<ClientInner>,
    supervisor: Option<tokio::task::JoinHandle<()>>,
}

impl RpcClient {
    /// Dial `config.endpoint` and block until `open()` resolves (spec
    /// §4.5 "Dial") or `config.timeout` elapses.
    pub async fn connect(config: Config) -> Result<Self, RelayError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            server_id: RwLock::new(config.endpoint.dsn()),
            config: config.clone(),
            client_id,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_task_id: AtomicU64::new(1),
            tasks: DashMap::new(),
            subscriptions: DashMap::new(),
            next_sub_id: AtomicU64::new(1),
            outbound: outbound_tx,
            last_active_ms: AtomicI64::new(now_ms()),
            error_registry: ErrorRegistry::new(),
            modules: DashMap::new(),
        });

        let (connect_tx, connect_rx) = tokio::sync::oneshot::channel();
        let supervisor = tokio::spawn(run_supervisor(
            inner.clone(),
            outbound_rx,
            Some(connect_tx),
        ));

        match tokio::time::timeout(config.timeout, connect_rx).await {
            Ok(Ok(Ok(()))) => Ok(RpcClient { inner, supervisor: Some(supervisor) }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => Err(RelayError::Timeout {
                module: "client".into(),
                method: "open".into(),
                humanized: crate::config::humanize(config.timeout),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        self.inner.client_id()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Register a module, installing a stand-in whose readiness starts
    /// `NotReady` and flips to `Ready` once the channel is connected
    /// (spec §4.5 "Pause/resume"). If the channel is already connected
    /// (the common case — `connect()` only returns once open), the
    /// stand-in is installed `Ready` immediately rather than waiting for
    /// a `CONNECT` that already happened.
    pub fn register(&self, module: Arc<ModuleProxy>) {
        let name = module.name().to_string();
        let ready = if self.inner.is_connected() { ReadyState::Ready } else { ReadyState::NotReady };
        module.install_stand_in(self.inner.server_id(), ready, Arc::downgrade(&self.inner));
        self.inner.modules.insert(name, module);
    }

    /// Remove this server's stand-ins from every registered module so
    /// routing picks other servers or falls back (spec §4.5).
    pub fn pause(&self) {
        for entry in self.inner.modules.iter() {
            entry.value().remove_stand_in(&self.inner.server_id());
        }
    }

    /// Re-install this server's stand-ins (spec §4.5).
    pub fn resume(&self) {
        let server_id = self.inner.server_id();
        let ready = if self.inner.is_connected() { ReadyState::Ready } else { ReadyState::NotReady };
        for entry in self.inner.modules.iter() {
            entry.value().install_stand_in(server_id.clone(), ready, Arc::downgrade(&self.inner));
        }
    }

    /// Create a pending task for a remote method call (spec §3 Task).
    pub(crate) fn call(&self, mod_name: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Task {
        self.inner.new_task(mod_name, method, args)
    }

    /// Subscribe a handler to a pub/sub topic (spec §3 Subscription).
    /// Returns an id usable with [`Self::unsubscribe`].
    pub fn subscribe(&self, topic: impl Into<String>, handler: impl Fn(Value) + Send + Sync + 'static) -> u64 {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .entry(topic.into())
            .or_default()
            .lock()
            .push((id, Box::new(handler)));
        id
    }

    pub fn unsubscribe(&self, topic: &str, id: u64) {
        if let Some(handlers) = self.inner.subscriptions.get(topic) {
            handlers.lock().retain(|(hid, _)| *hid != id);
        }
    }

    /// Close the channel: stops reconnecting, tears down the socket, and
    /// rejects every pending task (spec §5 "Cancellation").
    pub async fn close(mut self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.fail_all_tasks(RelayError::Closed);
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

/// Supervises dial → run → (on unexpected loss) exponential-backoff
/// redial, up to the 365-tick ceiling (spec §4.5 "Reconnect").
async fn run_supervisor(
    inner: Arc<ClientInner>,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
    mut first_connect: Option<tokio::sync::oneshot::Sender<Result<(), RelayError>>>,
) {
    const BACKOFF_CAP: Duration = Duration::from_secs(5);
    const MAX_TICKS: u32 = 365;
    let mut tick: u32 = 0;

    loop {
        if inner.closed.load(Ordering::Acquire) {
            return;
        }

        match dial_and_run(&inner, &mut outbound_rx, &mut first_connect).await {
            Ok(()) => {
                // Graceful: client explicitly closed mid-session.
                return;
            }
            Err(e) => {
                inner.mark_disconnected();
                if let Some(tx) = first_connect.take() {
                    let _ = tx.send(Err(e));
                    return;
                }
                tracing::warn!(error = %e, "channel lost, entering backoff");
            }
        }

        if inner.closed.load(Ordering::Acquire) {
            return;
        }

        tick += 1;
        if tick > MAX_TICKS {
            tracing::error!("client exhausted reconnect budget, closing permanently");
            inner.closed.store(true, Ordering::Release);
            return;
        }

        let delay = backoff_delay(tick, BACKOFF_CAP);
        tokio::time::sleep(delay).await;
    }
}

fn backoff_delay(tick: u32, cap: Duration) -> Duration {
    let base_ms = (2u64.saturating_pow(tick.min(12))).min(cap.as_millis() as u64);
    let jitter_ms = rand::random::<u64>() % (base_ms / 4 + 1);
    Duration::from_millis(base_ms + jitter_ms)
}

/// Dial once, run the handshake, then the receive/liveness loop until
/// the socket closes or an explicit close is requested. Returns `Ok(())`
/// only on an intentional close; any unexpected loss is an `Err`.
async fn dial_and_run(
    inner: &Arc<ClientInner>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Frame>,
    first_connect: &mut Option<tokio::sync::oneshot::Sender<Result<(), RelayError>>>,
) -> Result<(), RelayError> {
    let mut stream = transport::connect(&inner.config.endpoint)
        .await
        .map_err(RelayError::Transport)?;

    if !inner.config.secret.is_empty() {
        use tokio::io::AsyncWriteExt;
        stream
            .write_all(inner.config.secret.as_bytes())
            .await
            .map_err(RelayError::Transport)?;
    }

    let mut framed = Framed::new(stream, FrameCodec::default());
    framed
        .send(Frame::Handshake { client_id: inner.client_id.clone() })
        .await?;

    let server_id = match framed.next().await {
        Some(Ok(Frame::Connect { server_id })) => server_id,
        Some(Ok(_other)) => return Err(RelayError::Decode("expected CONNECT after handshake".into())),
        Some(Err(e)) => return Err(e),
        None => return Err(RelayError::Closed),
    };

    inner.mark_connected(server_id);
    inner.touch();
    if let Some(tx) = first_connect.take() {
        let _ = tx.send(Ok(()));
    }

    let (mut sink, mut stream) = framed.split();

    let liveness_inner = inner.clone();
    let (die_tx, mut die_rx) = mpsc::unbounded_channel::<()>();
    let liveness = tokio::spawn(async move {
        liveness_loop(liveness_inner, die_tx).await;
    });

    let result = loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(frame)) => {
                        inner.touch();
                        dispatch_incoming(inner, frame);
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Err(RelayError::Closed),
                }
            }
            _ = die_rx.recv() => {
                break Err(RelayError::Timeout {
                    module: "client".into(),
                    method: "liveness".into(),
                    humanized: crate::config::humanize(inner.config.timeout),
                });
            }
        }

        if inner.closed.load(Ordering::Acquire) {
            break Ok(());
        }
    };

    liveness.abort();
    result
}

/// Runs the PING + self-destruction timer (spec §4.5 "Liveness").
async fn liveness_loop(inner: Arc<ClientInner>, die_tx: mpsc::UnboundedSender<()>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let last = inner.last_active_ms.load(Ordering::Relaxed);
        let idle = now_ms() - last;
        if idle >= inner.config.ping_interval.as_millis() as i64 {
            if inner.send(Frame::Ping { client_id: inner.client_id.clone() }).is_err() {
                return;
            }
            let inner2 = inner.clone();
            let die_tx2 = die_tx.clone();
            let deadline_last_active = last;
            let timeout = inner.config.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if inner2.last_active_ms.load(Ordering::Relaxed) == deadline_last_active {
                    let _ = die_tx2.send(());
                }
            });
        }
    }
}

fn dispatch_incoming(inner: &Arc<ClientInner>, frame: Frame) {
    match frame {
        Frame::Connect { server_id } => inner.mark_connected(server_id),
        Frame::Broadcast { topic, data } => {
            if let Some(handlers) = inner.subscriptions.get(&topic) {
                let handlers = handlers.lock();
                for (_, handler) in handlers.iter() {
                    handler(data.clone());
                }
            }
        }
        // A scalar single-shot call resolves on either RETURN or, if the
        // method happened to return an iterator-like value, the INVOKE
        // ack itself (spec §4.5 "first `then`... resolves with the
        // server's reply"). A `.iter()`-driven call treats the same two
        // tags as the first non-terminal / terminal step.
        Frame::InvokeAck { task_id, value } => route_response(inner, task_id, Ok(value), false),
        Frame::Return { task_id, value } => route_response(inner, task_id, Ok(value), true),
        Frame::Yield { task_id, value } => route_response(inner, task_id, Ok(value), false),
        Frame::Throw { task_id, error } => {
            let thrown: crate::error::ThrownValue =
                serde_json::from_value(error.clone()).unwrap_or(crate::error::ThrownValue::Value(error));
            let err = thrown.into_relay_error(&inner.error_registry);
            route_response(inner, task_id, Err(err), true)
        }
        Frame::Pong => {}
        Frame::Handshake { .. } | Frame::Ping { .. } | Frame::InvokeRequest { .. } => {
            // Server-directed frames received by a client: ignore.
        }
    }
}

/// Parse a RETURN/YIELD payload that may be a raw scalar (a plain,
/// non-iterator method return) or an iterator step record `{value,
/// done}` (spec §4.4 "reply with the matching event tag and the
/// iterator's `{value, done}` record").
fn parse_iter_step(value: Value, default_done: bool) -> crate::singleton::IterStep {
    if let Value::Object(map) = &value {
        if map.len() == 2 {
            if let (Some(v), Some(Value::Bool(done))) = (map.get("value"), map.get("done")) {
                return crate::singleton::IterStep { value: v.clone(), done: *done };
            }
        }
    }
    crate::singleton::IterStep { value, done: default_done }
}

/// Route a resolved value/error to whichever slot shape `task_id` was
/// registered with. `return_like` is the default `done` for a Stream
/// task when the payload isn't already a tagged `{value, done}` record.
fn route_response(inner: &Arc<ClientInner>, task_id: u64, result: Result<Value, RelayError>, return_like: bool) {
    let is_single = matches!(inner.tasks.get(&task_id).as_deref(), Some(TaskSlot::Single(_)));

    if is_single {
        if let Some((_, TaskSlot::Single(tx))) = inner.tasks.remove(&task_id) {
            let _ = tx.send(result);
        }
        return;
    }

    let step_result = match result {
        Ok(value) => Ok(parse_iter_step(value, return_like)),
        Err(e) => Err(e),
    };
    let terminal = matches!(&step_result, Ok(step) if step.done) || step_result.is_err();

    let sender = if terminal {
        inner.tasks.remove(&task_id).and_then(|(_, slot)| match slot {
            TaskSlot::Stream(tx) => Some(tx),
            TaskSlot::Single(_) => None,
        })
    } else {
        inner.tasks.get(&task_id).and_then(|entry| match entry.value() {
            TaskSlot::Stream(tx) => Some(tx.clone()),
            TaskSlot::Single(_) => None,
        })
    };
    if let Some(tx) = sender {
        let _ = tx.send(step_result);
    }
}
