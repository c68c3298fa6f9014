//! RPC server (spec §4.4): listens, authenticates, dispatches INVOKE to
//! registered module singletons, streams iterator results, broadcasts
//! pub/sub, and reaps clients that never complete the handshake.
//!
//! Each accepted connection gets its own reader/writer task over a
//! shared `ModuleRegistry` dispatch table, running the full
//! INVOKE/YIELD/RETURN/THROW state machine plus PING/PONG and
//! BROADCAST.

use crate::config::Config;
use crate::error::RelayError;
use crate::registry::ModuleRegistry;
use crate::singleton::{MethodOutcome, ReadyState, ServerIterator};
use crate::transport::{Listener, Transport};
use crate::wire::Frame;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// A server-side suspended invocation (spec §3 "Server-side Invocation").
struct Invocation {
    iterator: Box<dyn ServerIterator>,
}

/// Per-socket state tracked between handshake and close (spec §3
/// ConnectedClient).
struct ConnectedClient {
    client_id: String,
    outbound: mpsc::UnboundedSender<Frame>,
    last_active_ms: Arc<AtomicI64>,
}

/// The running RPC server (spec §3, §4.4).
pub struct RpcServer {
    config: Config,
    server_id: String,
    registry: Arc<ModuleRegistry>,
    clients: Arc<DashMap<String, ConnectedClient>>,
    /// Fired once, after `shutdown`'s grace delay, to force-destroy every
    /// still-connected socket (spec §4.4 "forces socket destruction of
    /// any still-connected client after a grace delay on close").
    force_close: tokio::sync::broadcast::Sender<()>,
}

impl RpcServer {
    pub fn new(config: Config, registry: Arc<ModuleRegistry>) -> Arc<Self> {
        let server_id = config.published_id();
        let (force_close, _) = tokio::sync::broadcast::channel(1);
        Arc::new(Self {
            config,
            server_id,
            registry,
            clients: Arc::new(DashMap::new()),
            force_close,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Bind and accept connections until the returned handle is dropped
    /// or `shutdown` is called. Runs module `init()` hooks sequentially
    /// before accepting (spec §4.4 "Lifecycle hooks", "On open").
    pub async fn listen(self: &Arc<Self>) -> Result<ServerHandle, RelayError> {
        self.registry.initialize_all().await;

        let listener = Listener::bind(&self.config.endpoint)
            .await
            .map_err(RelayError::Transport)?;

        let server = self.clone();
        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok(stream) => {
                                let server = server.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = server.handle_client(stream).await {
                                        tracing::debug!(error = %e, "client connection ended");
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "accept failed");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(ServerHandle { server: self.clone(), accept_task: Some(accept_task), shutdown_tx })
    }

    /// Authenticate and run the per-connection state machine until the
    /// socket closes (spec §4.4 "Handshake", "Dispatch state machine").
    async fn handle_client(self: &Arc<Self>, mut stream: Box<dyn Transport>) -> Result<(), RelayError> {
        if !self.config.secret.is_empty() {
            let mut buf = vec![0u8; self.config.secret.len()];
            match tokio::time::timeout(Duration::from_secs(1), stream.read_exact(&mut buf)).await {
                Ok(Ok(_)) if buf == self.config.secret.as_bytes() => {}
                _ => return Err(RelayError::Unauthorized),
            }
        }

        let mut framed = Framed::new(stream, crate::wire::FrameCodec::default());

        let client_id = match tokio::time::timeout(Duration::from_secs(1), framed.next()).await {
            Ok(Some(Ok(Frame::Handshake { client_id }))) => client_id,
            _ => return Err(RelayError::HandshakeMissing),
        };

        framed
            .send(Frame::Connect { server_id: self.server_id.clone() })
            .await?;

        let (mut sink, mut stream) = framed.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let last_active = Arc::new(AtomicI64::new(now_ms()));

        self.clients.insert(
            client_id.clone(),
            ConnectedClient {
                client_id: client_id.clone(),
                outbound: outbound_tx.clone(),
                last_active_ms: last_active.clone(),
            },
        );

        let invocations: Arc<DashMap<u64, Invocation>> = Arc::new(DashMap::new());
        let mut force_close = self.force_close.subscribe();

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
                            last_active.store(now_ms(), Ordering::Relaxed);
                            self.dispatch(frame, &outbound_tx, &invocations).await;
                        }
                        Some(Err(e)) => break Err(e),
                        None => break Ok(()),
                    }
                }
                _ = force_close.recv() => break Ok(()),
            }
        };

        self.clients.remove(&client_id);
        // Return every live iterator on close (spec §5 "Cancellation").
        for (_, mut invocation) in Arc::try_unwrap(invocations).unwrap_or_default().into_iter() {
            let _ = invocation.iterator.return_(Value::Null).await;
        }
        result
    }

    async fn dispatch(
        self: &Arc<Self>,
        frame: Frame,
        outbound: &mpsc::UnboundedSender<Frame>,
        invocations: &Arc<DashMap<u64, Invocation>>,
    ) {
        match frame {
            Frame::InvokeRequest { task_id, mod_name, method, args } => {
                self.dispatch_invoke(task_id, mod_name, method, args, outbound, invocations).await;
            }
            Frame::Yield { task_id, value } => {
                self.dispatch_step(task_id, StepKind::Yield, value, outbound, invocations).await;
            }
            Frame::Return { task_id, value } => {
                self.dispatch_step(task_id, StepKind::Return, value, outbound, invocations).await;
            }
            Frame::Throw { task_id, error } => {
                self.dispatch_step(task_id, StepKind::Throw, error, outbound, invocations).await;
            }
            Frame::Ping { .. } => {
                let _ = outbound.send(Frame::Pong);
            }
            // Any other frame before/after handshake on the server side
            // is unexpected; the connection is left to the caller's
            // outer loop to close on socket error instead of reacting.
            Frame::Handshake { .. } | Frame::Connect { .. } | Frame::Broadcast { .. } | Frame::InvokeAck { .. } | Frame::Pong => {}
        }
    }

    async fn dispatch_invoke(
        self: &Arc<Self>,
        task_id: u64,
        mod_name: String,
        method: String,
        args: Vec<Value>,
        outbound: &mpsc::UnboundedSender<Frame>,
        invocations: &Arc<DashMap<u64, Invocation>>,
    ) {
        let module = match self.registry.get(&mod_name) {
            Some(m) => m,
            None => {
                let _ = outbound.send(throw_frame(task_id, RelayError::Unavailable));
                return;
            }
        };
        if module.ready.get() != ReadyState::Ready {
            let _ = outbound.send(throw_frame(task_id, RelayError::Unavailable));
            return;
        }

        match module.singleton.call(&method, args).await {
            Ok(MethodOutcome::Value(value)) => {
                let _ = outbound.send(Frame::Return { task_id, value });
            }
            Ok(MethodOutcome::Iterator(mut iterator)) => {
                // A lazily-initiated generator's creating INVOKE carries no
                // step value (spec §4.5), but the generator body still runs
                // to its first yield the moment it's driven — so the ack
                // itself already carries that first `{value, done}` step
                // rather than a bare placeholder.
                match iterator.next(Value::Null).await {
                    Ok(step) => {
                        let record = serde_json::json!({"value": step.value, "done": step.done});
                        let done = step.done;
                        if !done {
                            invocations.insert(task_id, Invocation { iterator });
                        }
                        let _ = outbound.send(Frame::InvokeAck { task_id, value: record });
                    }
                    Err(e) => {
                        let _ = outbound.send(throw_frame(task_id, e));
                    }
                }
            }
            Err(e) => {
                let _ = outbound.send(throw_frame(task_id, e));
            }
        }
    }

    async fn dispatch_step(
        &self,
        task_id: u64,
        kind: StepKind,
        input: Value,
        outbound: &mpsc::UnboundedSender<Frame>,
        invocations: &Arc<DashMap<u64, Invocation>>,
    ) {
        let Some(mut entry) = invocations.get_mut(&task_id) else {
            let _ = outbound.send(throw_frame(task_id, RelayError::TaskNotFound(task_id)));
            return;
        };

        let step = match kind {
            StepKind::Yield => entry.iterator.next(input).await,
            StepKind::Return => entry.iterator.return_(input).await,
            StepKind::Throw => entry.iterator.throw(input).await,
        };
        drop(entry);

        match step {
            Ok(step) => {
                // A successful step always resolves normally, even one
                // driven by a client THROW the generator caught and
                // recovered from — THROW as a *reply* tag is reserved
                // for an error the client's receive loop must reject the
                // task with (spec §4.5 "On THROW: reject the task").
                let record = serde_json::json!({"value": step.value, "done": step.done});
                let frame = match kind {
                    StepKind::Yield => Frame::Yield { task_id, value: record },
                    StepKind::Return | StepKind::Throw => Frame::Return { task_id, value: record },
                };
                let _ = outbound.send(frame);
                if step.done {
                    invocations.remove(&task_id);
                }
            }
            Err(e) => {
                let _ = outbound.send(throw_frame(task_id, e));
                invocations.remove(&task_id);
            }
        }
    }

    /// `publish(topic, data, clients?)` (spec §4.4 "Pub/sub"). Returns
    /// whether at least one peer was reached.
    pub fn publish(&self, topic: impl Into<String>, data: Value, clients: Option<&[String]>) -> bool {
        let topic = topic.into();
        let mut reached = false;
        for entry in self.clients.iter() {
            if let Some(allow) = clients {
                if !allow.iter().any(|id| id == &entry.client_id) {
                    continue;
                }
            }
            if entry
                .outbound
                .send(Frame::Broadcast { topic: topic.clone(), data: data.clone() })
                .is_ok()
            {
                reached = true;
            }
        }
        reached
    }

    pub fn connected_client_ids(&self) -> Vec<String> {
        self.clients.iter().map(|e| e.client_id.clone()).collect()
    }
}

enum StepKind {
    Yield,
    Return,
    Throw,
}

fn throw_frame(task_id: u64, err: RelayError) -> Frame {
    let error = match crate::error::ThrownValue::from_relay_error(&err) {
        crate::error::ThrownValue::Value(v) => v,
        record @ crate::error::ThrownValue::Error(_) => {
            serde_json::to_value(record).unwrap_or(Value::Null)
        }
    };
    Frame::Throw { task_id, error }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Handle to a running listener; dropping or calling [`Self::shutdown`]
/// stops accepting new connections and runs every registered module's
/// `destroy()` concurrently (spec §4.4 "On close").
pub struct ServerHandle {
    server: Arc<RpcServer>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: mpsc::UnboundedSender<()>,
}

impl ServerHandle {
    pub fn server(&self) -> &Arc<RpcServer> {
        &self.server
    }

    /// Stop accepting, force-destroy any still-connected sockets after a
    /// grace delay, and run `destroy()` on every module (spec §4.4 "the
    /// server forces socket destruction of any still-connected client
    /// after a grace delay on close").
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        tokio::time::sleep(grace).await;

        let _ = self.server.force_close.send(());
        for _ in 0..100 {
            if self.server.clients.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.server.clients.clear();

        self.server.registry.destroy_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::singleton::ServiceSingleton;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ServiceSingleton for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        async fn call(&self, method: &str, args: Vec<Value>) -> Result<MethodOutcome, RelayError> {
            if method == "ping" {
                Ok(MethodOutcome::Value(json!("pong")))
            } else {
                Ok(MethodOutcome::Value(args.into_iter().next().unwrap_or(Value::Null)))
            }
        }
    }

    #[tokio::test]
    async fn publish_reports_whether_any_peer_was_reached() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(Arc::new(Echo));
        let server = RpcServer::new(Config::ipc("/tmp/relaylink-test.sock"), registry);
        assert!(!server.publish("topic", json!("x"), None));
    }
}
