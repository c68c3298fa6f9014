//! Client-side pending RPC exchange (spec §3 Task) and the
//! iterator-proxy duality (spec §9): a remote call is simultaneously
//! awaitable (single-shot) and iterable (multi-shot).
//!
//! A pending exchange is keyed by task id and resolved by whichever
//! resolver shape matches its call mode: a `oneshot` for a single-shot
//! await, an `mpsc` for a multi-shot iterator.

use crate::client::ClientInner;
use crate::config::humanize;
use crate::error::RelayError;
use crate::singleton::IterStep;
use crate::wire::Frame;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// What a pending task is waiting to be resolved by.
pub(crate) enum TaskSlot {
    Single(oneshot::Sender<Result<Value, RelayError>>),
    Stream(mpsc::UnboundedSender<Result<IterStep, RelayError>>),
}

/// A single pending RPC exchange (spec §3 Task).
///
/// Call [`Task::call`] to use it as a single-shot awaitable, or
/// [`Task::iter`] to use it as a multi-shot iterator. Only one of the
/// two may be used — both consume `self`.
pub struct Task {
    client: Arc<ClientInner>,
    task_id: u64,
    mod_name: String,
    method: String,
    args: Vec<Value>,
}

impl Task {
    pub(crate) fn new(
        client: Arc<ClientInner>,
        task_id: u64,
        mod_name: String,
        method: String,
        args: Vec<Value>,
    ) -> Self {
        Self { client, task_id, mod_name, method, args }
    }

    /// Single-shot await mode: sends `INVOKE`, resolves with the
    /// server's `RETURN` (or the `INVOKE` ack, if the method happened to
    /// return an iterator but the caller only awaited it once).
    pub async fn call(self) -> Result<Value, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.client.tasks.insert(self.task_id, TaskSlot::Single(tx));

        let sent = self.client.send(Frame::InvokeRequest {
            task_id: self.task_id,
            mod_name: self.mod_name.clone(),
            method: self.method.clone(),
            args: self.args.clone(),
        });
        if let Err(e) = sent {
            self.client.tasks.remove(&self.task_id);
            return Err(e);
        }

        let timeout = self.client.config.timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => {
                self.client.tasks.remove(&self.task_id);
                Err(RelayError::Timeout {
                    module: self.mod_name,
                    method: self.method,
                    humanized: humanize(timeout),
                })
            }
        }
    }

    /// Multi-shot iterator mode (spec §4.5 "Per-call task proxy").
    pub fn iter(self) -> TaskIter {
        TaskIter {
            client: self.client,
            task_id: self.task_id,
            mod_name: self.mod_name,
            method: self.method,
            args: self.args,
            initiated: AtomicBool::new(false),
            receiver: None,
            terminal: None,
        }
    }
}

/// The iterable side of a Task (spec §9 "Iterator-proxy duality").
///
/// Once terminal (a `done: true` step, or a thrown error), further calls
/// return the cached terminal value without hitting the network again.
pub struct TaskIter {
    client: Arc<ClientInner>,
    task_id: u64,
    mod_name: String,
    method: String,
    args: Vec<Value>,
    initiated: AtomicBool,
    receiver: Option<mpsc::UnboundedReceiver<Result<IterStep, RelayError>>>,
    terminal: Option<Result<IterStep, RelayError>>,
}

impl TaskIter {
    pub async fn next(&mut self, input: Value) -> Result<IterStep, RelayError> {
        self.step(Frame::Yield { task_id: self.task_id, value: input }).await
    }

    pub async fn return_value(&mut self, input: Value) -> Result<IterStep, RelayError> {
        self.step(Frame::Return { task_id: self.task_id, value: input }).await
    }

    pub async fn throw(&mut self, input: Value) -> Result<IterStep, RelayError> {
        self.step(Frame::Throw { task_id: self.task_id, error: input }).await
    }

    async fn step(&mut self, follow_up: Frame) -> Result<IterStep, RelayError> {
        if let Some(cached) = &self.terminal {
            return clone_step_result(cached);
        }

        if !self.initiated.swap(true, Ordering::AcqRel) {
            // Lazy INVOKE-on-first-step: the very first call to next/return/throw
            // sends the original INVOKE with the call's original args, not the
            // step input — the step input only matters from the second call on.
            let (tx, receiver) = mpsc::unbounded_channel();
            self.client.tasks.insert(self.task_id, TaskSlot::Stream(tx));
            self.receiver = Some(receiver);
            if let Err(e) = self.client.send(Frame::InvokeRequest {
                task_id: self.task_id,
                mod_name: self.mod_name.clone(),
                method: self.method.clone(),
                args: self.args.clone(),
            }) {
                self.client.tasks.remove(&self.task_id);
                self.terminal = Some(Err(clone_error(&e)));
                return Err(e);
            }
        } else if let Err(e) = self.client.send(follow_up) {
            self.terminal = Some(Err(clone_error(&e)));
            return Err(e);
        }

        let mut receiver = self.receiver.take().expect("iterator already initiated");
        let result = self.await_step(&mut receiver).await;
        self.receiver = Some(receiver);

        if let Ok(step) = &result {
            if step.done {
                self.client.tasks.remove(&self.task_id);
                self.terminal = Some(Ok(step.clone()));
            }
        } else if let Err(e) = &result {
            self.client.tasks.remove(&self.task_id);
            self.terminal = Some(Err(clone_error(e)));
        }
        result
    }

    async fn await_step(
        &self,
        rx: &mut mpsc::UnboundedReceiver<Result<IterStep, RelayError>>,
    ) -> Result<IterStep, RelayError> {
        let timeout = self.client.config.timeout;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(RelayError::Closed),
            Err(_) => Err(RelayError::Timeout {
                module: self.mod_name.clone(),
                method: self.method.clone(),
                humanized: humanize(timeout),
            }),
        }
    }
}

fn clone_step_result(r: &Result<IterStep, RelayError>) -> Result<IterStep, RelayError> {
    match r {
        Ok(step) => Ok(step.clone()),
        Err(e) => Err(clone_error(e)),
    }
}

fn clone_error(e: &RelayError) -> RelayError {
    match e {
        RelayError::Unavailable => RelayError::Unavailable,
        RelayError::Timeout { module, method, humanized } => RelayError::Timeout {
            module: module.clone(),
            method: method.clone(),
            humanized: humanized.clone(),
        },
        RelayError::Unauthorized => RelayError::Unauthorized,
        RelayError::HandshakeMissing => RelayError::HandshakeMissing,
        RelayError::TaskNotFound(id) => RelayError::TaskNotFound(*id),
        RelayError::RemoteThrow(rec) => RelayError::RemoteThrow(rec.clone()),
        RelayError::RemoteThrowValue(v) => RelayError::RemoteThrowValue(v.clone()),
        RelayError::Decode(s) => RelayError::Decode(s.clone()),
        RelayError::Closed => RelayError::Closed,
        RelayError::Other(s) => RelayError::Other(s.clone()),
        RelayError::Transport(e) => RelayError::Other(format!("transport error: {e}")),
    }
}
