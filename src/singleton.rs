//! Service singletons: the readiness-gated, dispatch-by-name object a
//! `ModuleProxy` fronts (spec §3 `ServiceSingleton`, §4.3, §4.6).
//!
//! One trait, dispatch by method name, with a `readyState` lifecycle
//! marker and a return value that can be a plain value or an iterator.

use crate::error::RelayError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};

/// Readiness marker (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    NotReady = 0,
    Initiating = 1,
    Ready = 2,
    Destroying = 3,
}

impl ReadyState {
    fn from_u8(v: u8) -> ReadyState {
        match v {
            0 => ReadyState::NotReady,
            1 => ReadyState::Initiating,
            2 => ReadyState::Ready,
            _ => ReadyState::Destroying,
        }
    }
}

/// Atomic cell for a singleton's `readyState`, shared between the
/// server's lifecycle hook runner (§4.4) and the dispatch path that
/// gates `INVOKE` on it (§4.6).
#[derive(Debug, Default)]
pub struct ReadyCell(AtomicU8);

impl ReadyCell {
    pub fn new(state: ReadyState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ReadyState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for ReadyState {
    fn default() -> Self {
        ReadyState::NotReady
    }
}

/// A single `{value, done}` step of a server-side suspended iterator
/// (spec §4.4 YIELD/RETURN/THROW dispatch).
#[derive(Debug, Clone)]
pub struct IterStep {
    pub value: Value,
    pub done: bool,
}

impl IterStep {
    pub fn pending(value: Value) -> Self {
        Self { value, done: false }
    }

    pub fn done(value: Value) -> Self {
        Self { value, done: true }
    }
}

/// Server-side suspended iterator state for a streaming `INVOKE` (spec
/// §3 "Server-side Invocation", §4.4).
#[async_trait]
pub trait ServerIterator: Send {
    async fn next(&mut self, input: Value) -> Result<IterStep, RelayError>;
    async fn return_(&mut self, input: Value) -> Result<IterStep, RelayError>;
    async fn throw(&mut self, input: Value) -> Result<IterStep, RelayError>;
}

/// Result of dispatching a method call (spec §4.4 INVOKE handling).
pub enum MethodOutcome {
    /// A scalar or already-awaited value — replies `RETURN`.
    Value(Value),
    /// An iterator-like return — replies `INVOKE` (ack), then streams
    /// `YIELD`/`RETURN` as the client drives it.
    Iterator(Box<dyn ServerIterator>),
}

impl std::fmt::Debug for MethodOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodOutcome::Value(v) => write!(f, "MethodOutcome::Value({v})"),
            MethodOutcome::Iterator(_) => write!(f, "MethodOutcome::Iterator(..)"),
        }
    }
}

/// The one trait a registered module implements (spec §3 ServiceSingleton).
///
/// Mirrors `ServiceModule::handle_command` 1:1: dispatch by method name
/// over a JSON argument vector, with lifecycle hooks the server's open
/// and close sequence drive (spec §4.4 lifecycle hooks).
#[async_trait]
pub trait ServiceSingleton: Send + Sync {
    /// Dot-path module name this singleton is registered under.
    fn name(&self) -> &str;

    /// Invoke a method by name. `Err` becomes a THROW frame.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<MethodOutcome, RelayError>;

    /// Run once before the singleton is marked ready (spec §4.4 "On
    /// open"). Default: no-op, immediately ready.
    async fn init(&self) -> Result<(), RelayError> {
        Ok(())
    }

    /// Run on server close, concurrently with other singletons' destroy
    /// hooks (spec §4.4 "On close"). Default: no-op.
    async fn destroy(&self) -> Result<(), RelayError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_cell_round_trips_states() {
        let cell = ReadyCell::new(ReadyState::NotReady);
        assert_eq!(cell.get(), ReadyState::NotReady);
        cell.set(ReadyState::Initiating);
        assert_eq!(cell.get(), ReadyState::Initiating);
        cell.set(ReadyState::Ready);
        assert_eq!(cell.get(), ReadyState::Ready);
        cell.set(ReadyState::Destroying);
        assert_eq!(cell.get(), ReadyState::Destroying);
    }
}
