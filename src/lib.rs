//! Relaylink: an in-process distributed service framework providing
//! the RPC channel pair (server and client) and the module-proxy
//! router that sits above it — framing, handshake, request
//! correlation, streaming-iterator semantics, liveness, reconnection,
//! route selection, error marshalling, and lifecycle-aware dispatch.
//!
//! Module file loading/hot-reload, dependency injection, the on-disk
//! module layout, and codec plug-ins beyond the shipped JSON codec are
//! external collaborators this crate only defines interfaces for.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod hash;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod singleton;
pub mod task;
pub mod transport;
pub mod wire;

pub use client::RpcClient;
pub use config::{CodecKind, Config, Endpoint};
pub use error::{ErrorRecord, ErrorRegistry, RelayError, ThrownValue};
pub use proxy::{Callable, ModuleProxy, RemoteStandIn};
pub use registry::{ModuleLoader, ModuleRegistry};
pub use server::{RpcServer, ServerHandle};
pub use singleton::{IterStep, MethodOutcome, ReadyState, ServerIterator, ServiceSingleton};
pub use task::{Task, TaskIter};

/// Initialize `tracing` with an env-filter default the way the demo
/// binary and integration tests share (spec §2.1 ambient logging).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
