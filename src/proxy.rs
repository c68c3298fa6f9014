//! Module proxy and router (spec §4.3): the namespaced handle callers
//! traverse to reach a service, whether it lives in this process or on
//! a remote server.
//!
//! Route selection and the same-process shortcut wrap a plain
//! dispatch-by-name lookup, extended with readiness filtering and
//! hash-mod-N selection across multiple remote stand-ins.

use crate::client::ClientInner;
use crate::error::RelayError;
use crate::registry::ModuleRegistry;
use crate::singleton::{MethodOutcome, ReadyCell, ReadyState, ServiceSingleton};
use crate::task::Task;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A method-only handle to a remote module on one connected server
/// (spec §3 RemoteStandIn). Cheap to clone: the network state lives in
/// the `ClientInner` behind the `Weak` reference.
pub struct RemoteStandIn {
    server_id: String,
    ready: Arc<ReadyCell>,
    client: Weak<ClientInner>,
}

impl RemoteStandIn {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready.get()
    }

    /// Invoke a method, returning a pending [`Task`] (spec §4.5
    /// "Per-call task proxy").
    pub fn invoke(&self, mod_name: &str, method: &str, args: Vec<Value>) -> Result<Task, RelayError> {
        let client = self.client.upgrade().ok_or(RelayError::Closed)?;
        Ok(client.new_task(mod_name, method, args))
    }
}

/// Either side of a routed call (spec §4.3 "Proxies are callable in
/// three ways"): a local singleton or a remote stand-in.
pub enum Callable {
    Local(Arc<dyn ServiceSingleton>),
    Remote(Arc<RemoteStandIn>),
}

impl Callable {
    /// Uniform single-shot call across both sides. Local iterator-like
    /// returns are surfaced as their first step's value only — full
    /// local iteration should go through the registry/singleton
    /// directly, the same way the server's own dispatch loop does.
    pub async fn call_value(&self, mod_name: &str, method: &str, args: Vec<Value>) -> Result<Value, RelayError> {
        match self {
            Callable::Local(singleton) => match singleton.call(method, args).await? {
                MethodOutcome::Value(v) => Ok(v),
                MethodOutcome::Iterator(mut it) => {
                    let step = it.next(Value::Null).await?;
                    Ok(step.value)
                }
            },
            Callable::Remote(stand_in) => stand_in.invoke(mod_name, method, args)?.call().await,
        }
    }
}

/// Back-reference to a server running in this process (spec §9
/// "Same-process detection").
struct LocalServer {
    server_id: String,
    registry: Arc<ModuleRegistry>,
}

/// Namespaced handle to a service class (spec §3 ModuleProxy).
///
/// Created once per module name and held for the process lifetime; a
/// proxy never tears down its local singleton once constructed (spec §3
/// invariant "constructed at most once per process lifetime").
pub struct ModuleProxy {
    name: String,
    // `OnceCell` enforces the spec §3 invariant directly: "a module-
    // proxy's local singleton is constructed at most once per process
    // lifetime" — a second `bind_local` is a no-op rather than a replace.
    local_singleton: once_cell::sync::OnceCell<Arc<dyn ServiceSingleton>>,
    remote: DashMap<String, Arc<RemoteStandIn>>,
    same_process: RwLock<Option<LocalServer>>,
    fallback_to_local: AtomicBool,
}

impl ModuleProxy {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            local_singleton: once_cell::sync::OnceCell::new(),
            remote: DashMap::new(),
            same_process: RwLock::new(None),
            fallback_to_local: AtomicBool::new(false),
        })
    }

    pub fn with_fallback_to_local(self: &Arc<Self>, fallback: bool) -> Arc<Self> {
        self.fallback_to_local.store(fallback, Ordering::Relaxed);
        self.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind the local singleton this proxy fronts (spec §4.3 clause 1:
    /// constructed at most once, via `getInstance()` or equivalent).
    pub fn bind_local(&self, singleton: Arc<dyn ServiceSingleton>) {
        let _ = self.local_singleton.set(singleton);
    }

    pub fn local(&self) -> Option<Arc<dyn ServiceSingleton>> {
        self.local_singleton.get().cloned()
    }

    /// Record that a server running in this process owns `server_id`
    /// (spec §9 same-process detection).
    pub fn attach_same_process_server(&self, server_id: impl Into<String>, registry: Arc<ModuleRegistry>) {
        *self.same_process.write() = Some(LocalServer { server_id: server_id.into(), registry });
    }

    pub(crate) fn install_stand_in(&self, server_id: String, ready: ReadyState, client: Weak<ClientInner>) {
        self.remote.insert(
            server_id.clone(),
            Arc::new(RemoteStandIn { server_id, ready: Arc::new(ReadyCell::new(ready)), client }),
        );
    }

    pub(crate) fn mark_stand_in_ready(&self, server_id: &str) {
        if let Some(s) = self.remote.get(server_id) {
            s.ready.set(ReadyState::Ready);
        }
    }

    pub(crate) fn mark_stand_in_not_ready(&self, server_id: &str) {
        if let Some(s) = self.remote.get(server_id) {
            s.ready.set(ReadyState::NotReady);
        }
    }

    pub(crate) fn remove_stand_in(&self, server_id: &str) {
        self.remote.remove(server_id);
    }

    /// Route selection (spec §4.3 "Route selection").
    pub fn route(&self, route: &Value) -> Result<Callable, RelayError> {
        if let Value::String(s) = route {
            if let Some(stand_in) = self.remote.get(s.as_str()) {
                if let Some(local) = self.local_for_same_process(&stand_in) {
                    return Ok(local);
                }
                return Ok(Callable::Remote(stand_in.clone()));
            }
        }

        let all: Vec<Arc<RemoteStandIn>> = self.remote.iter().map(|e| e.value().clone()).collect();
        let ready: Vec<&Arc<RemoteStandIn>> =
            all.iter().filter(|s| s.ready_state() == ReadyState::Ready).collect();

        let hash = crate::hash::route_hash(route);

        let selected = if ready.len() >= 2 {
            Some(ready[(hash % ready.len() as u64) as usize].clone())
        } else if ready.len() == 1 {
            Some(ready[0].clone())
        } else if !all.is_empty() {
            Some(all[(hash % all.len() as u64) as usize].clone())
        } else {
            None
        };

        match selected {
            Some(stand_in) => {
                if let Some(local) = self.local_for_same_process(&stand_in) {
                    Ok(local)
                } else {
                    Ok(Callable::Remote(stand_in))
                }
            }
            None => {
                if self.fallback_to_local.load(Ordering::Relaxed) {
                    self.local()
                        .map(Callable::Local)
                        .ok_or(RelayError::Unavailable)
                } else {
                    Err(RelayError::Unavailable)
                }
            }
        }
    }

    /// If the selected stand-in's server id belongs to a server running
    /// in this process, bypass the socket entirely (spec §4.3
    /// "Same-process shortcut").
    fn local_for_same_process(&self, stand_in: &Arc<RemoteStandIn>) -> Option<Callable> {
        let guard = self.same_process.read();
        let local_server = guard.as_ref()?;
        if local_server.server_id != stand_in.server_id() {
            return None;
        }
        let module = local_server.registry.get(&self.name)?;
        if module.ready.get() != ReadyState::Ready && !self.fallback_to_local.load(Ordering::Relaxed) {
            return None;
        }
        Some(Callable::Local(module.singleton.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ServiceSingleton for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        async fn call(&self, _method: &str, args: Vec<Value>) -> Result<MethodOutcome, RelayError> {
            Ok(MethodOutcome::Value(args.into_iter().next().unwrap_or(Value::Null)))
        }
    }

    #[test]
    fn route_falls_back_to_local_when_no_remotes_and_fallback_enabled() {
        let proxy = ModuleProxy::new("echo");
        proxy.bind_local(Arc::new(Echo));
        let proxy = proxy.with_fallback_to_local(true);
        assert!(matches!(proxy.route(&json!("anything")), Ok(Callable::Local(_))));
    }

    #[test]
    fn route_is_unavailable_with_no_remotes_and_no_fallback() {
        let proxy = ModuleProxy::new("echo");
        assert!(matches!(proxy.route(&json!("anything")), Err(RelayError::Unavailable)));
    }

    #[test]
    fn string_route_matching_a_server_id_is_direct() {
        let proxy = ModuleProxy::new("echo");
        proxy.install_stand_in("srv-a".into(), ReadyState::Ready, Weak::new());
        match proxy.route(&json!("srv-a")) {
            Ok(Callable::Remote(stand_in)) => assert_eq!(stand_in.server_id(), "srv-a"),
            _ => panic!("expected a direct remote match"),
        }
    }
}
