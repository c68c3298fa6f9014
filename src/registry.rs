//! Server-side module registry (spec §4.4, §4.6) and the `ModuleLoader`
//! boundary (spec §6.2) — an external collaborator the core never calls
//! directly, kept here only as a stable name for embedding applications
//! to implement against.
//!
//! Modules register once, by name, and are routed to by that same name
//! on every incoming INVOKE.

use crate::singleton::{ReadyCell, ReadyState, ServiceSingleton};
use dashmap::DashMap;
use std::sync::Arc;

/// A registered singleton plus its readiness cell.
pub struct RegisteredModule {
    pub singleton: Arc<dyn ServiceSingleton>,
    pub ready: ReadyCell,
}

/// Name → singleton map the server dispatches `INVOKE` against.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: DashMap<String, Arc<RegisteredModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a singleton. Starts `NotReady` until the server's open
    /// sequence runs `init()` (spec §4.4).
    pub fn register(&self, singleton: Arc<dyn ServiceSingleton>) {
        let name = singleton.name().to_string();
        self.modules.insert(
            name,
            Arc::new(RegisteredModule {
                singleton,
                ready: ReadyCell::new(ReadyState::NotReady),
            }),
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredModule>> {
        self.modules.get(name).map(|e| e.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.iter().map(|e| e.key().clone()).collect()
    }

    pub fn all(&self) -> Vec<Arc<RegisteredModule>> {
        self.modules.iter().map(|e| e.value().clone()).collect()
    }

    /// Run every registered module's `init()` sequentially, marking
    /// `Initiating` then `Ready` around each call (spec §4.4 "On open").
    pub async fn initialize_all(&self) {
        for module in self.all() {
            module.ready.set(ReadyState::Initiating);
            if let Err(e) = module.singleton.init().await {
                tracing::error!(module = module.singleton.name(), error = %e, "module init failed");
                continue;
            }
            module.ready.set(ReadyState::Ready);
        }
    }

    /// Run every registered module's `destroy()` concurrently (spec §4.4
    /// "On close"). Errors are logged, never propagated.
    pub async fn destroy_all(&self) {
        let modules = self.all();
        let mut handles = Vec::with_capacity(modules.len());
        for module in modules {
            module.ready.set(ReadyState::Destroying);
            handles.push(tokio::spawn(async move {
                if let Err(e) = module.singleton.destroy().await {
                    tracing::error!(module = module.singleton.name(), error = %e, "module destroy failed");
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }
}

/// External collaborator (spec §6.2, out of scope): resolves a module
/// name to a loaded module given a file path. The core never calls this
/// directly — it exists so embedding applications (and a directory
/// watcher notifying on hot-reload) have a stable interface name.
pub trait ModuleLoader: Send + Sync {
    /// File extension(s) this loader resolves, e.g. `&["js"]` or
    /// `&["js", "mjs"]` (spec §6.2).
    fn extensions(&self) -> &[&str];

    /// Load the module backing `path` (without extension).
    fn load(&self, path: &str) -> Result<Arc<dyn ServiceSingleton>, String>;

    /// Drop any cached state for `path` (spec §6.2 directory-watcher
    /// hot-reload notification).
    fn unload(&self, _path: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::singleton::MethodOutcome;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Noop;

    #[async_trait]
    impl ServiceSingleton for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        async fn call(&self, _method: &str, _args: Vec<Value>) -> Result<MethodOutcome, RelayError> {
            Ok(MethodOutcome::Value(json!(null)))
        }
    }

    #[tokio::test]
    async fn register_then_initialize_marks_ready() {
        let registry = ModuleRegistry::new();
        registry.register(Arc::new(Noop));
        let entry = registry.get("noop").unwrap();
        assert_eq!(entry.ready.get(), ReadyState::NotReady);

        registry.initialize_all().await;
        let entry = registry.get("noop").unwrap();
        assert_eq!(entry.ready.get(), ReadyState::Ready);
    }

    #[tokio::test]
    async fn destroy_all_marks_destroying() {
        let registry = ModuleRegistry::new();
        registry.register(Arc::new(Noop));
        registry.initialize_all().await;
        registry.destroy_all().await;
        let entry = registry.get("noop").unwrap();
        assert_eq!(entry.ready.get(), ReadyState::Destroying);
    }
}
