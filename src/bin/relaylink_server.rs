//! Demo relaylink server registering a `user` module (spec §8 concrete
//! scenarios) against a socket path or host:port, then blocking until
//! interrupted.
//!
//! Usage: `relaylink-server <socket-path-or-addr> [secret]`

use async_trait::async_trait;
use relaylink::{
    Config, ErrorRecord, IterStep, MethodOutcome, RelayError, RpcServer, ServerIterator,
    ServiceSingleton,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

struct GetFriendsIterator {
    remaining: std::collections::VecDeque<Value>,
    tail: Value,
}

#[async_trait]
impl ServerIterator for GetFriendsIterator {
    async fn next(&mut self, _input: Value) -> Result<IterStep, RelayError> {
        match self.remaining.pop_front() {
            Some(v) => Ok(IterStep::pending(v)),
            None => Ok(IterStep::done(self.tail.clone())),
        }
    }
    async fn return_(&mut self, input: Value) -> Result<IterStep, RelayError> {
        Ok(IterStep::done(input))
    }
    async fn throw(&mut self, input: Value) -> Result<IterStep, RelayError> {
        Err(RelayError::RemoteThrow(ErrorRecord::new("Error", input.to_string())))
    }
}

#[derive(Default)]
struct RepeatAfterMeIterator {
    started: bool,
}

#[async_trait]
impl ServerIterator for RepeatAfterMeIterator {
    async fn next(&mut self, input: Value) -> Result<IterStep, RelayError> {
        // The very first `.next()` on a freshly created generator discards
        // its argument and yields the initial (unset) value; every call
        // after that echoes straight back (spec §8 scenario 4).
        if !self.started {
            self.started = true;
            return Ok(IterStep::pending(Value::Null));
        }
        Ok(IterStep::pending(input))
    }
    async fn return_(&mut self, input: Value) -> Result<IterStep, RelayError> {
        Ok(IterStep::done(input))
    }
    async fn throw(&mut self, input: Value) -> Result<IterStep, RelayError> {
        Err(RelayError::RemoteThrow(ErrorRecord::new("Error", input.to_string())))
    }
}

struct User {
    name: String,
}

impl User {
    fn get_instance() -> Arc<Self> {
        Arc::new(User { name: "Mr. World".to_string() })
    }
}

#[async_trait]
impl ServiceSingleton for User {
    fn name(&self) -> &str {
        "user"
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<MethodOutcome, RelayError> {
        match method {
            "getName" => Ok(MethodOutcome::Value(json!(self.name))),
            "getFriends" => {
                let a = args.first().cloned().unwrap_or(Value::Null);
                let b = args.get(1).cloned().unwrap_or(Value::Null);
                let iterator = GetFriendsIterator {
                    remaining: ["Mozilla", "GitHub", "Linux"].iter().map(|s| json!(s)).collect(),
                    tail: json!([a, b]),
                };
                Ok(MethodOutcome::Iterator(Box::new(iterator)))
            }
            "repeatAfterMe" => Ok(MethodOutcome::Iterator(Box::new(RepeatAfterMeIterator::default()))),
            "userError" => Err(RelayError::RemoteThrow(ErrorRecord::new(
                "MyError",
                "something went wrong",
            ))),
            "userThrowValue" => {
                let value = args.into_iter().next().unwrap_or(json!("something went wrong"));
                Err(RelayError::RemoteThrowValue(value))
            }
            other => Err(RelayError::Other(format!("no such method: {other}"))),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    relaylink::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <socket-path-or-host:port> [secret]", args[0]);
        eprintln!("Example: {} /tmp/relaylink.sock", args[0]);
        std::process::exit(1);
    }

    let endpoint_arg = args[1].clone();
    let mut config = if let Some((host, port)) = endpoint_arg.split_once(':') {
        Config::tcp(host, port.parse()?)
    } else {
        Config::ipc(endpoint_arg.clone())
    };
    if let Some(secret) = args.get(2) {
        config = config.with_secret(secret.clone());
    }

    info!(endpoint = %config.endpoint.dsn(), "relaylink server starting");

    let registry = Arc::new(relaylink::ModuleRegistry::new());
    registry.register(User::get_instance());

    let server = RpcServer::new(config, registry);
    let handle = server.listen().await?;
    info!(server_id = %handle.server().server_id(), "relaylink server ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown(std::time::Duration::from_millis(500)).await;
    Ok(())
}
