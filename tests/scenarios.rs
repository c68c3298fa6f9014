//! End-to-end coverage of the concrete scenarios in spec §8, driven
//! against real `RpcServer`/`RpcClient` pairs over Unix domain sockets,
//! the same way `call_server_integration.rs` drives a real
//! `CallManager`/`VoiceOrchestrator` pair instead of mocking either side.

use async_trait::async_trait;
use relaylink::{
    Config, ErrorRecord, IterStep, MethodOutcome, ModuleProxy, RelayError, RpcClient, RpcServer,
    ServerIterator, ServiceSingleton,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct GetFriendsIterator {
    remaining: VecDeque<Value>,
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
    name: &'static str,
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
                Ok(MethodOutcome::Iterator(Box::new(GetFriendsIterator {
                    remaining: ["Mozilla", "GitHub", "Linux"].iter().map(|s| json!(s)).collect(),
                    tail: json!([a, b]),
                })))
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

fn socket_path(label: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/tmp/relaylink-test-{label}-{}-{}.sock", std::process::id(), n)
}

async fn start_server(path: &str, name: &'static str, secret: &str) -> Arc<relaylink::ServerHandle> {
    let registry = Arc::new(relaylink::ModuleRegistry::new());
    registry.register(Arc::new(User { name }));
    let mut config = Config::ipc(path);
    if !secret.is_empty() {
        config = config.with_secret(secret);
    }
    let server = RpcServer::new(config, registry);
    Arc::new(server.listen().await.expect("server binds"))
}

async fn connect_user(path: &str, secret: &str) -> (RpcClient, Arc<ModuleProxy>) {
    let mut config = Config::ipc(path).with_timeout(Duration::from_secs(2));
    if !secret.is_empty() {
        config = config.with_secret(secret);
    }
    let client = RpcClient::connect(config).await.expect("client connects");
    let proxy = ModuleProxy::new("user");
    client.register(proxy.clone());
    (client, proxy)
}

async fn call(proxy: &Arc<ModuleProxy>, method: &str, args: Vec<Value>) -> Result<Value, RelayError> {
    proxy.route(&json!("route"))?.call_value("user", method, args).await
}

#[tokio::test]
async fn scenario_1_get_name_returns_mr_world() {
    let path = socket_path("getname");
    let handle = start_server(&path, "Mr. World", "").await;
    let (_client, proxy) = connect_user(&path, "").await;

    let value = call(&proxy, "getName", vec![]).await.unwrap();
    assert_eq!(value, json!("Mr. World"));

    Arc::try_unwrap(handle).ok().unwrap().shutdown(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn scenario_2_bad_secret_rejects_open() {
    let path = socket_path("badsecret");
    let handle = start_server(&path, "Mr. World", "abcdefg").await;

    let config = Config::ipc(&path).with_secret("12345").with_timeout(Duration::from_millis(500));
    let result = RpcClient::connect(config).await;
    assert!(result.is_err(), "connecting with the wrong secret must reject open()");

    Arc::try_unwrap(handle).ok().unwrap().shutdown(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn scenario_3_get_friends_iterates_to_completion() {
    let path = socket_path("getfriends");
    let handle = start_server(&path, "Mr. World", "").await;
    let (_client, proxy) = connect_user(&path, "").await;

    let callable = proxy.route(&json!("route")).unwrap();
    let task = match callable {
        relaylink::Callable::Remote(stand_in) => stand_in
            .invoke("user", "getFriends", vec![json!("Open Source"), json!("Good Fella")])
            .unwrap(),
        relaylink::Callable::Local(_) => panic!("expected a remote stand-in"),
    };

    let mut iter = task.iter();
    let mut collected = Vec::new();
    loop {
        let step = iter.next(Value::Null).await.unwrap();
        collected.push(step.value.clone());
        if step.done {
            break;
        }
    }

    assert_eq!(
        collected,
        vec![json!("Mozilla"), json!("GitHub"), json!("Linux"), json!(["Open Source", "Good Fella"])]
    );

    Arc::try_unwrap(handle).ok().unwrap().shutdown(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn scenario_4_repeat_after_me_echoes_with_one_step_of_lag() {
    let path = socket_path("repeat");
    let handle = start_server(&path, "Mr. World", "").await;
    let (_client, proxy) = connect_user(&path, "").await;

    let callable = proxy.route(&json!("route")).unwrap();
    let task = match callable {
        relaylink::Callable::Remote(stand_in) => stand_in.invoke("user", "repeatAfterMe", vec![]).unwrap(),
        relaylink::Callable::Local(_) => panic!("expected a remote stand-in"),
    };

    let mut iter = task.iter();
    let first = iter.next(json!("Google")).await.unwrap();
    assert_eq!(first.value, Value::Null);
    assert!(!first.done);

    let second = iter.next(json!("Google")).await.unwrap();
    assert_eq!(second.value, json!("Google"));
    assert!(!second.done);

    Arc::try_unwrap(handle).ok().unwrap().shutdown(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn scenario_5_restart_while_connected_reconnects_to_new_server() {
    let path = socket_path("restart");
    let handle = start_server(&path, "Mr. World", "").await;
    let (client, proxy) = connect_user(&path, "").await;

    assert_eq!(call(&proxy, "getName", vec![]).await.unwrap(), json!("Mr. World"));

    Arc::try_unwrap(handle).ok().unwrap().shutdown(Duration::from_millis(10)).await;

    let handle2 = start_server(&path, "Mr. Handsome", "").await;

    let mut reconnected = false;
    for _ in 0..200 {
        if client.is_connected() {
            reconnected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reconnected, "client did not reconnect within the backoff budget");

    let value = call(&proxy, "getName", vec![]).await.unwrap();
    assert_eq!(value, json!("Mr. Handsome"));

    Arc::try_unwrap(handle2).ok().unwrap().shutdown(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn scenario_6_two_handlers_both_observe_broadcast_before_next() {
    let path = socket_path("pubsub");
    let handle = start_server(&path, "Mr. World", "").await;
    let (client, _proxy) = connect_user(&path, "").await;

    let seen_a = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_b = Arc::new(std::sync::Mutex::new(Vec::new()));
    let (seen_a2, seen_b2) = (seen_a.clone(), seen_b.clone());

    client.subscribe("set-data", move |data| seen_a2.lock().unwrap().push(data));
    client.subscribe("set-data", move |data| seen_b2.lock().unwrap().push(data));

    // Give the receive loop a moment to be ready, then publish once.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(handle.server().publish("set-data", json!("Mr. World"), None));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(seen_a.lock().unwrap().as_slice(), &[json!("Mr. World")]);
    assert_eq!(seen_b.lock().unwrap().as_slice(), &[json!("Mr. World")]);

    Arc::try_unwrap(handle).ok().unwrap().shutdown(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn scenario_7_custom_error_and_non_error_throw() {
    let path = socket_path("errors");
    let handle = start_server(&path, "Mr. World", "").await;
    let (_client, proxy) = connect_user(&path, "").await;

    match call(&proxy, "userError", vec![]).await {
        Err(RelayError::RemoteThrow(rec)) => {
            assert_eq!(rec.name, "MyError");
            assert_eq!(rec.message, "something went wrong");
        }
        other => panic!("expected a RemoteThrow(MyError), got {other:?}"),
    }

    match call(&proxy, "userThrowValue", vec![json!("something went wrong")]).await {
        Err(RelayError::RemoteThrowValue(v)) => {
            assert_eq!(v, json!("something went wrong"));
        }
        other => panic!("expected a verbatim non-Error throw, got {other:?}"),
    }

    let payload = json!({"code": 7});
    match call(&proxy, "userThrowValue", vec![payload.clone()]).await {
        Err(RelayError::RemoteThrowValue(v)) => {
            assert_eq!(v, payload);
        }
        other => panic!("expected a verbatim non-Error throw of a non-string value, got {other:?}"),
    }

    Arc::try_unwrap(handle).ok().unwrap().shutdown(Duration::from_millis(10)).await;
}
