//! Test support: a minimal in-process ROS master so the end-to-end suites
//! run hermetically, plus helpers for poking a node's slave API directly.

use hyper::{Body, Request, Response};
use serde_xmlrpc::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Registry {
    /// topic → xmlrpc URIs of its publishers
    publishers: HashMap<String, Vec<String>>,
    /// topic → xmlrpc URIs of its subscribers
    subscribers: HashMap<String, Vec<String>>,
    /// service → rosrpc URI
    services: HashMap<String, String>,
}

/// A just-enough master: registration bookkeeping and lookups, no
/// publisherUpdate callbacks (tests drive those directly where needed).
pub struct MasterStub {
    uri: String,
    registry: Arc<Mutex<Registry>>,
    server_task: tokio::task::JoinHandle<hyper::Result<()>>,
}

impl MasterStub {
    #[allow(dead_code)]
    pub async fn start() -> MasterStub {
        Self::start_on(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    #[allow(dead_code)]
    pub async fn start_on(addr: SocketAddr) -> MasterStub {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let registry_for_server = registry.clone();
        let make_service = hyper::service::make_service_fn(move |_conn| {
            let registry = registry_for_server.clone();
            async move {
                Ok::<_, Infallible>(hyper::service::service_fn(move |request| {
                    handle(registry.clone(), request)
                }))
            }
        });
        let server = hyper::Server::bind(&addr).serve(make_service);
        let uri = format!("http://127.0.0.1:{}/", server.local_addr().port());
        let server_task = tokio::spawn(server);
        MasterStub {
            uri,
            registry,
            server_task,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[allow(dead_code)]
    pub fn publishers_of(&self, topic: &str) -> Vec<String> {
        self.registry
            .lock()
            .unwrap()
            .publishers
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

impl Drop for MasterStub {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

async fn handle(
    registry: Arc<Mutex<Registry>>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let body = hyper::body::to_bytes(request.into_body()).await.unwrap();
    let body = std::str::from_utf8(&body).unwrap();
    let (method, params) = serde_xmlrpc::request_from_str(body).unwrap();
    let value = dispatch(&registry, &method, &params);
    let xml = serde_xmlrpc::response_to_string(vec![value].into_iter()).unwrap();
    Ok(Response::new(Body::from(xml)))
}

fn ok(value: Value) -> Value {
    Value::Array(vec![Value::Int(1), Value::String(String::new()), value])
}

fn fail(message: String) -> Value {
    Value::Array(vec![Value::Int(-1), Value::String(message), Value::Int(0)])
}

fn string_param(params: &[Value], index: usize) -> String {
    serde_xmlrpc::from_value(params[index].clone()).unwrap()
}

fn dispatch(registry: &Mutex<Registry>, method: &str, params: &[Value]) -> Value {
    let mut registry = registry.lock().unwrap();
    match method {
        "registerPublisher" => {
            let topic = string_param(params, 1);
            let caller_api = string_param(params, 3);
            let publishers = registry.publishers.entry(topic.clone()).or_default();
            if !publishers.contains(&caller_api) {
                publishers.push(caller_api);
            }
            let subscribers = registry
                .subscribers
                .get(&topic)
                .cloned()
                .unwrap_or_default();
            ok(Value::Array(
                subscribers.into_iter().map(Value::String).collect(),
            ))
        }
        "unregisterPublisher" => {
            let topic = string_param(params, 1);
            let caller_api = string_param(params, 2);
            if let Some(publishers) = registry.publishers.get_mut(&topic) {
                publishers.retain(|uri| uri != &caller_api);
            }
            ok(Value::Int(1))
        }
        "registerSubscriber" => {
            let topic = string_param(params, 1);
            let caller_api = string_param(params, 3);
            let subscribers = registry.subscribers.entry(topic.clone()).or_default();
            if !subscribers.contains(&caller_api) {
                subscribers.push(caller_api);
            }
            let publishers = registry.publishers.get(&topic).cloned().unwrap_or_default();
            ok(Value::Array(
                publishers.into_iter().map(Value::String).collect(),
            ))
        }
        "unregisterSubscriber" => {
            let topic = string_param(params, 1);
            let caller_api = string_param(params, 2);
            if let Some(subscribers) = registry.subscribers.get_mut(&topic) {
                subscribers.retain(|uri| uri != &caller_api);
            }
            ok(Value::Int(1))
        }
        "registerService" => {
            let service = string_param(params, 1);
            let service_api = string_param(params, 2);
            registry.services.insert(service, service_api);
            ok(Value::Int(1))
        }
        "unregisterService" => {
            let service = string_param(params, 1);
            registry.services.remove(&service);
            ok(Value::Int(1))
        }
        "lookupService" => {
            let service = string_param(params, 1);
            match registry.services.get(&service) {
                Some(uri) => ok(Value::String(uri.clone())),
                None => fail(format!("no provider for service {service}")),
            }
        }
        other => fail(format!("master stub does not implement {other}")),
    }
}

/// Drives a node's slave API the way the master would.
#[allow(dead_code)]
pub async fn send_publisher_update(slave_uri: &str, topic: &str, publishers: Vec<String>) {
    let body = serde_xmlrpc::request_to_string(
        "publisherUpdate",
        vec![
            serde_xmlrpc::to_value("/master").unwrap(),
            serde_xmlrpc::to_value(topic).unwrap(),
            serde_xmlrpc::to_value(publishers).unwrap(),
        ],
    )
    .unwrap();
    let response = reqwest::Client::new()
        .post(slave_uri)
        .body(body)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let (code, message, _): (i32, String, Value) =
        serde_xmlrpc::response_from_str(&response).unwrap();
    assert_eq!(code, 1, "publisherUpdate failed: {message}");
}

/// One-shot raw call against a slave API, for tests that exercise it
/// directly.
#[allow(dead_code)]
pub async fn call_slave(slave_uri: &str, method: &str, params: Vec<Value>) -> (i32, String, Value) {
    let body = serde_xmlrpc::request_to_string(method, params).unwrap();
    let response = reqwest::Client::new()
        .post(slave_uri)
        .body(body)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    serde_xmlrpc::response_from_str(&response).unwrap()
}
