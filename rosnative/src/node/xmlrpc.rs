//! The slave XML-RPC server: answers master callbacks (`publisherUpdate`,
//! `paramUpdate`, `shutdown`) and peer control calls (`requestTopic`,
//! introspection) for one node.
//!
//! Every response is the ROS triple `[statusCode, statusMessage, value]`
//! with code 1 meaning success.

use super::actor::NodeServerHandle;
use abort_on_drop::ChildTask;
use hyper::{Body, Request, Response, StatusCode};
use log::*;
use rosnative_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde_xmlrpc::Value;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};

pub(crate) struct XmlRpcServer {
    port: u16,
    _server_task: ChildTask<hyper::Result<()>>,
}

impl XmlRpcServer {
    pub(crate) fn new(
        bind_addr: Ipv4Addr,
        port_range: Option<(u16, u16)>,
        node: NodeServerHandle,
    ) -> Result<XmlRpcServer> {
        let make_service = hyper::service::make_service_fn(move |_conn| {
            let node = node.clone();
            async move {
                Ok::<_, Infallible>(hyper::service::service_fn(move |request| {
                    let node = node.clone();
                    async move { Ok::<_, Infallible>(respond(node, request).await) }
                }))
            }
        });
        let builder = Self::bind(bind_addr, port_range)?;
        let server = builder.serve(make_service);
        let port = server.local_addr().port();
        debug!("Slave xmlrpc server listening on port {port}");
        Ok(XmlRpcServer {
            port,
            _server_task: tokio::spawn(server).into(),
        })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Binds within the configured port range, or an ephemeral port when no
    /// range was given.
    fn bind(
        bind_addr: Ipv4Addr,
        port_range: Option<(u16, u16)>,
    ) -> Result<hyper::server::Builder<hyper::server::conn::AddrIncoming>> {
        let Some((low, high)) = port_range else {
            return hyper::Server::try_bind(&SocketAddr::from((bind_addr, 0)))
                .map_err(|e| Error::Config(format!("failed to bind slave server: {e}")));
        };
        for port in low..=high {
            if let Ok(builder) = hyper::Server::try_bind(&SocketAddr::from((bind_addr, port))) {
                return Ok(builder);
            }
        }
        Err(Error::Config(format!(
            "no free slave server port in {low}..={high}"
        )))
    }
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

async fn respond(node: NodeServerHandle, request: Request<Body>) -> Response<Body> {
    let body = match hyper::body::to_bytes(request.into_body()).await {
        Ok(body) => body,
        Err(err) => {
            warn!("Failed to read slave api request body: {err}");
            return status_response(StatusCode::BAD_REQUEST);
        }
    };
    let body = match std::str::from_utf8(&body) {
        Ok(body) => body,
        Err(_) => return status_response(StatusCode::BAD_REQUEST),
    };
    let (method_name, params) = match serde_xmlrpc::request_from_str(body) {
        Ok(request) => request,
        Err(err) => {
            warn!("Failed to parse slave api request: {err}");
            return status_response(StatusCode::BAD_REQUEST);
        }
    };
    trace!("Slave api request: {method_name}");

    let value = match dispatch(&node, &method_name, params).await {
        Ok(value) => value,
        Err((code, message)) => {
            Value::Array(vec![Value::Int(code), Value::String(message), Value::Int(0)])
        }
    };
    match serde_xmlrpc::response_to_string(vec![value].into_iter()) {
        Ok(xml) => {
            let mut response = Response::new(Body::from(xml));
            response
                .headers_mut()
                .insert("Content-Type", hyper::header::HeaderValue::from_static("text/xml"));
            response
        }
        Err(err) => {
            error!("Failed to serialize slave api response: {err}");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn success(value: Value) -> Value {
    Value::Array(vec![Value::Int(1), Value::String(String::new()), value])
}

fn internal(err: Error) -> (i32, String) {
    (0, err.to_string())
}

fn param<T: DeserializeOwned>(
    params: &[Value],
    index: usize,
    name: &str,
) -> std::result::Result<T, (i32, String)> {
    let value = params
        .get(index)
        .cloned()
        .ok_or_else(|| (-1, format!("call is missing parameter: {name}")))?;
    serde_xmlrpc::from_value(value).map_err(|e| (-1, format!("invalid parameter {name}: {e}")))
}

fn pairs_to_value(pairs: Vec<(String, String)>) -> Value {
    Value::Array(
        pairs
            .into_iter()
            .map(|(name, datatype)| {
                Value::Array(vec![Value::String(name), Value::String(datatype)])
            })
            .collect(),
    )
}

async fn dispatch(
    node: &NodeServerHandle,
    method: &str,
    params: Vec<Value>,
) -> std::result::Result<Value, (i32, String)> {
    match method {
        "getMasterUri" => {
            let uri = node.get_master_uri().await.map_err(internal)?;
            Ok(success(Value::String(uri)))
        }
        "getPid" => Ok(success(Value::Int(std::process::id() as i32))),
        "getSubscriptions" => {
            let subscriptions = node.get_subscriptions().await.map_err(internal)?;
            Ok(success(pairs_to_value(subscriptions)))
        }
        "getPublications" => {
            let publications = node.get_publications().await.map_err(internal)?;
            Ok(success(pairs_to_value(publications)))
        }
        "paramUpdate" => {
            // The core carries no parameter client; acknowledge and move on
            Ok(success(Value::Int(0)))
        }
        "publisherUpdate" => {
            let topic: String = param(&params, 1, "topic")?;
            let publishers: Vec<String> = param(&params, 2, "publishers")?;
            node.publisher_update(topic, publishers).map_err(internal)?;
            Ok(success(Value::Int(0)))
        }
        "requestTopic" => {
            let topic: String = param(&params, 1, "topic")?;
            match node.request_topic(&topic).await.map_err(internal)? {
                Some((host, port)) => Ok(success(Value::Array(vec![
                    Value::String("TCPROS".to_string()),
                    Value::String(host),
                    Value::Int(i32::from(port)),
                ]))),
                None => Err((-1, format!("node does not publish topic {topic}"))),
            }
        }
        "shutdown" => {
            let reason: String = param(&params, 1, "msg").unwrap_or_default();
            info!("Shutdown requested over the slave api: {reason}");
            node.trigger_shutdown();
            Ok(success(Value::Int(0)))
        }
        "getBusStats" => Ok(success(Value::Array(vec![
            Value::Array(vec![]),
            Value::Array(vec![]),
            Value::Array(vec![]),
        ]))),
        "getBusInfo" => Ok(success(Value::Array(vec![]))),
        _ => Err((-1, format!("unknown method: {method}"))),
    }
}
