use crate::node::NodeHandle;
use crate::tcpros::{self, ConnectionHeader};
use log::*;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// The handle returned by advertising a service on a [crate::NodeHandle].
pub struct ServiceServer {
    service: String,
    node: NodeHandle,
}

impl ServiceServer {
    pub(crate) fn new(service: &str, node: NodeHandle) -> Self {
        Self {
            service: service.to_owned(),
            node,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// Stops serving and unregisters the service from the master.
    pub async fn unadvertise(self) -> rosnative_common::Result<()> {
        self.node.unadvertise_service(&self.service).await
    }
}

/// The type-erased request handler: takes a request body off the wire and
/// produces either a serialized response frame or an error message.
pub(crate) type ErasedHandler =
    Arc<dyn Fn(&[u8]) -> std::result::Result<Vec<u8>, String> + Send + Sync>;

/// One advertised service, owned by the node's server task.
pub(crate) struct ServiceEndpoint {
    core: Arc<ServiceEndpointCore>,
    connections: Vec<tokio::task::JoinHandle<()>>,
}

pub(crate) struct ServiceEndpointCore {
    caller_id: String,
    service: String,
    pub(crate) service_type: String,
    md5sum: String,
    handler: ErasedHandler,
}

impl ServiceEndpoint {
    pub(crate) fn new(
        caller_id: &str,
        service: &str,
        service_type: &str,
        md5sum: &str,
        handler: ErasedHandler,
    ) -> Self {
        Self {
            core: Arc::new(ServiceEndpointCore {
                caller_id: caller_id.to_owned(),
                service: service.to_owned(),
                service_type: service_type.to_owned(),
                md5sum: md5sum.to_owned(),
                handler,
            }),
            connections: Vec::new(),
        }
    }

    /// Takes ownership of an inbound client connection whose header has
    /// already been read off the socket.
    pub(crate) fn handle_client(&mut self, stream: TcpStream, header: ConnectionHeader) {
        self.connections.retain(|task| !task.is_finished());
        let core = self.core.clone();
        self.connections
            .push(tokio::spawn(client_task(core, stream, header)));
    }
}

impl Drop for ServiceEndpoint {
    fn drop(&mut self) {
        for task in &self.connections {
            task.abort();
        }
    }
}

async fn client_task(core: Arc<ServiceEndpointCore>, mut stream: TcpStream, header: ConnectionHeader) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    debug!(
        "Received connection from service client at {peer} for {}",
        core.service
    );

    let persistent = header.persistent;
    if let Err(reason) = validate_client_header(&core, &header) {
        warn!("Rejecting service client {peer} on {}: {reason}", core.service);
        let _ = tcpros::write_error_header(&mut stream, &core.caller_id, &reason).await;
        return;
    }

    let response = ConnectionHeader {
        caller_id: core.caller_id.clone(),
        md5sum: Some(core.md5sum.clone()),
        topic_type: core.service_type.clone(),
        ..Default::default()
    };
    let response_bytes = match response.to_bytes(true) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("Couldn't serialize connection header for {}: {err}", core.service);
            return;
        }
    };
    if stream.write_all(&response_bytes).await.is_err() {
        return;
    }

    loop {
        // One request per frame; a non-persistent client closes after one
        let request = match tcpros::read_frame(&mut stream).await {
            Ok(request) => request,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::UnexpectedEof {
                    debug!("Service client {peer} connection failed: {err}");
                }
                break;
            }
        };

        let result = {
            let handler = core.handler.clone();
            // User handler panics become error responses instead of taking
            // the connection task down
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&request))) {
                Ok(result) => result,
                Err(_) => Err(format!("service handler for {} panicked", core.service)),
            }
        };

        let write_result = match result {
            Ok(response_frame) => {
                // response_frame already carries its length prefix
                match stream.write_u8(1).await {
                    Ok(()) => stream.write_all(&response_frame).await,
                    Err(err) => Err(err),
                }
            }
            Err(message) => {
                debug!("Service {} handler failed: {message}", core.service);
                match stream.write_u8(0).await {
                    Ok(()) => tcpros::write_frame(&mut stream, message.as_bytes()).await,
                    Err(err) => Err(err),
                }
            }
        };
        if let Err(err) = write_result {
            debug!("Failed to write service response to {peer}: {err}");
            break;
        }
        if !persistent {
            break;
        }
    }
    debug!("Service client {peer} disconnected from {}", core.service);
}

fn validate_client_header(
    core: &ServiceEndpointCore,
    header: &ConnectionHeader,
) -> std::result::Result<(), String> {
    let Some(service) = &header.service else {
        return Err("connection header is missing field: service".to_string());
    };
    if *service != core.service {
        return Err(format!(
            "service mismatch: serving {}, asked for {service}",
            core.service
        ));
    }
    if !tcpros::md5_compatible(&core.md5sum, header.md5sum.as_deref()) {
        return Err(format!(
            "md5sum mismatch for {}: expected {}, received {}",
            core.service,
            core.md5sum,
            header.md5sum.as_deref().unwrap_or("<none>")
        ));
    }
    Ok(())
}
