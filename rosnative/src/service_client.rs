use crate::master_client::MasterClient;
use crate::tcpros::{self, ConnectionHeader};
use log::*;
use rosnative_common::{Error, Result, RosServiceType};
use std::collections::VecDeque;
use std::marker::PhantomData;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// The handle returned by creating a service client on a
/// [crate::NodeHandle].
///
/// Calls are queued FIFO; at most one is on the wire at any time. A
/// persistent client keeps its socket between calls, a non-persistent
/// client resolves and reconnects per call.
pub struct ServiceClient<T> {
    service: String,
    sender: mpsc::UnboundedSender<CallRequest>,
    phantom: PhantomData<T>,
}

impl<T: RosServiceType> ServiceClient<T> {
    pub(crate) fn new(service: &str, sender: mpsc::UnboundedSender<CallRequest>) -> Self {
        Self {
            service: service.to_owned(),
            sender,
            phantom: PhantomData,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// Calls the service and waits for its response.
    ///
    /// Fails with the server's error string if the handler failed, or with
    /// a queue overflow error if this call was displaced by newer ones.
    pub async fn call(&self, request: &T::Request) -> Result<T::Response> {
        let frame = rosnative_serde_rosmsg::to_vec(request)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let (reply, response) = oneshot::channel();
        self.sender
            .send(CallRequest { frame, reply })
            .map_err(|_| Error::ShuttingDown)?;
        let payload = response.await.map_err(|_| Error::ShuttingDown)??;
        rosnative_serde_rosmsg::from_slice_body(&payload)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

pub(crate) struct CallRequest {
    /// Serialized request including its length prefix.
    frame: Vec<u8>,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

pub(crate) struct ServiceClientConfig {
    pub caller_id: String,
    pub service: String,
    pub md5sum: String,
    pub persistent: bool,
    /// Bound on queued (not in-flight) calls; negative means unlimited.
    pub queue_length: i64,
}

/// The per-client link task owner; lives with the node's server task so
/// shutdown tears down in-flight calls.
pub(crate) struct ServiceClientLink {
    link_task: tokio::task::JoinHandle<()>,
}

impl ServiceClientLink {
    pub(crate) fn new(
        config: ServiceClientConfig,
        master: MasterClient,
    ) -> (Self, mpsc::UnboundedSender<CallRequest>) {
        let (sender, rx) = mpsc::unbounded_channel();
        let link_task = tokio::spawn(link_task(config, master, rx));
        (Self { link_task }, sender)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.link_task.is_finished()
    }
}

impl Drop for ServiceClientLink {
    fn drop(&mut self) {
        self.link_task.abort();
    }
}

fn push_bounded(queue: &mut VecDeque<CallRequest>, request: CallRequest, bound: i64) {
    queue.push_back(request);
    if bound >= 0 && queue.len() > bound as usize {
        // The oldest queued call gives way, never the one on the wire
        if let Some(dropped) = queue.pop_front() {
            let _ = dropped
                .reply
                .send(Err(Error::Unexpected(anyhow::anyhow!(
                    "service call dropped by queue overflow"
                ))));
        }
    }
}

async fn link_task(
    config: ServiceClientConfig,
    master: MasterClient,
    mut rx: mpsc::UnboundedReceiver<CallRequest>,
) {
    let mut queue: VecDeque<CallRequest> = VecDeque::new();
    let mut cached_stream: Option<TcpStream> = None;
    let mut handle_dropped = false;

    loop {
        if queue.is_empty() {
            if handle_dropped {
                break;
            }
            match rx.recv().await {
                Some(request) => queue.push_back(request),
                None => break,
            }
        }
        // Absorb anything else that arrived meanwhile before picking a head
        while let Ok(request) = rx.try_recv() {
            push_bounded(&mut queue, request, config.queue_length);
        }
        let Some(head) = queue.pop_front() else {
            continue;
        };

        let call = execute_call(&config, &master, &mut cached_stream, &head.frame);
        tokio::pin!(call);
        let outcome = loop {
            if handle_dropped {
                break (&mut call).await;
            }
            tokio::select! {
                outcome = &mut call => break outcome,
                request = rx.recv() => match request {
                    Some(request) => push_bounded(&mut queue, request, config.queue_length),
                    None => handle_dropped = true,
                },
            }
        };
        let _ = head.reply.send(outcome);
    }
    debug!("Service client link for {} closed", config.service);
}

async fn execute_call(
    config: &ServiceClientConfig,
    master: &MasterClient,
    cached_stream: &mut Option<TcpStream>,
    frame: &[u8],
) -> Result<Vec<u8>> {
    let mut stream = match cached_stream.take() {
        Some(stream) if config.persistent => stream,
        _ => connect(config, master).await?,
    };

    stream.write_all(frame).await?;
    let (ok, payload) = tcpros::read_service_response(&mut stream).await?;

    // Cache only a socket that just completed a round trip cleanly
    if config.persistent {
        *cached_stream = Some(stream);
    }

    if ok {
        Ok(payload)
    } else {
        Err(Error::ServerError(
            String::from_utf8_lossy(&payload).into_owned(),
        ))
    }
}

async fn connect(config: &ServiceClientConfig, master: &MasterClient) -> Result<TcpStream> {
    let service_uri = master.lookup_service(&config.service).await?;
    let (host, port) = parse_rosrpc_uri(&service_uri)?;
    debug!(
        "Connecting to service {} at {host}:{port}",
        config.service
    );
    let mut stream = TcpStream::connect((host, port)).await?;

    let header = ConnectionHeader {
        caller_id: config.caller_id.clone(),
        md5sum: Some(config.md5sum.clone()),
        service: Some(config.service.clone()),
        persistent: config.persistent,
        ..Default::default()
    };
    stream.write_all(&header.to_bytes(true)?).await?;

    let response = tcpros::read_header(&mut stream).await?;
    if let Some(error) = response.error {
        return Err(Error::ServerError(error));
    }
    if !tcpros::md5_compatible(&config.md5sum, response.md5sum.as_deref()) {
        return Err(Error::ServerError(format!(
            "md5sum mismatch from service {}: expected {}, received {:?}",
            config.service, config.md5sum, response.md5sum
        )));
    }
    Ok(stream)
}

fn parse_rosrpc_uri(uri: &str) -> Result<(String, u16)> {
    let remainder = uri.strip_prefix("rosrpc://").ok_or_else(|| {
        Error::ServerError(format!("master returned a non-rosrpc service uri: {uri}"))
    })?;
    let remainder = remainder.trim_end_matches('/');
    let (host, port) = remainder.rsplit_once(':').ok_or_else(|| {
        Error::ServerError(format!("service uri is missing a port: {uri}"))
    })?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::ServerError(format!("service uri has an invalid port: {uri}")))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rosrpc_uris_parse() {
        assert_eq!(
            parse_rosrpc_uri("rosrpc://127.0.0.1:45678").unwrap(),
            ("127.0.0.1".to_string(), 45678)
        );
        assert_eq!(
            parse_rosrpc_uri("rosrpc://robot-1:99/").unwrap(),
            ("robot-1".to_string(), 99)
        );
        assert!(parse_rosrpc_uri("http://127.0.0.1:45678").is_err());
        assert!(parse_rosrpc_uri("rosrpc://no-port").is_err());
    }

    #[tokio::test]
    async fn overflow_rejects_the_oldest_queued_call() {
        let mut queue = VecDeque::new();
        let mut replies = Vec::new();
        for n in 0..3 {
            let (reply, rx) = oneshot::channel();
            replies.push(rx);
            push_bounded(
                &mut queue,
                CallRequest {
                    frame: vec![n],
                    reply,
                },
                2,
            );
        }
        assert_eq!(queue.len(), 2);
        // The first call was displaced
        let dropped = replies.remove(0).await.unwrap();
        assert!(dropped
            .unwrap_err()
            .to_string()
            .contains("dropped by queue overflow"));
        assert_eq!(queue.front().unwrap().frame, vec![1]);
    }
}
