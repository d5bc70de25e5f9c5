use crate::master_client;
use crate::node::NodeHandle;
use crate::spinner::{Batch, Spinner};
use crate::tcpros::{self, ConnectionHeader};
use crate::EndpointEvent;
use abort_on_drop::ChildTask;
use log::*;
use rosnative_common::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

/// The Subscriber representation returned by calling subscribe on a
/// [crate::NodeHandle].
///
/// Messages are delivered to the callback given at subscribe time; the
/// handle is for lifecycle management and introspection.
pub struct Subscriber {
    topic: String,
    core: Arc<SubscriptionCore>,
    node: NodeHandle,
}

impl Subscriber {
    pub(crate) fn new(topic: &str, core: Arc<SubscriptionCore>, node: NodeHandle) -> Self {
        Self {
            topic: topic.to_owned(),
            core,
            node,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Subscribes to this subscriber's lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<EndpointEvent> {
        self.core.events.subscribe()
    }

    /// The publisher URIs this subscription currently holds connections to.
    pub async fn publisher_uris(&self) -> Result<Vec<String>> {
        self.node.subscription_publishers(&self.topic).await
    }

    /// Stops the subscription and unregisters it from the master.
    pub async fn unsubscribe(self) -> Result<()> {
        self.node.unsubscribe(&self.topic).await
    }
}

/// Shared state of one subscribed topic.
pub(crate) struct SubscriptionCore {
    caller_id: String,
    topic: String,
    topic_type: String,
    md5sum: String,
    tcp_nodelay: bool,
    throttle_ms: i64,
    spinner: Spinner,
    spinner_id: String,
    /// Decodes one wire payload and invokes the user callback.
    callback: Arc<dyn Fn(&[u8]) + Send + Sync>,
    pub(crate) events: broadcast::Sender<EndpointEvent>,
    dispatch: mpsc::UnboundedSender<Batch>,
}

/// One subscribed topic, owned by the node's server task.
///
/// Holds a reader task per connected publisher; dropping the subscription
/// cancels them all, which closes the sockets.
pub(crate) struct Subscription {
    core: Arc<SubscriptionCore>,
    connections: HashMap<String, tokio::task::JoinHandle<()>>,
    _dispatch_task: ChildTask<()>,
}

pub(crate) struct SubscriptionOptions {
    pub tcp_nodelay: bool,
    pub queue_size: usize,
    pub throttle_ms: i64,
}

impl Subscription {
    pub(crate) fn new(
        caller_id: &str,
        topic: &str,
        topic_type: &str,
        md5sum: &str,
        options: &SubscriptionOptions,
        callback: Arc<dyn Fn(&[u8]) + Send + Sync>,
        spinner: Spinner,
    ) -> Subscription {
        let spinner_id = format!("sub:{topic}");
        let (events, _) = broadcast::channel(16);
        let (dispatch, mut batches) = mpsc::unbounded_channel::<Batch>();
        if options.throttle_ms >= 0 {
            spinner.register(
                &spinner_id,
                options.queue_size,
                options.throttle_ms as u64,
                dispatch.clone(),
            );
        }
        let core = Arc::new(SubscriptionCore {
            caller_id: caller_id.to_owned(),
            topic: topic.to_owned(),
            topic_type: topic_type.to_owned(),
            md5sum: md5sum.to_owned(),
            tcp_nodelay: options.tcp_nodelay,
            throttle_ms: options.throttle_ms,
            spinner: spinner.clone(),
            spinner_id,
            callback,
            events,
            dispatch,
        });
        // All callback invocations happen on this one task, so user
        // callbacks are never re-entered no matter how many publishers feed
        // the topic
        let dispatch_core = core.clone();
        let dispatch_task = tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                for payload in batch {
                    (dispatch_core.callback)(&payload);
                }
            }
        });
        Subscription {
            core,
            connections: HashMap::new(),
            _dispatch_task: dispatch_task.into(),
        }
    }

    pub(crate) fn core(&self) -> Arc<SubscriptionCore> {
        self.core.clone()
    }

    pub(crate) fn topic_type(&self) -> &str {
        &self.core.topic_type
    }

    /// Reconciles the set of connections against a fresh publisher list:
    /// connects to new URIs, drops connections to URIs no longer present,
    /// and reconnects where a previous connection has died.
    pub(crate) fn update_publishers(&mut self, publisher_uris: &[String]) {
        self.connections.retain(|uri, task| {
            if publisher_uris.contains(uri) {
                true
            } else {
                debug!("Dropping connection to publisher {uri} for {}", self.core.topic);
                task.abort();
                false
            }
        });
        for uri in publisher_uris {
            let needs_connection = self
                .connections
                .get(uri)
                .map(|task| task.is_finished())
                .unwrap_or(true);
            if needs_connection {
                debug!("Opening connection to publisher {uri} for {}", self.core.topic);
                let task = tokio::spawn(connection_task(self.core.clone(), uri.clone()));
                self.connections.insert(uri.clone(), task);
            }
        }
    }

    /// URIs with a live reader task.
    pub(crate) fn publisher_uris(&self) -> Vec<String> {
        self.connections
            .iter()
            .filter(|(_, task)| !task.is_finished())
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    pub(crate) fn close(&mut self) {
        self.core.spinner.deregister(&self.core.spinner_id);
        for task in self.connections.values() {
            task.abort();
        }
        self.connections.clear();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.core.spinner.deregister(&self.core.spinner_id);
        for task in self.connections.values() {
            task.abort();
        }
    }
}

/// Connects to one publisher and feeds its frames into the subscription
/// until the socket ends or the task is cancelled.
async fn connection_task(core: Arc<SubscriptionCore>, publisher_uri: String) {
    // The publisher's slave API tells us where its TCPROS server lives
    let (host, port) =
        match master_client::request_topic(&publisher_uri, &core.caller_id, &core.topic).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(
                    "requestTopic on {publisher_uri} failed for {}: {err}",
                    core.topic
                );
                return;
            }
        };
    let mut stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(
                "Failed to connect to publisher at {host}:{port} for {}: {err}",
                core.topic
            );
            return;
        }
    };

    let header = ConnectionHeader {
        caller_id: core.caller_id.clone(),
        md5sum: Some(core.md5sum.clone()),
        topic: Some(core.topic.clone()),
        topic_type: core.topic_type.clone(),
        tcp_nodelay: core.tcp_nodelay,
        ..Default::default()
    };
    let header_bytes = match header.to_bytes(false) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("Couldn't serialize connection header for {}: {err}", core.topic);
            return;
        }
    };
    if let Err(err) = stream.write_all(&header_bytes).await {
        warn!("Failed to send connection header to {publisher_uri}: {err}");
        return;
    }

    // First thing back is the publisher's response header
    let response = match tcpros::read_header(&mut stream).await {
        Ok(response) => response,
        Err(err) => {
            warn!(
                "Failed to read publisher response header from {publisher_uri}: {err}"
            );
            return;
        }
    };
    if let Some(error) = response.error {
        // Stay disconnected until the next publisherUpdate names this
        // publisher again
        warn!(
            "Publisher {publisher_uri} rejected subscription to {}: {error}",
            core.topic
        );
        return;
    }
    if !tcpros::md5_compatible(&core.md5sum, response.md5sum.as_deref()) {
        warn!(
            "md5sum mismatch from publisher {publisher_uri} for {}: expected {}, received {:?}",
            core.topic, core.md5sum, response.md5sum
        );
        return;
    }

    let _ = core
        .events
        .send(EndpointEvent::Connection(publisher_uri.clone()));
    info!("Connected to publisher {publisher_uri} for {}", core.topic);

    loop {
        match tcpros::read_frame(&mut stream).await {
            Ok(payload) => {
                if core.throttle_ms < 0 {
                    // Bypass the spinner: straight to the dispatch task
                    let _ = core.dispatch.send(vec![payload]);
                } else {
                    core.spinner.ping(&core.spinner_id, payload);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Publisher {publisher_uri} closed {}", core.topic);
                break;
            }
            Err(err) => {
                debug!(
                    "Connection to publisher {publisher_uri} for {} failed: {err}",
                    core.topic
                );
                break;
            }
        }
    }
    let _ = core.events.send(EndpointEvent::Disconnect(publisher_uri));
}
