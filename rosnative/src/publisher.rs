use crate::node::NodeHandle;
use crate::spinner::{Batch, Spinner};
use crate::tcpros::{self, ConnectionHeader};
use crate::EndpointEvent;
use abort_on_drop::ChildTask;
use log::*;
use rosnative_common::{Error, Result, RosMessageType};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, RwLock};

/// The Publisher representation returned by calling advertise on a
/// [crate::NodeHandle].
pub struct Publisher<T> {
    topic: String,
    core: Arc<PublicationCore>,
    node: NodeHandle,
    phantom: PhantomData<T>,
}

impl<T: RosMessageType> Publisher<T> {
    pub(crate) fn new(topic: &str, core: Arc<PublicationCore>, node: NodeHandle) -> Self {
        Self {
            topic: topic.to_owned(),
            core,
            node,
            phantom: PhantomData,
        }
    }

    /// Sends a message to every connected subscriber.
    ///
    /// With a non-negative throttle the serialized bytes are queued on the
    /// spinner and this returns once they are queued; with a negative
    /// throttle the write to each subscriber happens before returning.
    pub async fn publish(&self, data: &T) -> Result<()> {
        let bytes = rosnative_serde_rosmsg::to_vec(data)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        debug!("Publishing data on topic {}", self.topic);
        self.core.publish(bytes).await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Subscribes to this publisher's lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<EndpointEvent> {
        self.core.events.subscribe()
    }

    /// Number of subscribers currently connected.
    pub async fn subscriber_count(&self) -> usize {
        self.core.subscribers.read().await.len()
    }

    /// Stops publishing and unregisters the topic from the master.
    pub async fn unadvertise(self) -> Result<()> {
        self.node.unadvertise(&self.topic).await
    }
}

struct SubscriberStream {
    stream: TcpStream,
    peer: String,
}

/// Shared state of one advertised topic.
///
/// Held by the node's server (which owns the lifecycle) and by every
/// [Publisher] handle for the topic.
pub(crate) struct PublicationCore {
    caller_id: String,
    topic: String,
    pub(crate) topic_type: String,
    md5sum: String,
    msg_definition: String,
    latching: bool,
    tcp_nodelay: bool,
    throttle_ms: i64,
    subscribers: RwLock<Vec<SubscriberStream>>,
    last_message: RwLock<Option<Arc<Vec<u8>>>>,
    pub(crate) events: broadcast::Sender<EndpointEvent>,
    spinner: Spinner,
    spinner_id: String,
    shutdown: AtomicBool,
}

/// One advertised topic, owned by the node's server task.
///
/// Dropping it cancels the fan-out task; [Publication::close] also closes
/// every subscriber socket.
pub(crate) struct Publication {
    core: Arc<PublicationCore>,
    _fanout_task: ChildTask<()>,
}

pub(crate) struct PublicationOptions {
    pub latching: bool,
    pub tcp_nodelay: bool,
    pub queue_size: usize,
    pub throttle_ms: i64,
}

impl Publication {
    pub(crate) fn new(
        caller_id: &str,
        topic: &str,
        topic_type: &str,
        md5sum: &str,
        msg_definition: &str,
        options: &PublicationOptions,
        spinner: Spinner,
    ) -> Publication {
        let spinner_id = format!("pub:{topic}");
        let (events, _) = broadcast::channel(16);
        let (sink, mut batches) = mpsc::unbounded_channel::<Batch>();
        let core = Arc::new(PublicationCore {
            caller_id: caller_id.to_owned(),
            topic: topic.to_owned(),
            topic_type: topic_type.to_owned(),
            md5sum: md5sum.to_owned(),
            msg_definition: msg_definition.to_owned(),
            latching: options.latching,
            tcp_nodelay: options.tcp_nodelay,
            throttle_ms: options.throttle_ms,
            subscribers: RwLock::new(Vec::new()),
            last_message: RwLock::new(None),
            events,
            spinner: spinner.clone(),
            spinner_id: spinner_id.clone(),
            shutdown: AtomicBool::new(false),
        });
        if options.throttle_ms >= 0 {
            spinner.register(
                &spinner_id,
                options.queue_size,
                options.throttle_ms as u64,
                sink,
            );
        }
        // Messages queued through the spinner are fanned out here so writes
        // to subscribers never block publish()
        let fanout_core = core.clone();
        let fanout_task = tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                for message in batch {
                    fanout_core.broadcast(&message).await;
                }
            }
        });
        Publication {
            core,
            _fanout_task: fanout_task.into(),
        }
    }

    pub(crate) fn core(&self) -> Arc<PublicationCore> {
        self.core.clone()
    }

    pub(crate) fn topic_type(&self) -> &str {
        &self.core.topic_type
    }

    /// Tears the publication down: no further publishes, spinner client
    /// removed, all subscriber sockets dropped.
    pub(crate) async fn close(&self) {
        self.core.shutdown.store(true, Ordering::SeqCst);
        self.core.spinner.deregister(&self.core.spinner_id);
        self.core.subscribers.write().await.clear();
    }
}

impl PublicationCore {
    async fn publish(&self, bytes: Vec<u8>) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if self.latching {
            *self.last_message.write().await = Some(Arc::new(bytes.clone()));
        }
        if self.throttle_ms < 0 {
            self.broadcast(&bytes).await;
        } else {
            self.spinner.ping(&self.spinner_id, bytes);
        }
        Ok(())
    }

    /// Writes the same serialized bytes to every connected subscriber.
    /// A failed write drops that subscriber only.
    async fn broadcast(&self, bytes: &[u8]) {
        let mut subscribers = self.subscribers.write().await;
        let mut dead = vec![];
        for (idx, subscriber) in subscribers.iter_mut().enumerate() {
            if let Err(err) = subscriber.stream.write_all(bytes).await {
                debug!(
                    "Failed to send data to subscriber {} on {}: {err}, removing",
                    subscriber.peer, self.topic
                );
                dead.push(idx);
            }
        }
        // Subtract the removed count to account for shifting indices after
        // each remove; indices are sorted by construction
        for (removed_count, idx) in dead.into_iter().enumerate() {
            let gone = subscribers.remove(idx - removed_count);
            let _ = self.events.send(EndpointEvent::Disconnect(gone.peer));
        }
    }

    /// Takes ownership of an inbound subscriber connection whose header has
    /// already been read off the socket.
    pub(crate) fn add_subscriber(self: &Arc<Self>, stream: TcpStream, header: ConnectionHeader) {
        let core = self.clone();
        tokio::spawn(async move {
            core.handshake_subscriber(stream, header).await;
        });
    }

    async fn handshake_subscriber(self: Arc<Self>, mut stream: TcpStream, header: ConnectionHeader) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(
            "Received connection from subscriber at {peer} for topic {}",
            self.topic
        );

        if let Err(reason) = self.validate_subscriber_header(&header) {
            warn!("Rejecting subscriber {peer} on {}: {reason}", self.topic);
            let _ = tcpros::write_error_header(&mut stream, &self.caller_id, &reason).await;
            return;
        }

        let response = ConnectionHeader {
            caller_id: self.caller_id.clone(),
            latching: self.latching,
            md5sum: Some(self.md5sum.clone()),
            msg_definition: self.msg_definition.clone(),
            topic: Some(self.topic.clone()),
            topic_type: self.topic_type.clone(),
            ..Default::default()
        };
        let response_bytes = match response.to_bytes(false) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Couldn't serialize connection header for {}: {err}", self.topic);
                return;
            }
        };
        if let Err(err) = stream.write_all(&response_bytes).await {
            debug!("Failed to respond to subscriber {peer}: {err}");
            return;
        }

        if header.tcp_nodelay || self.tcp_nodelay {
            if let Err(err) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for subscriber {peer}: {err}");
            }
        }

        // A latched topic replays the last message to every new subscriber
        if self.latching {
            let last_message = self.last_message.read().await.clone();
            if let Some(last_message) = last_message {
                debug!("Latched topic {}, sending last message to {peer}", self.topic);
                if let Err(err) = stream.write_all(&last_message).await {
                    error!("Failed to send latched message to subscriber {peer}: {err}");
                    return;
                }
            }
        }

        self.subscribers.write().await.push(SubscriberStream {
            stream,
            peer: peer.clone(),
        });
        let _ = self.events.send(EndpointEvent::Connection(peer));
    }

    fn validate_subscriber_header(
        &self,
        header: &ConnectionHeader,
    ) -> std::result::Result<(), String> {
        let Some(topic) = &header.topic else {
            return Err("connection header is missing field: topic".to_string());
        };
        if header.topic_type.is_empty() {
            return Err("connection header is missing field: type".to_string());
        }
        if header.md5sum.is_none() {
            return Err("connection header is missing field: md5sum".to_string());
        }
        if *topic != self.topic {
            return Err(format!(
                "topic mismatch: publishing {}, asked for {topic}",
                self.topic
            ));
        }
        if !tcpros::md5_compatible(&self.md5sum, header.md5sum.as_deref()) {
            return Err(format!(
                "md5sum mismatch for {}: expected {}, received {}",
                self.topic,
                self.md5sum,
                header.md5sum.as_deref().unwrap_or("<none>")
            ));
        }
        Ok(())
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        debug!("Dropping publication for topic {}", self.core.topic);
        self.core.shutdown.store(true, Ordering::SeqCst);
        self.core.spinner.deregister(&self.core.spinner_id);
    }
}
