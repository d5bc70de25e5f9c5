//! The node server: a single task owning every publication, subscription,
//! service endpoint, and service client link of the node, reached through
//! [NodeServerHandle] messages.
//!
//! Keeping all shared maps on one task is what lets peer callbacks and the
//! slave API hold only topic/service names rather than references into the
//! endpoint structures.

use crate::master_client::MasterClient;
use crate::names::Name;
use crate::node::xmlrpc::XmlRpcServer;
use crate::publisher::{Publication, PublicationCore, PublicationOptions};
use crate::service_client::{CallRequest, ServiceClientConfig, ServiceClientLink};
use crate::service_server::{ErasedHandler, ServiceEndpoint};
use crate::spinner::Spinner;
use crate::subscriber::{Subscription, SubscriptionCore, SubscriptionOptions};
use crate::tcpros::{self, ConnectionHeader};
use abort_on_drop::ChildTask;
use log::*;
use rosnative_common::{Error, Result};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

pub(crate) enum NodeMsg {
    RegisterPublisher {
        topic: String,
        topic_type: String,
        md5sum: String,
        msg_definition: String,
        options: PublicationOptions,
        reply: oneshot::Sender<Result<Arc<PublicationCore>>>,
    },
    UnregisterPublisher {
        topic: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RegisterSubscriber {
        topic: String,
        topic_type: String,
        md5sum: String,
        options: SubscriptionOptions,
        callback: Arc<dyn Fn(&[u8]) + Send + Sync>,
        reply: oneshot::Sender<Result<Arc<SubscriptionCore>>>,
    },
    UnregisterSubscriber {
        topic: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RegisterService {
        service: String,
        service_type: String,
        md5sum: String,
        handler: ErasedHandler,
        reply: oneshot::Sender<Result<()>>,
    },
    UnregisterService {
        service: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RegisterServiceClient {
        config: ServiceClientConfig,
        reply: oneshot::Sender<Result<mpsc::UnboundedSender<CallRequest>>>,
    },
    PublisherUpdate {
        topic: String,
        publishers: Vec<String>,
    },
    RequestTopic {
        topic: String,
        reply: oneshot::Sender<Option<(String, u16)>>,
    },
    GetMasterUri {
        reply: oneshot::Sender<String>,
    },
    GetSubscriptions {
        reply: oneshot::Sender<Vec<(String, String)>>,
    },
    GetPublications {
        reply: oneshot::Sender<Vec<(String, String)>>,
    },
    GetSubscriptionPublishers {
        topic: String,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    PeerConnection {
        stream: TcpStream,
        header: ConnectionHeader,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cheap-to-clone handle used to talk to the node server task.
#[derive(Clone)]
pub(crate) struct NodeServerHandle {
    node_server_sender: mpsc::UnboundedSender<NodeMsg>,
}

impl NodeServerHandle {
    fn send(&self, msg: NodeMsg) -> Result<()> {
        self.node_server_sender
            .send(msg)
            .map_err(|_| Error::ShuttingDown)
    }

    async fn request<T>(
        &self,
        msg: NodeMsg,
        response: oneshot::Receiver<T>,
    ) -> Result<T> {
        self.send(msg)?;
        response.await.map_err(|_| Error::ShuttingDown)
    }

    pub(crate) async fn register_publisher(
        &self,
        topic: &str,
        topic_type: &str,
        md5sum: &str,
        msg_definition: &str,
        options: PublicationOptions,
    ) -> Result<Arc<PublicationCore>> {
        let (reply, response) = oneshot::channel();
        self.request(
            NodeMsg::RegisterPublisher {
                topic: topic.to_owned(),
                topic_type: topic_type.to_owned(),
                md5sum: md5sum.to_owned(),
                msg_definition: msg_definition.to_owned(),
                options,
                reply,
            },
            response,
        )
        .await?
    }

    pub(crate) async fn unregister_publisher(&self, topic: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.request(
            NodeMsg::UnregisterPublisher {
                topic: topic.to_owned(),
                reply,
            },
            response,
        )
        .await?
    }

    pub(crate) async fn register_subscriber(
        &self,
        topic: &str,
        topic_type: &str,
        md5sum: &str,
        options: SubscriptionOptions,
        callback: Arc<dyn Fn(&[u8]) + Send + Sync>,
    ) -> Result<Arc<SubscriptionCore>> {
        let (reply, response) = oneshot::channel();
        self.request(
            NodeMsg::RegisterSubscriber {
                topic: topic.to_owned(),
                topic_type: topic_type.to_owned(),
                md5sum: md5sum.to_owned(),
                options,
                callback,
                reply,
            },
            response,
        )
        .await?
    }

    pub(crate) async fn unregister_subscriber(&self, topic: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.request(
            NodeMsg::UnregisterSubscriber {
                topic: topic.to_owned(),
                reply,
            },
            response,
        )
        .await?
    }

    pub(crate) async fn register_service(
        &self,
        service: &str,
        service_type: &str,
        md5sum: &str,
        handler: ErasedHandler,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.request(
            NodeMsg::RegisterService {
                service: service.to_owned(),
                service_type: service_type.to_owned(),
                md5sum: md5sum.to_owned(),
                handler,
                reply,
            },
            response,
        )
        .await?
    }

    pub(crate) async fn unregister_service(&self, service: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.request(
            NodeMsg::UnregisterService {
                service: service.to_owned(),
                reply,
            },
            response,
        )
        .await?
    }

    pub(crate) async fn register_service_client(
        &self,
        config: ServiceClientConfig,
    ) -> Result<mpsc::UnboundedSender<CallRequest>> {
        let (reply, response) = oneshot::channel();
        self.request(NodeMsg::RegisterServiceClient { config, reply }, response)
            .await?
    }

    pub(crate) fn publisher_update(&self, topic: String, publishers: Vec<String>) -> Result<()> {
        self.send(NodeMsg::PublisherUpdate { topic, publishers })
    }

    pub(crate) async fn request_topic(&self, topic: &str) -> Result<Option<(String, u16)>> {
        let (reply, response) = oneshot::channel();
        self.request(
            NodeMsg::RequestTopic {
                topic: topic.to_owned(),
                reply,
            },
            response,
        )
        .await
    }

    pub(crate) async fn get_master_uri(&self) -> Result<String> {
        let (reply, response) = oneshot::channel();
        self.request(NodeMsg::GetMasterUri { reply }, response).await
    }

    pub(crate) async fn get_subscriptions(&self) -> Result<Vec<(String, String)>> {
        let (reply, response) = oneshot::channel();
        self.request(NodeMsg::GetSubscriptions { reply }, response)
            .await
    }

    pub(crate) async fn get_publications(&self) -> Result<Vec<(String, String)>> {
        let (reply, response) = oneshot::channel();
        self.request(NodeMsg::GetPublications { reply }, response)
            .await
    }

    pub(crate) async fn subscription_publishers(&self, topic: &str) -> Result<Vec<String>> {
        let (reply, response) = oneshot::channel();
        self.request(
            NodeMsg::GetSubscriptionPublishers {
                topic: topic.to_owned(),
                reply,
            },
            response,
        )
        .await?
    }

    pub(crate) fn peer_connection(&self, stream: TcpStream, header: ConnectionHeader) -> Result<()> {
        self.send(NodeMsg::PeerConnection { stream, header })
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.request(NodeMsg::Shutdown { reply }, response).await?
    }

    /// Kicks off a shutdown without waiting for it, for use from the slave
    /// API which has to answer its caller while teardown runs.
    pub(crate) fn trigger_shutdown(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            let _ = handle.shutdown().await;
        });
    }
}

/// Everything [crate::NodeHandle] needs back from spawning a node.
pub(crate) struct NodeContext {
    pub server: NodeServerHandle,
    pub master: MasterClient,
    pub tcpros_port: u16,
    pub xmlrpc_port: u16,
    pub client_uri: String,
}

pub(crate) struct Node {
    node_name: Name,
    master_uri: String,
    hostname: String,
    tcpros_port: u16,
    master: MasterClient,
    spinner: Spinner,
    publications: HashMap<String, Publication>,
    subscriptions: HashMap<String, Subscription>,
    services: HashMap<String, ServiceEndpoint>,
    service_links: Vec<ServiceClientLink>,
    _xmlrpc_server: XmlRpcServer,
    _tcpros_accept_task: ChildTask<()>,
}

impl Node {
    /// Binds the slave servers, connects the master client, and spawns the
    /// node server task.
    pub(crate) async fn new(
        master_uri: &str,
        hostname: &str,
        bind_addr: Ipv4Addr,
        node_name: &Name,
        xmlrpc_port_range: Option<(u16, u16)>,
        spin_rate_hz: u32,
    ) -> Result<NodeContext> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = NodeServerHandle {
            node_server_sender: sender,
        };

        // One TCPROS listener shared by every publication and service of
        // this node; inbound headers decide where a connection is routed
        let tcpros_listener = TcpListener::bind(SocketAddr::from((bind_addr, 0))).await?;
        let tcpros_port = tcpros_listener.local_addr()?.port();

        // The slave server has to be up before anything registers with the
        // master, since registration hands out its URI
        let xmlrpc_server = XmlRpcServer::new(bind_addr, xmlrpc_port_range, handle.clone())?;
        let xmlrpc_port = xmlrpc_server.port();
        let client_uri = format!("http://{hostname}:{xmlrpc_port}/");

        let master = MasterClient::new(
            master_uri.to_owned(),
            node_name.to_string(),
            client_uri.clone(),
        );

        let accept_handle = handle.clone();
        let accept_task = tokio::spawn(tcpros_accept_task(tcpros_listener, accept_handle));

        let node = Node {
            node_name: node_name.clone(),
            master_uri: master_uri.to_owned(),
            hostname: hostname.to_owned(),
            tcpros_port,
            master: master.clone(),
            spinner: Spinner::new(spin_rate_hz),
            publications: HashMap::new(),
            subscriptions: HashMap::new(),
            services: HashMap::new(),
            service_links: Vec::new(),
            _xmlrpc_server: xmlrpc_server,
            _tcpros_accept_task: accept_task.into(),
        };
        info!(
            "Node {node_name} listening on xmlrpc port {xmlrpc_port} and tcpros port {tcpros_port}"
        );
        tokio::spawn(node.run(receiver));

        Ok(NodeContext {
            server: handle,
            master,
            tcpros_port,
            xmlrpc_port,
            client_uri,
        })
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<NodeMsg>) {
        while let Some(msg) = receiver.recv().await {
            match msg {
                NodeMsg::RegisterPublisher {
                    topic,
                    topic_type,
                    md5sum,
                    msg_definition,
                    options,
                    reply,
                } => {
                    let result = self.register_publisher(
                        topic,
                        topic_type,
                        md5sum,
                        msg_definition,
                        options,
                    );
                    let _ = reply.send(result);
                }
                NodeMsg::UnregisterPublisher { topic, reply } => {
                    let result = match self.publications.remove(&topic) {
                        Some(publication) => {
                            publication.close().await;
                            Ok(())
                        }
                        None => Err(Error::ServerError(format!("not publishing topic {topic}"))),
                    };
                    let _ = reply.send(result);
                }
                NodeMsg::RegisterSubscriber {
                    topic,
                    topic_type,
                    md5sum,
                    options,
                    callback,
                    reply,
                } => {
                    let result =
                        self.register_subscriber(topic, topic_type, md5sum, options, callback);
                    let _ = reply.send(result);
                }
                NodeMsg::UnregisterSubscriber { topic, reply } => {
                    let result = match self.subscriptions.remove(&topic) {
                        Some(mut subscription) => {
                            subscription.close();
                            Ok(())
                        }
                        None => Err(Error::ServerError(format!("not subscribed to topic {topic}"))),
                    };
                    let _ = reply.send(result);
                }
                NodeMsg::RegisterService {
                    service,
                    service_type,
                    md5sum,
                    handler,
                    reply,
                } => {
                    let result = self.register_service(service, service_type, md5sum, handler);
                    let _ = reply.send(result);
                }
                NodeMsg::UnregisterService { service, reply } => {
                    let result = match self.services.remove(&service) {
                        Some(_) => Ok(()),
                        None => Err(Error::ServerError(format!("not serving {service}"))),
                    };
                    let _ = reply.send(result);
                }
                NodeMsg::RegisterServiceClient { config, reply } => {
                    self.service_links.retain(|link| !link.is_finished());
                    let (link, sender) = ServiceClientLink::new(config, self.master.clone());
                    self.service_links.push(link);
                    let _ = reply.send(Ok(sender));
                }
                NodeMsg::PublisherUpdate { topic, publishers } => {
                    match self.subscriptions.get_mut(&topic) {
                        Some(subscription) => subscription.update_publishers(&publishers),
                        None => debug!("publisherUpdate for unknown topic {topic}"),
                    }
                }
                NodeMsg::RequestTopic { topic, reply } => {
                    let endpoint = self
                        .publications
                        .contains_key(&topic)
                        .then(|| (self.hostname.clone(), self.tcpros_port));
                    let _ = reply.send(endpoint);
                }
                NodeMsg::GetMasterUri { reply } => {
                    let _ = reply.send(self.master_uri.clone());
                }
                NodeMsg::GetSubscriptions { reply } => {
                    let subscriptions = self
                        .subscriptions
                        .iter()
                        .map(|(topic, sub)| (topic.clone(), sub.topic_type().to_owned()))
                        .collect();
                    let _ = reply.send(subscriptions);
                }
                NodeMsg::GetPublications { reply } => {
                    let publications = self
                        .publications
                        .iter()
                        .map(|(topic, publication)| {
                            (topic.clone(), publication.topic_type().to_owned())
                        })
                        .collect();
                    let _ = reply.send(publications);
                }
                NodeMsg::GetSubscriptionPublishers { topic, reply } => {
                    let result = match self.subscriptions.get(&topic) {
                        Some(subscription) => Ok(subscription.publisher_uris()),
                        None => Err(Error::ServerError(format!("not subscribed to topic {topic}"))),
                    };
                    let _ = reply.send(result);
                }
                NodeMsg::PeerConnection { stream, header } => {
                    self.route_peer_connection(stream, header);
                }
                NodeMsg::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(Ok(()));
                    break;
                }
            }
        }
        debug!("Node server task for {} exited", self.node_name);
    }

    fn register_publisher(
        &mut self,
        topic: String,
        topic_type: String,
        md5sum: String,
        msg_definition: String,
        options: PublicationOptions,
    ) -> Result<Arc<PublicationCore>> {
        if let Some(existing) = self.publications.get(&topic) {
            if existing.topic_type() == topic_type {
                return Ok(existing.core());
            }
            return Err(Error::ServerError(format!(
                "topic {topic} is already advertised with type {}",
                existing.topic_type()
            )));
        }
        let publication = Publication::new(
            self.node_name.as_str(),
            &topic,
            &topic_type,
            &md5sum,
            &msg_definition,
            &options,
            self.spinner.clone(),
        );
        let core = publication.core();
        self.publications.insert(topic, publication);
        Ok(core)
    }

    fn register_subscriber(
        &mut self,
        topic: String,
        topic_type: String,
        md5sum: String,
        options: SubscriptionOptions,
        callback: Arc<dyn Fn(&[u8]) + Send + Sync>,
    ) -> Result<Arc<SubscriptionCore>> {
        if self.subscriptions.contains_key(&topic) {
            return Err(Error::ServerError(format!(
                "already subscribed to topic {topic}"
            )));
        }
        let subscription = Subscription::new(
            self.node_name.as_str(),
            &topic,
            &topic_type,
            &md5sum,
            &options,
            callback,
            self.spinner.clone(),
        );
        let core = subscription.core();
        self.subscriptions.insert(topic, subscription);
        Ok(core)
    }

    fn register_service(
        &mut self,
        service: String,
        service_type: String,
        md5sum: String,
        handler: ErasedHandler,
    ) -> Result<()> {
        if self.services.contains_key(&service) {
            return Err(Error::ServerError(format!(
                "service {service} is already advertised"
            )));
        }
        let endpoint = ServiceEndpoint::new(
            self.node_name.as_str(),
            &service,
            &service_type,
            &md5sum,
            handler,
        );
        self.services.insert(service, endpoint);
        Ok(())
    }

    /// Hands an inbound peer connection to the endpoint its header names.
    fn route_peer_connection(&mut self, stream: TcpStream, header: ConnectionHeader) {
        if let Some(service) = header.service.clone() {
            if let Some(endpoint) = self.services.get_mut(&service) {
                endpoint.handle_client(stream, header);
            } else {
                self.reject_peer(stream, format!("node does not serve {service}"));
            }
        } else if let Some(topic) = header.topic.clone() {
            if let Some(publication) = self.publications.get(&topic) {
                publication.core().add_subscriber(stream, header);
            } else {
                self.reject_peer(stream, format!("node does not publish {topic}"));
            }
        } else {
            self.reject_peer(
                stream,
                "connection header names neither a topic nor a service".to_string(),
            );
        }
    }

    fn reject_peer(&self, mut stream: TcpStream, reason: String) {
        warn!("Rejecting peer connection: {reason}");
        let caller_id = self.node_name.to_string();
        tokio::spawn(async move {
            let _ = tcpros::write_error_header(&mut stream, &caller_id, &reason).await;
        });
    }

    /// Graceful teardown: every endpoint is closed and a single best-effort
    /// unregister attempt per endpoint is queued to the master.
    async fn shutdown(&mut self) {
        info!("Node {} shutting down", self.node_name);
        let service_api = format!("rosrpc://{}:{}", self.hostname, self.tcpros_port);

        for (topic, publication) in self.publications.drain() {
            publication.close().await;
            let master = self.master.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(
                    Duration::from_secs(1),
                    master.unregister_publisher(&topic),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => debug!("Failed to unregister publisher {topic}: {err}"),
                    Err(_) => debug!("Timed out unregistering publisher {topic}"),
                }
            });
        }
        for (topic, mut subscription) in self.subscriptions.drain() {
            subscription.close();
            let master = self.master.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(
                    Duration::from_secs(1),
                    master.unregister_subscriber(&topic),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => debug!("Failed to unregister subscriber {topic}: {err}"),
                    Err(_) => debug!("Timed out unregistering subscriber {topic}"),
                }
            });
        }
        for (service, _endpoint) in self.services.drain() {
            let master = self.master.clone();
            let service_api = service_api.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(
                    Duration::from_secs(1),
                    master.unregister_service(&service, &service_api),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => debug!("Failed to unregister service {service}: {err}"),
                    Err(_) => debug!("Timed out unregistering service {service}"),
                }
            });
        }
        self.service_links.clear();
    }
}

/// Accepts inbound TCPROS connections, reads their header, and forwards
/// them to the node server for routing.
async fn tcpros_accept_task(listener: TcpListener, node: NodeServerHandle) {
    loop {
        match listener.accept().await {
            Ok((mut stream, peer)) => {
                let node = node.clone();
                tokio::spawn(async move {
                    match tcpros::read_header(&mut stream).await {
                        Ok(header) => {
                            let _ = node.peer_connection(stream, header);
                        }
                        Err(err) => {
                            debug!("Failed to read connection header from {peer}: {err}");
                        }
                    }
                });
            }
            Err(err) => {
                warn!("Failed to accept peer connection: {err}");
            }
        }
    }
}
