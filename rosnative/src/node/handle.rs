use crate::master_client::MasterClient;
use crate::names::Name;
use crate::node::actor::{Node, NodeServerHandle};
use crate::publisher::{PublicationOptions, Publisher};
use crate::service_client::{ServiceClient, ServiceClientConfig};
use crate::service_server::{ErasedHandler, ServiceServer};
use crate::spinner::DEFAULT_SPIN_RATE_HZ;
use crate::subscriber::{Subscriber, SubscriptionOptions};
use crate::EndpointEvent;
use log::*;
use rosnative_common::{Error, Result, RosMessageType, RosServiceType, ServiceFn};
use std::sync::Arc;

/// Options controlling node initialization.
#[derive(Clone, Debug, Default)]
pub struct NodeOptions {
    /// Master URI; falls back to the `ROS_MASTER_URI` environment variable.
    pub master_uri: Option<String>,
    /// Advertised hostname; falls back to `ROS_IP`, `ROS_HOSTNAME`, then
    /// the machine hostname.
    pub hostname: Option<String>,
    /// Port range to allocate the slave XML-RPC port from; ephemeral when
    /// unset.
    pub xmlrpc_port_range: Option<(u16, u16)>,
    /// Spinner tick rate; 200 Hz when unset.
    pub spin_rate_hz: Option<u32>,
}

/// Options for [NodeHandle::advertise].
#[derive(Clone, Debug)]
pub struct AdvertiseOptions {
    /// Spinner queue bound for outgoing messages.
    pub queue_size: usize,
    /// Minimum interval between fan-out dispatches. 0 sends on the next
    /// spinner tick; negative bypasses the spinner and writes to every
    /// subscriber inside `publish`.
    pub throttle_ms: i64,
    /// Replay the last sent message to every newly connecting subscriber.
    pub latching: bool,
    /// Request TCP_NODELAY on accepted subscriber sockets.
    pub tcp_nodelay: bool,
}

impl Default for AdvertiseOptions {
    fn default() -> Self {
        Self {
            queue_size: 1,
            throttle_ms: 0,
            latching: false,
            tcp_nodelay: false,
        }
    }
}

impl AdvertiseOptions {
    /// Shorthand for a latched publisher with defaults otherwise.
    pub fn latching() -> Self {
        Self {
            latching: true,
            ..Default::default()
        }
    }
}

/// Options for [NodeHandle::subscribe].
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    /// Spinner queue bound for messages awaiting the callback.
    pub queue_size: usize,
    /// Minimum interval between callback dispatches; semantics as in
    /// [AdvertiseOptions::throttle_ms].
    pub throttle_ms: i64,
    /// Ask publishers to set TCP_NODELAY on their side of the connection.
    pub tcp_nodelay: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            queue_size: 1,
            throttle_ms: 0,
            tcp_nodelay: false,
        }
    }
}

/// Options for [NodeHandle::service_client].
#[derive(Clone, Debug)]
pub struct ServiceClientOptions {
    /// Keep the connection open between calls instead of re-resolving and
    /// reconnecting for each one.
    pub persistent: bool,
    /// Bound on queued calls; the oldest queued call is rejected when it is
    /// exceeded. Negative means unlimited.
    pub queue_length: i64,
}

impl Default for ServiceClientOptions {
    fn default() -> Self {
        Self {
            persistent: false,
            queue_length: -1,
        }
    }
}

struct HandleInner {
    server: NodeServerHandle,
    master: MasterClient,
    node_name: Name,
    hostname: String,
    tcpros_port: u16,
    xmlrpc_port: u16,
    client_uri: String,
}

/// Handle to a running node; the entry point of the whole client library.
///
/// Cheap to clone. The node itself runs on background tasks and is shared
/// by all clones; it shuts down when [NodeHandle::shutdown] is called or
/// when its master orders it to.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<HandleInner>,
}

impl NodeHandle {
    /// Creates a new node registered against the given master.
    ///
    /// The name may be relative ("talker") or global ("/talker").
    pub async fn new(master_uri: &str, name: &str) -> Result<NodeHandle> {
        Self::with_options(
            name,
            NodeOptions {
                master_uri: Some(master_uri.to_owned()),
                ..Default::default()
            },
        )
        .await
    }

    /// Creates a new node, taking the master URI from `ROS_MASTER_URI`.
    pub async fn from_env(name: &str) -> Result<NodeHandle> {
        Self::with_options(name, NodeOptions::default()).await
    }

    pub async fn with_options(name: &str, options: NodeOptions) -> Result<NodeHandle> {
        let master_uri = options
            .master_uri
            .or_else(|| std::env::var("ROS_MASTER_URI").ok())
            .ok_or_else(|| {
                Error::Config("no master URI given and ROS_MASTER_URI is unset".to_string())
            })?;
        let node_name = Name::new(name)?.resolve("/");
        let (bind_addr, hostname) = super::determine_addr(options.hostname.as_deref())?;
        let context = Node::new(
            &master_uri,
            &hostname,
            bind_addr,
            &node_name,
            options.xmlrpc_port_range,
            options.spin_rate_hz.unwrap_or(DEFAULT_SPIN_RATE_HZ),
        )
        .await?;
        Ok(NodeHandle {
            inner: Arc::new(HandleInner {
                server: context.server,
                master: context.master,
                node_name,
                hostname,
                tcpros_port: context.tcpros_port,
                xmlrpc_port: context.xmlrpc_port,
                client_uri: context.client_uri,
            }),
        })
    }

    /// The node's global name.
    pub fn name(&self) -> &str {
        self.inner.node_name.as_str()
    }

    /// The node's slave XML-RPC URI as reported to the master.
    pub fn uri(&self) -> &str {
        &self.inner.client_uri
    }

    pub fn xmlrpc_port(&self) -> u16 {
        self.inner.xmlrpc_port
    }

    fn service_api(&self) -> String {
        format!("rosrpc://{}:{}", self.inner.hostname, self.inner.tcpros_port)
    }

    /// Advertises a topic and registers it with the master.
    ///
    /// Returns once the master acknowledged the registration; while the
    /// master is unreachable this waits and retries rather than failing.
    pub async fn advertise<T: RosMessageType>(
        &self,
        topic: &str,
        options: AdvertiseOptions,
    ) -> Result<Publisher<T>> {
        let topic = Name::new(topic)?.resolve("/");
        let core = self
            .inner
            .server
            .register_publisher(
                topic.as_str(),
                T::ROS_TYPE_NAME,
                T::MD5SUM,
                T::DEFINITION,
                PublicationOptions {
                    latching: options.latching,
                    tcp_nodelay: options.tcp_nodelay,
                    queue_size: options.queue_size,
                    throttle_ms: options.throttle_ms,
                },
            )
            .await?;
        match self
            .inner
            .master
            .register_publisher(topic.as_str(), T::ROS_TYPE_NAME)
            .await
        {
            Ok(_subscribers) => {
                let _ = core.events.send(EndpointEvent::Registered);
                Ok(Publisher::new(topic.as_str(), core, self.clone()))
            }
            Err(err) => {
                let _ = self.inner.server.unregister_publisher(topic.as_str()).await;
                Err(err)
            }
        }
    }

    /// Subscribes to a topic; `callback` receives every decoded message.
    ///
    /// The callback runs on the node's dispatch task and is never invoked
    /// re-entrantly.
    pub async fn subscribe<T, F>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Subscriber>
    where
        T: RosMessageType,
        F: Fn(T) + Send + Sync + 'static,
    {
        let topic = Name::new(topic)?.resolve("/");
        let topic_in_callback = topic.as_str().to_owned();
        let erased: Arc<dyn Fn(&[u8]) + Send + Sync> = Arc::new(move |payload: &[u8]| {
            // A frame that fails to decode is dropped, the connection and
            // subscription stay up
            match rosnative_serde_rosmsg::from_slice_body::<T>(payload) {
                Ok(message) => callback(message),
                Err(err) => {
                    warn!("Failed to deserialize message on {topic_in_callback}: {err}");
                }
            }
        });
        let core = self
            .inner
            .server
            .register_subscriber(
                topic.as_str(),
                T::ROS_TYPE_NAME,
                T::MD5SUM,
                SubscriptionOptions {
                    tcp_nodelay: options.tcp_nodelay,
                    queue_size: options.queue_size,
                    throttle_ms: options.throttle_ms,
                },
                erased,
            )
            .await?;
        match self
            .inner
            .master
            .register_subscriber(topic.as_str(), T::ROS_TYPE_NAME)
            .await
        {
            Ok(publishers) => {
                let _ = core.events.send(EndpointEvent::Registered);
                self.inner
                    .server
                    .publisher_update(topic.as_str().to_owned(), publishers)?;
                Ok(Subscriber::new(topic.as_str(), core, self.clone()))
            }
            Err(err) => {
                let _ = self
                    .inner
                    .server
                    .unregister_subscriber(topic.as_str())
                    .await;
                Err(err)
            }
        }
    }

    /// Advertises a service; `handler` is invoked once per request.
    ///
    /// A handler error (or panic) is surfaced to the calling peer as a
    /// failure response carrying the error text.
    pub async fn advertise_service<T, F>(&self, service: &str, handler: F) -> Result<ServiceServer>
    where
        T: RosServiceType,
        F: ServiceFn<T>,
    {
        let service = Name::new(service)?.resolve("/");
        let erased: ErasedHandler = Arc::new(move |payload: &[u8]| {
            let request: T::Request = rosnative_serde_rosmsg::from_slice_body(payload)
                .map_err(|err| format!("failed to deserialize service request: {err}"))?;
            let response = handler(request).map_err(|err| err.to_string())?;
            rosnative_serde_rosmsg::to_vec(&response)
                .map_err(|err| format!("failed to serialize service response: {err}"))
        });
        self.inner
            .server
            .register_service(service.as_str(), T::ROS_SERVICE_NAME, T::MD5SUM, erased)
            .await?;
        match self
            .inner
            .master
            .register_service(service.as_str(), &self.service_api())
            .await
        {
            Ok(()) => Ok(ServiceServer::new(service.as_str(), self.clone())),
            Err(err) => {
                let _ = self.inner.server.unregister_service(service.as_str()).await;
                Err(err)
            }
        }
    }

    /// Creates a client for a service.
    ///
    /// Resolution of the service URI happens lazily per call, so the client
    /// can be created before the server exists.
    pub async fn service_client<T: RosServiceType>(
        &self,
        service: &str,
        options: ServiceClientOptions,
    ) -> Result<ServiceClient<T>> {
        let service = Name::new(service)?.resolve("/");
        let sender = self
            .inner
            .server
            .register_service_client(ServiceClientConfig {
                caller_id: self.inner.node_name.to_string(),
                service: service.as_str().to_owned(),
                md5sum: T::MD5SUM.to_owned(),
                persistent: options.persistent,
                queue_length: options.queue_length,
            })
            .await?;
        Ok(ServiceClient::new(service.as_str(), sender))
    }

    /// Stops publishing a topic and unregisters it from the master.
    pub async fn unadvertise(&self, topic: &str) -> Result<()> {
        let topic = Name::new(topic)?.resolve("/");
        self.inner.server.unregister_publisher(topic.as_str()).await?;
        if let Err(err) = self.inner.master.unregister_publisher(topic.as_str()).await {
            debug!("Failed to unregister publisher {topic} at the master: {err}");
        }
        Ok(())
    }

    /// Drops a subscription and unregisters it from the master.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let topic = Name::new(topic)?.resolve("/");
        self.inner
            .server
            .unregister_subscriber(topic.as_str())
            .await?;
        if let Err(err) = self.inner.master.unregister_subscriber(topic.as_str()).await {
            debug!("Failed to unregister subscriber {topic} at the master: {err}");
        }
        Ok(())
    }

    /// Stops serving a service and unregisters it from the master.
    pub async fn unadvertise_service(&self, service: &str) -> Result<()> {
        let service = Name::new(service)?.resolve("/");
        self.inner.server.unregister_service(service.as_str()).await?;
        if let Err(err) = self
            .inner
            .master
            .unregister_service(service.as_str(), &self.service_api())
            .await
        {
            debug!("Failed to unregister service {service} at the master: {err}");
        }
        Ok(())
    }

    pub(crate) async fn subscription_publishers(&self, topic: &str) -> Result<Vec<String>> {
        self.inner.server.subscription_publishers(topic).await
    }

    /// Graceful teardown: unregisters every endpoint (best effort), closes
    /// peer sockets, and stops the slave server. Further operations on any
    /// handle fail with [Error::ShuttingDown].
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.server.shutdown().await
    }
}
