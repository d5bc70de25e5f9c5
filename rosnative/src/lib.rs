//! # rosnative
//! A native ROS1 client library: talk to a ROS master over XML-RPC, answer
//! the slave API, and exchange messages and service calls with peer nodes
//! over the TCPROS wire protocol.
//!
//! The entry point is [NodeHandle]:
//!
//! ```no_run
//! # #[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
//! # struct Chatter { data: String }
//! # impl rosnative::RosMessageType for Chatter {
//! #     const ROS_TYPE_NAME: &'static str = "std_msgs/String";
//! #     const MD5SUM: &'static str = "992ce8a1687cec8c8bd883ec73ca41d1";
//! #     const DEFINITION: &'static str = "string data";
//! # }
//! # async fn example() -> rosnative::Result<()> {
//! let nh = rosnative::NodeHandle::new("http://localhost:11311", "talker").await?;
//! let publisher = nh
//!     .advertise::<Chatter>("/chatter", Default::default())
//!     .await?;
//! publisher.publish(&Chatter { data: "hi".to_string() }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Message and service types implement the contracts from
//! [rosnative_common]; they are normally produced by a message generator
//! and consumed here, the library itself never parses `.msg` files.

mod master_client;
mod names;
mod node;
mod publisher;
mod service_client;
mod service_server;
mod spinner;
mod subscriber;
mod tcpros;

pub use names::Name;
pub use node::{
    AdvertiseOptions, NodeHandle, NodeOptions, ServiceClientOptions, SubscribeOptions,
};
pub use publisher::Publisher;
pub use service_client::ServiceClient;
pub use service_server::ServiceServer;
pub use subscriber::Subscriber;
pub use tcpros::ConnectionHeader;

pub use rosnative_common::{Error, Result, RosMessageType, RosServiceType, ServiceFn, ShapeShifter};

/// Lifecycle notifications surfaced by publishers and subscribers.
///
/// Obtained from [Publisher::events] / [Subscriber::events]; the payload of
/// the connection events identifies the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointEvent {
    /// The master acknowledged the endpoint's registration.
    Registered,
    /// A peer connection completed its handshake.
    Connection(String),
    /// A peer connection closed or failed.
    Disconnect(String),
}
