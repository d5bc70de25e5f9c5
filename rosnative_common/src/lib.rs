//! # rosnative_common
//! Common types and traits shared by the rosnative workspace: the central
//! error type, and the contracts that typed message and service definitions
//! have to satisfy to be usable with the native ROS1 client.

/// The central error type used throughout rosnative.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when the client could not be configured at all, e.g. no
    /// master URI was given and `ROS_MASTER_URI` is unset. Fatal at init.
    #[error("Configuration error: {0}")]
    Config(String),
    /// When a node, topic, or service name doesn't meet ROS naming requirements.
    #[error("Name does not meet ROS requirements: {0}")]
    InvalidName(String),
    /// Communication with the relevant endpoint is currently lost.
    ///
    /// The master client keeps retrying behind the scenes while this state
    /// persists; peer connections are dropped and re-established on the next
    /// publisher update.
    #[error("No connection to ROS endpoint")]
    Disconnected,
    /// The master (or a peer node) answered, but reported a failure.
    ///
    /// Carries the status message of an RPC response with code != 1, or the
    /// text of an `error=` connection header received during a handshake.
    #[error("ROS endpoint reported an error: {0}")]
    ServerError(String),
    /// A message could not be encoded to or decoded from its wire format.
    ///
    /// Also returned on md5sum mismatches detected before deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// A fundamental networking failure: bind errors, refused peer
    /// connections, broken sockets.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    /// An operation took unexpectedly long. The core itself never imposes
    /// timeouts on service calls; this is surfaced from lower layers only.
    #[error("Operation timed out: {0}")]
    Timeout(String),
    /// The node is shutting down; no further operations are accepted.
    #[error("Node is shutting down")]
    ShuttingDown,
    /// Anything that doesn't cleanly fit the categories above.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Generic result type used throughout rosnative.
pub type Result<T> = std::result::Result<T, Error>;

/// The contract a typed ROS message has to satisfy.
///
/// Serialization and deserialization go through serde and the
/// `rosnative_serde_rosmsg` wire codec; the metadata the wire handshake
/// needs (type name, md5sum, full definition) lives in associated constants.
/// Implementations are normally produced by a message generator, but any
/// hand-written type with matching field order works as well.
pub trait RosMessageType:
    'static + serde::de::DeserializeOwned + serde::Serialize + Send + Sync + Clone + std::fmt::Debug
{
    /// The combination pkg_name/type_name string describing the type to ros
    /// Example: std_msgs/String
    const ROS_TYPE_NAME: &'static str;

    /// The computed md5sum of the message file and its dependencies
    const MD5SUM: &'static str = "";

    /// The full expanded definition from the msg or srv file
    const DEFINITION: &'static str = "";
}

// This special impl allows for services with no args / returns
impl RosMessageType for () {
    const ROS_TYPE_NAME: &'static str = "";
    const MD5SUM: &'static str = "";
    const DEFINITION: &'static str = "";
}

/// Represents a ROS service type definition corresponding to a `.srv` file.
///
/// The joint md5sum is computed over the concatenated request and response
/// definitions with no separator, which is why it lives here and not on the
/// request or response message types.
pub trait RosServiceType: 'static + Send + Sync {
    /// Name of the ros service e.g. `rospy_tutorials/AddTwoInts`
    const ROS_SERVICE_NAME: &'static str;
    /// The joint md5sum of the request and response definitions
    const MD5SUM: &'static str;
    /// The type of data being sent in the request
    type Request: RosMessageType;
    /// The type of data expected back in the response
    type Response: RosMessageType;
}

/// This trait describes a function which can validly act as a ROS service
/// server with rosnative. We're really just using this as a trait alias
/// as the full definition is overly verbose and trait aliases are unstable.
pub trait ServiceFn<T: RosServiceType>:
    Fn(
        T::Request,
    ) -> std::result::Result<T::Response, Box<dyn std::error::Error + 'static + Send + Sync>>
    + Send
    + Sync
    + 'static
{
}

/// Automatic implementation of ServiceFn for Fn
impl<T, F> ServiceFn<T> for F
where
    T: RosServiceType,
    F: Fn(
            T::Request,
        )
            -> std::result::Result<T::Response, Box<dyn std::error::Error + 'static + Send + Sync>>
        + Send
        + Sync
        + 'static,
{
}

/// A generic message whose payload is the raw bytes of the message body.
///
/// The equivalent of rospy's AnyMsg or C++'s ShapeShifter; lets tooling probe
/// a topic without knowing its type. Its `*` type name and md5sum match any
/// peer during the connection handshake.
#[derive(serde::Deserialize, serde::Serialize, Debug, Default, Clone, PartialEq)]
pub struct ShapeShifter(pub Vec<u8>);

impl RosMessageType for ShapeShifter {
    const ROS_TYPE_NAME: &'static str = "*";
    const MD5SUM: &'static str = "*";
    const DEFINITION: &'static str = "";
}
