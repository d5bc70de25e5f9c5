//! Typed message and service definitions used by the rosnative examples and
//! integration tests.
//!
//! These mirror the layout a message generator would emit for the
//! corresponding `.msg`/`.srv` files; they are maintained by hand so the core
//! crates stay decoupled from any generator tooling. Field order matters: it
//! is the wire order.

pub mod std_msgs {
    use rosnative_common::RosMessageType;

    #[allow(non_camel_case_types)]
    #[derive(::serde::Deserialize, ::serde::Serialize, Debug, Default, Clone, PartialEq)]
    pub struct String {
        pub data: ::std::string::String,
    }

    impl RosMessageType for String {
        const ROS_TYPE_NAME: &'static str = "std_msgs/String";
        const MD5SUM: &'static str = "992ce8a1687cec8c8bd883ec73ca41d1";
        const DEFINITION: &'static str = "string data";
    }

    #[allow(non_camel_case_types)]
    #[derive(::serde::Deserialize, ::serde::Serialize, Debug, Default, Clone, PartialEq)]
    pub struct Int64 {
        pub data: i64,
    }

    impl RosMessageType for Int64 {
        const ROS_TYPE_NAME: &'static str = "std_msgs/Int64";
        const MD5SUM: &'static str = "34add168574510e6e17f5d23ecc077ef";
        const DEFINITION: &'static str = "int64 data";
    }
}

pub mod rospy_tutorials {
    use rosnative_common::{RosMessageType, RosServiceType};

    #[allow(non_camel_case_types)]
    #[derive(::serde::Deserialize, ::serde::Serialize, Debug, Default, Clone, PartialEq)]
    pub struct AddTwoIntsRequest {
        pub a: i64,
        pub b: i64,
    }

    impl RosMessageType for AddTwoIntsRequest {
        const ROS_TYPE_NAME: &'static str = "rospy_tutorials/AddTwoIntsRequest";
        const DEFINITION: &'static str = "int64 a\nint64 b";
    }

    #[allow(non_camel_case_types)]
    #[derive(::serde::Deserialize, ::serde::Serialize, Debug, Default, Clone, PartialEq)]
    pub struct AddTwoIntsResponse {
        pub sum: i64,
    }

    impl RosMessageType for AddTwoIntsResponse {
        const ROS_TYPE_NAME: &'static str = "rospy_tutorials/AddTwoIntsResponse";
        const DEFINITION: &'static str = "int64 sum";
    }

    #[allow(non_camel_case_types)]
    #[derive(Debug, Default, Clone)]
    pub struct AddTwoInts {}

    impl RosServiceType for AddTwoInts {
        const ROS_SERVICE_NAME: &'static str = "rospy_tutorials/AddTwoInts";
        const MD5SUM: &'static str = "6a2e34150c00229791cc89ff309fff21";
        type Request = AddTwoIntsRequest;
        type Response = AddTwoIntsResponse;
    }
}
