//! End-to-end service calls over real sockets, against the in-process
//! master.

mod common;

use common::MasterStub;
use rosnative::{Error, NodeHandle, NodeOptions, RosServiceType, ServiceClientOptions};
use rosnative_msgs::rospy_tutorials::{AddTwoInts, AddTwoIntsRequest, AddTwoIntsResponse};

fn options(master_uri: &str) -> NodeOptions {
    NodeOptions {
        master_uri: Some(master_uri.to_owned()),
        hostname: Some("127.0.0.1".to_owned()),
        ..Default::default()
    }
}

fn adder(request: AddTwoIntsRequest) -> Result<AddTwoIntsResponse, Box<dyn std::error::Error + Send + Sync>> {
    if request.a == 42 {
        return Err("the handler refuses to add 42".into());
    }
    Ok(AddTwoIntsResponse {
        sum: request.a + request.b,
    })
}

#[test_log::test(tokio::test)]
async fn service_success_failure_success() {
    let master = MasterStub::start().await;
    let server_node = NodeHandle::with_options("adder", options(master.uri()))
        .await
        .unwrap();
    let client_node = NodeHandle::with_options("adder_client", options(master.uri()))
        .await
        .unwrap();

    let _server = server_node
        .advertise_service::<AddTwoInts, _>("/add_two_ints", adder)
        .await
        .unwrap();
    let client = client_node
        .service_client::<AddTwoInts>("/add_two_ints", ServiceClientOptions::default())
        .await
        .unwrap();

    let response = client.call(&AddTwoIntsRequest { a: 2, b: 3 }).await.unwrap();
    assert_eq!(response.sum, 5);

    // A handler failure carries the server's error string to the caller
    let err = client
        .call(&AddTwoIntsRequest { a: 42, b: 0 })
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("refuses to add 42"),
        "unexpected error: {err}"
    );

    // The failure poisons nothing; the next call succeeds
    let response = client
        .call(&AddTwoIntsRequest { a: 10, b: 20 })
        .await
        .unwrap();
    assert_eq!(response.sum, 30);
}

#[test_log::test(tokio::test)]
async fn persistent_client_reuses_its_connection() {
    let master = MasterStub::start().await;
    let server_node = NodeHandle::with_options("persistent_adder", options(master.uri()))
        .await
        .unwrap();
    let client_node = NodeHandle::with_options("persistent_client", options(master.uri()))
        .await
        .unwrap();

    let _server = server_node
        .advertise_service::<AddTwoInts, _>("/add_two_ints", adder)
        .await
        .unwrap();
    let client = client_node
        .service_client::<AddTwoInts>(
            "/add_two_ints",
            ServiceClientOptions {
                persistent: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    for n in 0..5i64 {
        let response = client.call(&AddTwoIntsRequest { a: n, b: n }).await.unwrap();
        assert_eq!(response.sum, 2 * n);
    }
}

#[test_log::test(tokio::test)]
async fn handler_panic_becomes_an_error_response() {
    let master = MasterStub::start().await;
    let server_node = NodeHandle::with_options("panicky_adder", options(master.uri()))
        .await
        .unwrap();
    let client_node = NodeHandle::with_options("panicky_client", options(master.uri()))
        .await
        .unwrap();

    let _server = server_node
        .advertise_service::<AddTwoInts, _>("/panicky_add", |request: AddTwoIntsRequest| {
            assert!(request.a != 0, "a must not be zero");
            Ok(AddTwoIntsResponse {
                sum: request.a + request.b,
            })
        })
        .await
        .unwrap();
    let client = client_node
        .service_client::<AddTwoInts>("/panicky_add", ServiceClientOptions::default())
        .await
        .unwrap();

    let err = client.call(&AddTwoIntsRequest { a: 0, b: 1 }).await.unwrap_err();
    assert!(
        err.to_string().contains("panicked"),
        "unexpected error: {err}"
    );

    let response = client.call(&AddTwoIntsRequest { a: 1, b: 1 }).await.unwrap();
    assert_eq!(response.sum, 2);
}

#[test_log::test(tokio::test)]
async fn md5_mismatch_is_rejected_at_the_handshake() {
    // Same request/response shape, wrong fingerprint
    struct BogusAddTwoInts {}
    impl RosServiceType for BogusAddTwoInts {
        const ROS_SERVICE_NAME: &'static str = "rospy_tutorials/AddTwoInts";
        const MD5SUM: &'static str = "00000000000000000000000000000bad";
        type Request = AddTwoIntsRequest;
        type Response = AddTwoIntsResponse;
    }

    let master = MasterStub::start().await;
    let server_node = NodeHandle::with_options("strict_adder", options(master.uri()))
        .await
        .unwrap();
    let client_node = NodeHandle::with_options("bogus_client", options(master.uri()))
        .await
        .unwrap();

    let _server = server_node
        .advertise_service::<AddTwoInts, _>("/add_two_ints", adder)
        .await
        .unwrap();
    let client = client_node
        .service_client::<BogusAddTwoInts>("/add_two_ints", ServiceClientOptions::default())
        .await
        .unwrap();

    let err = client.call(&AddTwoIntsRequest { a: 1, b: 2 }).await.unwrap_err();
    assert!(
        matches!(err, Error::ServerError(_)),
        "unexpected error: {err}"
    );
    assert!(err.to_string().contains("md5sum"), "unexpected error: {err}");
}

#[test_log::test(tokio::test)]
async fn calling_an_unknown_service_fails_cleanly() {
    let master = MasterStub::start().await;
    let client_node = NodeHandle::with_options("lost_client", options(master.uri()))
        .await
        .unwrap();

    let client = client_node
        .service_client::<AddTwoInts>("/no_such_service", ServiceClientOptions::default())
        .await
        .unwrap();
    let err = client.call(&AddTwoIntsRequest { a: 1, b: 2 }).await.unwrap_err();
    assert!(
        err.to_string().contains("no provider"),
        "unexpected error: {err}"
    );
}
