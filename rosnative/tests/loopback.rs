//! End-to-end pub/sub over real sockets, against the in-process master.

mod common;

use common::MasterStub;
use rosnative::{
    AdvertiseOptions, EndpointEvent, NodeHandle, NodeOptions, RosMessageType, SubscribeOptions,
};
use rosnative_msgs::std_msgs;
use std::time::Duration;
use tokio::sync::mpsc;

fn options(master_uri: &str) -> NodeOptions {
    NodeOptions {
        master_uri: Some(master_uri.to_owned()),
        hostname: Some("127.0.0.1".to_owned()),
        ..Default::default()
    }
}

async fn wait_for_connection(events: &mut tokio::sync::broadcast::Receiver<EndpointEvent>) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a subscriber connection")
            .unwrap();
        if matches!(event, EndpointEvent::Connection(_)) {
            break;
        }
    }
}

#[test_log::test(tokio::test)]
async fn loopback_publish_subscribe() {
    let master = MasterStub::start().await;
    let talker = NodeHandle::with_options("talker", options(master.uri()))
        .await
        .unwrap();
    let listener = NodeHandle::with_options("listener", options(master.uri()))
        .await
        .unwrap();

    let publisher = talker
        .advertise::<std_msgs::String>("/chatter", AdvertiseOptions::default())
        .await
        .unwrap();
    let mut events = publisher.events();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscriber = listener
        .subscribe::<std_msgs::String, _>("/chatter", SubscribeOptions::default(), move |msg| {
            let _ = tx.send(msg);
        })
        .await
        .unwrap();

    wait_for_connection(&mut events).await;

    publisher
        .publish(&std_msgs::String { data: "hi".into() })
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message arrived")
        .unwrap();
    assert_eq!(msg.data, "hi");

    // Exactly once
    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err(), "message delivered more than once");
}

#[test_log::test(tokio::test)]
async fn latched_publisher_replays_last_message_to_new_subscribers() {
    let master = MasterStub::start().await;
    let talker = NodeHandle::with_options("status_talker", options(master.uri()))
        .await
        .unwrap();
    let listener = NodeHandle::with_options("status_listener", options(master.uri()))
        .await
        .unwrap();

    let publisher = talker
        .advertise::<std_msgs::String>("/status", AdvertiseOptions::latching())
        .await
        .unwrap();
    publisher
        .publish(&std_msgs::String { data: "A".into() })
        .await
        .unwrap();

    // The subscriber shows up well after the publish
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscriber = listener
        .subscribe::<std_msgs::String, _>("/status", SubscribeOptions::default(), move |msg| {
            let _ = tx.send(msg);
        })
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("latched message was not replayed")
        .unwrap();
    assert_eq!(msg.data, "A");
}

#[test_log::test(tokio::test)]
async fn synchronous_publisher_bypasses_the_spinner() {
    let master = MasterStub::start().await;
    let talker = NodeHandle::with_options("sync_talker", options(master.uri()))
        .await
        .unwrap();
    let listener = NodeHandle::with_options("sync_listener", options(master.uri()))
        .await
        .unwrap();

    let advertise_options = AdvertiseOptions {
        throttle_ms: -1,
        ..Default::default()
    };
    let publisher = talker
        .advertise::<std_msgs::String>("/sync", advertise_options)
        .await
        .unwrap();
    let mut events = publisher.events();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscriber = listener
        .subscribe::<std_msgs::String, _>("/sync", SubscribeOptions::default(), move |msg| {
            let _ = tx.send(msg);
        })
        .await
        .unwrap();
    wait_for_connection(&mut events).await;

    for n in 0..3 {
        publisher
            .publish(&std_msgs::String {
                data: format!("m{n}"),
            })
            .await
            .unwrap();
    }
    for n in 0..3 {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("missing message")
            .unwrap();
        assert_eq!(msg.data, format!("m{n}"));
    }
}

#[test_log::test(tokio::test)]
async fn md5_mismatch_delivers_nothing() {
    // Same wire shape as std_msgs/String, different fingerprint
    #[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
    struct NotQuiteString {
        data: String,
    }
    impl RosMessageType for NotQuiteString {
        const ROS_TYPE_NAME: &'static str = "std_msgs/String";
        const MD5SUM: &'static str = "0000000000000000000000000000dead";
        const DEFINITION: &'static str = "string data";
    }

    let master = MasterStub::start().await;
    let talker = NodeHandle::with_options("md5_talker", options(master.uri()))
        .await
        .unwrap();
    let listener = NodeHandle::with_options("md5_listener", options(master.uri()))
        .await
        .unwrap();

    let publisher = talker
        .advertise::<std_msgs::String>("/guarded", AdvertiseOptions::latching())
        .await
        .unwrap();
    publisher
        .publish(&std_msgs::String { data: "secret".into() })
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscriber = listener
        .subscribe::<NotQuiteString, _>("/guarded", SubscribeOptions::default(), move |msg| {
            let _ = tx.send(msg);
        })
        .await
        .unwrap();

    // The handshake is rejected, so not even the latched message arrives
    let delivered = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(delivered.is_err(), "message delivered despite md5 mismatch");
    assert_eq!(publisher.subscriber_count().await, 0);
}

#[test_log::test(tokio::test)]
async fn unsubscribe_closes_the_connection() {
    let master = MasterStub::start().await;
    let talker = NodeHandle::with_options("bye_talker", options(master.uri()))
        .await
        .unwrap();
    let listener = NodeHandle::with_options("bye_listener", options(master.uri()))
        .await
        .unwrap();

    let publisher = talker
        .advertise::<std_msgs::String>("/bye", AdvertiseOptions::default())
        .await
        .unwrap();
    let mut events = publisher.events();

    let subscriber = listener
        .subscribe::<std_msgs::String, _>("/bye", SubscribeOptions::default(), |_msg| {})
        .await
        .unwrap();
    wait_for_connection(&mut events).await;

    subscriber.unsubscribe().await.unwrap();

    // The publisher notices once a write lands on the closed socket; the
    // first write after the close may still be buffered successfully
    let disconnected = async {
        loop {
            publisher
                .publish(&std_msgs::String { data: "anyone?".into() })
                .await
                .unwrap();
            match tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
                Ok(Ok(EndpointEvent::Disconnect(_))) => break,
                Ok(Ok(_)) | Err(_) => continue,
                Ok(Err(err)) => panic!("event channel failed: {err}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), disconnected)
        .await
        .expect("no disconnect observed");
    assert_eq!(publisher.subscriber_count().await, 0);
}
