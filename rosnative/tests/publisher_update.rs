//! publisherUpdate reconciliation: connect to new publishers, drop removed
//! ones, keep the rest.

mod common;

use common::{send_publisher_update, MasterStub};
use rosnative::{AdvertiseOptions, NodeHandle, NodeOptions, SubscribeOptions, Subscriber};
use rosnative_msgs::std_msgs;
use std::time::Duration;

fn options(master_uri: &str) -> NodeOptions {
    NodeOptions {
        master_uri: Some(master_uri.to_owned()),
        hostname: Some("127.0.0.1".to_owned()),
        ..Default::default()
    }
}

async fn wait_for_publishers(subscriber: &Subscriber, mut expected: Vec<String>) {
    expected.sort();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut current = subscriber.publisher_uris().await.unwrap();
        current.sort();
        if current == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "publisher set never became {expected:?}, still {current:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[test_log::test(tokio::test)]
async fn publisher_update_reconciles_connections() {
    let master = MasterStub::start().await;
    let first = NodeHandle::with_options("pub_one", options(master.uri()))
        .await
        .unwrap();
    let second = NodeHandle::with_options("pub_two", options(master.uri()))
        .await
        .unwrap();
    let listener = NodeHandle::with_options("reconciler", options(master.uri()))
        .await
        .unwrap();

    let publisher_one = first
        .advertise::<std_msgs::String>("/chatter", AdvertiseOptions::default())
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let subscriber = listener
        .subscribe::<std_msgs::String, _>("/chatter", SubscribeOptions::default(), move |msg| {
            let _ = tx.send(msg.data);
        })
        .await
        .unwrap();

    // Initially connected to the one registered publisher
    wait_for_publishers(&subscriber, vec![first.uri().to_owned()]).await;

    let publisher_two = second
        .advertise::<std_msgs::String>("/chatter", AdvertiseOptions::default())
        .await
        .unwrap();
    let mut events_two = publisher_two.events();

    // The master (the test, here) announces both publishers: U1 stays, U2
    // gets a fresh connection
    send_publisher_update(
        listener.uri(),
        "/chatter",
        vec![first.uri().to_owned(), second.uri().to_owned()],
    )
    .await;
    wait_for_publishers(
        &subscriber,
        vec![first.uri().to_owned(), second.uri().to_owned()],
    )
    .await;

    // Wait until U2's side of the handshake is done as well
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events_two.recv())
            .await
            .expect("subscriber never connected to the second publisher")
            .unwrap();
        if matches!(event, rosnative::EndpointEvent::Connection(_)) {
            break;
        }
    }

    // Second update drops U1
    send_publisher_update(listener.uri(), "/chatter", vec![second.uri().to_owned()]).await;
    wait_for_publishers(&subscriber, vec![second.uri().to_owned()]).await;

    // Traffic still flows from the publisher that remains
    publisher_two
        .publish(&std_msgs::String { data: "from two".into() })
        .await
        .unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message from the remaining publisher")
        .unwrap();
    assert_eq!(msg, "from two");

    drop(publisher_one);
}

#[test_log::test(tokio::test)]
async fn update_for_an_unknown_topic_is_harmless() {
    let master = MasterStub::start().await;
    let listener = NodeHandle::with_options("unbothered", options(master.uri()))
        .await
        .unwrap();
    let _subscriber = listener
        .subscribe::<std_msgs::String, _>("/known", SubscribeOptions::default(), |_msg| {})
        .await
        .unwrap();

    send_publisher_update(listener.uri(), "/unknown", vec![]).await;
}
