mod common;

use common::TestServer;
use natter::{Client, Subject};

#[tokio::test(flavor = "multi_thread")]
async fn publish_round_trip() {
    common::init();
    let server = TestServer::spawn().await;

    let client = Client::new(server.address());
    client.connect_mut().echo(true);
    client.connect().await.unwrap();
    assert!(client.state().is_connected());

    let subject: Subject = "foo".parse().unwrap();
    let (sid, mut subscriber) = client.subscribe(&subject, 16).await.unwrap();

    client.publish(&subject, b"hello").await.unwrap();

    let msg = subscriber.recv().await.unwrap();
    assert_eq!(msg.subject(), &subject);
    assert_eq!(msg.sid(), sid);
    assert!(msg.reply_to().is_none());
    assert!(msg.headers().is_none());
    assert_eq!(msg.payload(), b"hello");

    // CONNECT, the resubscribes, and the publish all count as transmitted
    let counters = client.counters();
    assert!(counters.transmitted_messages() >= 3);
    assert!(counters.transmitted_bytes() > 0);
    assert!(counters.received_messages() >= 1);
    assert!(counters.received_bytes() > 0);

    client.dispose().await;
    assert!(subscriber.recv().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_with_reply_round_trip() {
    common::init();
    let server = TestServer::spawn().await;

    let client = Client::new(server.address());
    client.connect_mut().echo(true);
    client.connect().await.unwrap();

    let subject: Subject = "with.reply".parse().unwrap();
    let reply_to: Subject = "answer.here".parse().unwrap();
    let (_, mut subscriber) = client.subscribe(&subject, 4).await.unwrap();

    client
        .publish_with_reply(&subject, &reply_to, b"payload")
        .await
        .unwrap();

    let msg = subscriber.recv().await.unwrap();
    assert_eq!(msg.reply_to(), Some(&reply_to));
    assert_eq!(msg.payload(), b"payload");

    client.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribe_stops_delivery() {
    common::init();
    let server = TestServer::spawn().await;

    let client = Client::new(server.address());
    client.connect_mut().echo(true);
    client.connect().await.unwrap();

    let subject: Subject = "once".parse().unwrap();
    let (sid, mut subscriber) = client.subscribe(&subject, 4).await.unwrap();

    client.publish(&subject, b"first").await.unwrap();
    assert_eq!(subscriber.recv().await.unwrap().payload(), b"first");

    client.unsubscribe(sid).await.unwrap();
    // The server saw the UNSUB once the following round trip completes
    client.ping_pong().await.unwrap();
    client.publish(&subject, b"second").await.unwrap();
    client.ping_pong().await.unwrap();

    // The inbox closed without delivering the second publish
    assert!(subscriber.recv().await.is_none());

    // Unsubscribing an unknown sid is an error
    assert!(client.unsubscribe(sid).await.is_err());

    client.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn big_payload_round_trip() {
    common::init();
    let server = TestServer::spawn().await;

    let client = Client::new(server.address());
    client.connect_mut().echo(true);
    client.connect().await.unwrap();

    let subject: Subject = "big".parse().unwrap();
    let (_, mut subscriber) = client.subscribe(&subject, 4).await.unwrap();

    // Larger than the sender's scratch buffer, forcing the direct write path
    let payload: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    client.publish(&subject, &payload).await.unwrap();

    let msg = subscriber.recv().await.unwrap();
    assert_eq!(msg.payload(), &payload[..]);

    client.dispose().await;
}
