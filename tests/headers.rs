mod common;

use common::TestServer;
use natter::{Client, Headers, Subject};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn publish_with_headers_round_trip() {
    common::init();
    let server = TestServer::spawn().await;

    let client = Client::new(server.address());
    client.connect_mut().echo(true);
    client.connect().await.unwrap();

    let subject: Subject = "bar".parse().unwrap();
    let wrong_pattern: Subject = "bar.>".parse().unwrap();
    let (_, mut wrong) = client.subscribe(&wrong_pattern, 4).await.unwrap();
    let (_, mut subscriber) = client.subscribe(&subject, 4).await.unwrap();

    let mut headers = Headers::new();
    headers.append("A", "1").append("B", "2");
    client
        .publish_with_headers(&subject, &headers, b"body")
        .await
        .unwrap();

    let msg = subscriber.recv().await.unwrap();
    assert_eq!(msg.subject(), &subject);
    let received = msg.headers().unwrap();
    assert_eq!(received.get("A"), Some("1"));
    assert_eq!(received.get("B"), Some("2"));
    assert_eq!(received.len(), 2);
    assert_eq!(msg.payload(), b"body");

    // "bar.>" does not match "bar"; after a full round trip the wildcard
    // subscription must still be empty.
    client.ping_pong().await.unwrap();
    let nothing = tokio::time::timeout(Duration::from_millis(100), wrong.recv()).await;
    assert!(nothing.is_err());

    client.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_headers_and_empty_payload() {
    common::init();
    let server = TestServer::spawn().await;

    let client = Client::new(server.address());
    client.connect_mut().echo(true);
    client.connect().await.unwrap();

    let subject: Subject = "empty".parse().unwrap();
    let (_, mut subscriber) = client.subscribe(&subject, 4).await.unwrap();

    let headers = Headers::new();
    client
        .publish_with_headers(&subject, &headers, b"")
        .await
        .unwrap();

    let msg = subscriber.recv().await.unwrap();
    assert!(msg.headers().unwrap().is_empty());
    assert!(msg.payload().is_empty());

    client.dispose().await;
}
