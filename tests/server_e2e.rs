//! End-to-end tests against a relay on ephemeral ports

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use portal_mux::config::{RelayConfig, StaticChannel};
use portal_mux::core::channel_name::ChannelName;
use portal_mux::core::envelope::{open, EnvelopeCodec, SharedSecret};
use portal_mux::mux::directory::{Direction, MemoryDirectory};
use portal_mux::mux::Multiplexer;
use portal_mux::protocol::command::Reply;
use portal_mux::protocol::frame::{Frame, FrameTag};
use portal_mux::transport::{self, BinaryClient, ServerHandle, TextClient};
use portal_mux::utils::SerialRegistry;
use portal_mux::PortalError;
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "foobar";

struct Relay {
    directory: Arc<MemoryDirectory>,
    mux: Arc<Multiplexer>,
    server: ServerHandle,
}

fn name(s: &str) -> ChannelName {
    ChannelName::parse(s).unwrap()
}

fn start<F: FnOnce(&mut RelayConfig)>(mutator: F) -> Relay {
    let config = RelayConfig::default_with_overrides(|c| {
        c.server.name = "relay1".into();
        c.server.banner = "test relay".into();
        c.server.text_address = "127.0.0.1:0".into();
        c.server.binary_address = Some("127.0.0.1:0".into());
        c.channels.update_delay = Duration::from_millis(5);
        c.channels.max_update_delay = Duration::from_millis(50);
        c.channels.static_channels = vec![
            StaticChannel {
                name: name("news"),
                password: None,
                direction: Direction::Out,
            },
            StaticChannel {
                name: name("drop/box"),
                password: None,
                direction: Direction::In,
            },
            StaticChannel {
                name: name("vault"),
                password: Some("s3cret".into()),
                direction: Direction::Out,
            },
        ];
        mutator(c);
    });

    let directory = MemoryDirectory::new(tokio::runtime::Handle::current(), &config.channels);
    let registry = Arc::new(SerialRegistry::new(config.security.max_serial_lifetime));
    let mux = Arc::new(Multiplexer::new(
        directory.clone(),
        EnvelopeCodec::new(SharedSecret::from(SECRET), registry),
    ));
    directory.attach(&mux);
    let server = transport::spawn(&config.server, Arc::clone(&mux)).expect("relay should bind");

    Relay {
        directory,
        mux,
        server,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn next_item(client: &mut TextClient) -> (ChannelName, bytes::Bytes) {
    let reply = tokio::time::timeout(Duration::from_secs(5), client.receive())
        .await
        .expect("item should arrive")
        .unwrap();
    match reply {
        Reply::Item { channel, envelope } => (channel, envelope),
        other => panic!("expected ITEM, got {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_greeting_names_the_relay() {
    let relay = start(|_| {});
    let client = TextClient::connect(relay.server.text_addr()).await.unwrap();
    assert_eq!(client.greeting().to_string(), "220 relay1 test relay");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_text_publish_submit_roundtrip() {
    let relay = start(|_| {});
    let mut subscriber = TextClient::connect(relay.server.text_addr()).await.unwrap();
    let mut submitter = TextClient::connect(relay.server.text_addr()).await.unwrap();

    assert_eq!(subscriber.subscribe(&name("news"), None).await.unwrap(), Reply::Ok);

    relay
        .directory
        .channel(&name("news"))
        .unwrap()
        .publish(&b"this is only a test"[..])
        .unwrap();

    let (channel, envelope) = next_item(&mut subscriber).await;
    assert_eq!(channel, name("news"));
    let (_, payload) = open(&SharedSecret::from(SECRET), &envelope).unwrap();
    assert_eq!(payload, b"this is only a test");

    // A second client hands the envelope back through another channel
    assert_eq!(
        submitter
            .submit(&name("drop/box"), envelope.clone())
            .await
            .unwrap(),
        Reply::Ok
    );
    let inbox = relay.directory.channel(&name("drop/box")).unwrap();
    assert_eq!(
        inbox.drain_inbox().unwrap(),
        vec![bytes::Bytes::from_static(b"this is only a test")]
    );

    // Replays are refused with the generic reason
    assert_eq!(
        submitter.submit(&name("drop/box"), envelope).await.unwrap(),
        Reply::Error("Invalid arguments: Invalid or replayed message".into())
    );

    assert_eq!(submitter.quit().await.unwrap(), Reply::Closing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_text_errors_keep_connection_open() {
    let relay = start(|c| c.server.max_line_length = 64);
    let mut client = TextClient::connect(relay.server.text_addr()).await.unwrap();

    client.send_raw("HELO example.org").await.unwrap();
    assert_eq!(
        client.receive().await.unwrap(),
        Reply::Error("Command not supported".into())
    );

    client.send_raw("SUBSCRIBE").await.unwrap();
    assert_eq!(
        client.receive().await.unwrap(),
        Reply::Error("Invalid arguments: Invalid number of arguments (0)".into())
    );

    client.send_raw(&"A".repeat(200)).await.unwrap();
    assert_eq!(
        client.receive().await.unwrap(),
        Reply::Error("Line too long".into())
    );

    client.send_raw("SUBMIT news !!!").await.unwrap();
    assert_eq!(
        client.receive().await.unwrap(),
        Reply::Error("Invalid arguments: Invalid Base64-encoded message".into())
    );

    assert_eq!(
        client.subscribe(&name("vault"), Some("guess")).await.unwrap(),
        Reply::Error("Invalid arguments: Passwords do not match".into())
    );
    assert_eq!(
        client.subscribe(&name("vault"), Some("s3cret")).await.unwrap(),
        Reply::Ok
    );
    assert!(matches!(
        client.subscribe(&name("vault"), Some("s3cret")).await.unwrap(),
        Reply::Error(_)
    ));

    assert_eq!(client.quit().await.unwrap(), Reply::Closing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_releases_subscriptions() {
    let relay = start(|_| {});
    let mut client = TextClient::connect(relay.server.text_addr()).await.unwrap();
    assert_eq!(client.subscribe(&name("news"), None).await.unwrap(), Reply::Ok);
    assert_eq!(relay.mux.subscriber_count(&name("news")), 1);

    drop(client);
    let mux = Arc::clone(&relay.mux);
    assert!(eventually(|| mux.subscriber_count(&name("news")) == 0).await);

    // Nothing left to deliver to, so published items stay queued
    let news = relay.directory.channel(&name("news")).unwrap();
    news.publish(&b"unheard"[..]).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(news.outbox_len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_subscribe_and_submit() {
    let relay = start(|_| {});
    let addr = relay.server.binary_addr().expect("binary listener enabled");
    let mut client = BinaryClient::connect(addr).await.unwrap();

    // An unknown tag is dropped without closing the connection
    client
        .send(Frame::new(FrameTag::ItemDelivery, &b"\x04newsjunk"[..]))
        .await
        .unwrap();
    client.subscribe(&name("news")).await.unwrap();

    let mux = Arc::clone(&relay.mux);
    assert!(eventually(|| mux.subscriber_count(&name("news")) == 1).await);

    relay
        .directory
        .channel(&name("news"))
        .unwrap()
        .publish(&b"over the wire"[..])
        .unwrap();

    let (channel, envelope) = tokio::time::timeout(Duration::from_secs(5), client.receive())
        .await
        .expect("delivery should arrive")
        .unwrap();
    assert_eq!(channel, name("news"));

    client.submit(&name("drop/box"), &envelope).await.unwrap();
    let inbox = relay.directory.channel(&name("drop/box")).unwrap();
    assert!(eventually(|| inbox.inbox_len() == 1).await);
    assert_eq!(
        inbox.drain_inbox().unwrap(),
        vec![bytes::Bytes::from_static(b"over the wire")]
    );

    client.unsubscribe(&name("news")).await.unwrap();
    assert!(eventually(|| mux.subscriber_count(&name("news")) == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submission_reaches_subscribers_as_item() {
    let relay = start(|c| c.channels.inbox_capacity = 1);
    let mut text_subscriber = TextClient::connect(relay.server.text_addr()).await.unwrap();
    let mut binary_subscriber =
        BinaryClient::connect(relay.server.binary_addr().expect("binary listener enabled"))
            .await
            .unwrap();
    let mut submitter = TextClient::connect(relay.server.text_addr()).await.unwrap();

    assert_eq!(
        text_subscriber.subscribe(&name("drop/box"), None).await.unwrap(),
        Reply::Ok
    );
    binary_subscriber.subscribe(&name("drop/box")).await.unwrap();
    let mux = Arc::clone(&relay.mux);
    assert!(eventually(|| mux.subscriber_count(&name("drop/box")) == 2).await);

    // The first payload fills the inbox, the second overflows back out
    for payload in [&b"first"[..], b"second"] {
        let sealed = relay.mux.codec().seal(payload).unwrap();
        assert_eq!(
            submitter.submit(&name("drop/box"), sealed).await.unwrap(),
            Reply::Ok
        );
    }

    let secret = SharedSecret::from(SECRET);
    let (channel, envelope) = next_item(&mut text_subscriber).await;
    assert_eq!(channel, name("drop/box"));
    assert_eq!(open(&secret, &envelope).unwrap().1, b"second");

    let (channel, envelope) =
        tokio::time::timeout(Duration::from_secs(5), binary_subscriber.receive())
            .await
            .expect("delivery should arrive")
            .unwrap();
    assert_eq!(channel, name("drop/box"));
    assert_eq!(open(&secret, &envelope).unwrap().1, b"second");

    let inbox = relay.directory.channel(&name("drop/box")).unwrap();
    assert_eq!(
        inbox.drain_inbox().unwrap(),
        vec![bytes::Bytes::from_static(b"first")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fan_out_to_every_subscriber() {
    let relay = start(|_| {});
    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = TextClient::connect(relay.server.text_addr()).await.unwrap();
        assert_eq!(client.subscribe(&name("news"), None).await.unwrap(), Reply::Ok);
        clients.push(client);
    }

    let news = relay.directory.channel(&name("news")).unwrap();
    news.publish(&b"first"[..]).unwrap();
    news.publish(&b"second"[..]).unwrap();

    let secret = SharedSecret::from(SECRET);
    for client in &mut clients {
        let (_, a) = next_item(client).await;
        let (_, b) = next_item(client).await;
        assert_eq!(open(&secret, &a).unwrap().1, b"first");
        assert_eq!(open(&secret, &b).unwrap().1, b"second");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_limit_enforced() {
    let relay = start(|c| c.server.max_connections = 1);
    let _first = TextClient::connect(relay.server.text_addr()).await.unwrap();

    let second = TextClient::connect(relay.server.text_addr()).await;
    assert!(matches!(
        second,
        Err(PortalError::ConnectionClosed) | Err(PortalError::Io(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_connections() {
    let relay = start(|_| {});
    let mut client = TextClient::connect(relay.server.text_addr()).await.unwrap();
    assert_eq!(client.subscribe(&name("news"), None).await.unwrap(), Reply::Ok);

    let server = relay.server;
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(relay.mux.subscriber_count(&name("news")), 0);
    assert!(client.receive().await.is_err());
}
