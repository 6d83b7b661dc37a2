use crate::broker::{Broker, BrokerService};
use crate::client::StreamClient;
use crate::config::Settings;
use crate::transport::message::ClientMessage;
use crate::transport::udp::PeerTable;
use crate::transport::{DatagramServer, StreamServer};
use crate::utils::error::USAGE;
use crate::utils::{ProtocolError, TransportError};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.stream.port = 0;
    settings.datagram.port = 0;
    settings
}

async fn start_stream() -> (BrokerService, Broker, StreamServer) {
    let settings = test_settings();
    let service = BrokerService::start(&settings.broker);
    let broker = service.handle();
    let server = StreamServer::start(&settings.stream, broker.clone())
        .await
        .expect("bind stream server");
    (service, broker, server)
}

async fn start_datagram() -> (BrokerService, Broker, DatagramServer) {
    let settings = test_settings();
    let service = BrokerService::start(&settings.broker);
    let broker = service.handle();
    let server = DatagramServer::start(&settings.datagram, broker.clone())
        .await
        .expect("bind datagram server");
    (service, broker, server)
}

async fn udp_client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn udp_request(socket: &UdpSocket, server: SocketAddr, request: &str) -> String {
    socket.send_to(request.as_bytes(), server).await.unwrap();
    udp_recv(socket).await
}

async fn udp_recv(socket: &UdpSocket) -> String {
    let mut buf = [0u8; 1024];
    let (len, _) = within(socket.recv_from(&mut buf)).await.unwrap();
    String::from_utf8(buf[..len].to_vec()).unwrap()
}

#[test]
fn test_parse_accepts_both_methods_in_any_case() {
    assert_eq!(
        ClientMessage::parse("pub:a:hello\n"),
        Ok(ClientMessage::Publish {
            topic: "a".to_string(),
            payload: "hello".to_string(),
        })
    );
    assert_eq!(
        ClientMessage::parse("Sub:weather\r\n"),
        Ok(ClientMessage::Subscribe {
            topic: "weather".to_string(),
        })
    );
}

#[test]
fn test_parse_keeps_colons_in_payload() {
    assert_eq!(
        ClientMessage::parse("PUB:clock:12:30:00"),
        Ok(ClientMessage::Publish {
            topic: "clock".to_string(),
            payload: "12:30:00".to_string(),
        })
    );
}

#[test]
fn test_parse_rejects_wrong_shapes() {
    for line in ["PUB:a", "SUB:a:b", "GET:a", "", "hello", "SUB:", "PUB::x"] {
        assert_eq!(ClientMessage::parse(line), Err(ProtocolError::Usage), "{line:?}");
    }
}

#[tokio::test]
async fn test_stream_weather_scenario() {
    let (service, _broker, server) = start_stream().await;
    let addr = server.local_addr();

    let mut producer = StreamClient::connect(addr).await.unwrap();
    let mut consumer = StreamClient::connect(addr).await.unwrap();

    let ack = within(producer.publish("weather", "sunny")).await.unwrap();
    assert_eq!(ack, "Published message to: weather");

    let ack = within(consumer.subscribe("weather")).await.unwrap();
    assert_eq!(ack, "Subscribed to: weather");

    within(producer.publish("weather", "rainy")).await.unwrap();
    let delivered = within(consumer.next_line()).await.unwrap();
    assert_eq!(delivered.as_deref(), Some("rainy"));

    within(server.stop()).await;
    service.stop().await;
}

#[tokio::test]
async fn test_stream_malformed_request_keeps_connection() {
    let (service, broker, server) = start_stream().await;
    let mut client = StreamClient::connect(server.local_addr()).await.unwrap();

    client.send_line("PUB:a").await.unwrap();
    let reply = within(client.next_line()).await.unwrap().unwrap();
    assert_eq!(format!("{reply}\n"), USAGE);
    assert_eq!(broker.latest("a").await.unwrap(), None);

    client.send_line("SUB:a:b").await.unwrap();
    let reply = within(client.next_line()).await.unwrap().unwrap();
    assert_eq!(format!("{reply}\n"), USAGE);

    let ack = within(client.publish("a", "hello")).await.unwrap();
    assert_eq!(ack, "Published message to: a");
    assert_eq!(broker.topic_count().await.unwrap(), 1);

    within(server.stop()).await;
    service.stop().await;
}

#[tokio::test]
async fn test_stream_subscriber_sees_only_its_topic() {
    let (service, _broker, server) = start_stream().await;
    let addr = server.local_addr();

    let mut producer = StreamClient::connect(addr).await.unwrap();
    let mut consumer = StreamClient::connect(addr).await.unwrap();
    within(consumer.subscribe("a")).await.unwrap();

    within(producer.publish("b", "for-b")).await.unwrap();
    within(producer.publish("a", "for-a:1")).await.unwrap();
    within(producer.publish("a", "for-a:2")).await.unwrap();

    assert_eq!(
        within(consumer.next_line()).await.unwrap().as_deref(),
        Some("for-a:1")
    );
    assert_eq!(
        within(consumer.next_line()).await.unwrap().as_deref(),
        Some("for-a:2")
    );

    within(server.stop()).await;
    service.stop().await;
}

#[tokio::test]
async fn test_stream_disconnect_releases_subscriptions() {
    let (service, broker, server) = start_stream().await;

    let mut consumer = StreamClient::connect(server.local_addr()).await.unwrap();
    within(consumer.subscribe("t")).await.unwrap();
    assert_eq!(broker.subscriber_count("t").await.unwrap(), 1);

    drop(consumer);
    within(async {
        while broker.subscriber_count("t").await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    within(server.stop()).await;
    service.stop().await;
}

#[tokio::test]
async fn test_stream_stop_drains_connections() {
    let (service, _broker, server) = start_stream().await;
    let addr = server.local_addr();

    let mut first = StreamClient::connect(addr).await.unwrap();
    let mut second = StreamClient::connect(addr).await.unwrap();
    within(first.subscribe("idle")).await.unwrap();
    within(second.publish("idle", "x")).await.unwrap();
    assert_eq!(within(first.next_line()).await.unwrap().as_deref(), Some("x"));
    assert_eq!(server.live_connections().await, 2);

    within(server.stop()).await;

    // both connections were closed by the server before stop returned
    assert_eq!(within(first.next_line()).await.unwrap(), None);
    assert_eq!(within(second.next_line()).await.unwrap(), None);
    assert!(TcpStream::connect(addr).await.is_err());

    service.stop().await;
}

#[tokio::test]
async fn test_stream_stop_with_client_that_never_reads() {
    let mut settings = test_settings();
    settings.stream.max_line_len = 1 << 20;
    let service = BrokerService::start(&settings.broker);
    let server = StreamServer::start(&settings.stream, service.handle())
        .await
        .expect("bind stream server");

    // subscribed to its own publishes, so every request produces 64 KiB of
    // output that is never read
    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
    socket.write_all(b"SUB:t\n").await.unwrap();
    let flood = tokio::spawn(async move {
        let line = format!("PUB:t:{}\n", "x".repeat(64 * 1024));
        for _ in 0..4000 {
            if socket.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        socket
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), server.stop()).await;
    assert!(stopped.is_ok(), "stop waited on a client that never reads");

    flood.abort();
    service.stop().await;
}

#[tokio::test]
async fn test_stream_oversized_line_closes_connection() {
    let mut settings = test_settings();
    settings.stream.max_line_len = 32;
    let service = BrokerService::start(&settings.broker);
    let broker = service.handle();
    let server = StreamServer::start(&settings.stream, broker.clone())
        .await
        .expect("bind stream server");
    let mut client = StreamClient::connect(server.local_addr()).await.unwrap();

    // 32 bytes with the terminator still fits
    let ack = within(client.publish("a", &"z".repeat(25))).await.unwrap();
    assert_eq!(ack, "Published message to: a");

    client
        .send_line(&format!("PUB:b:{}", "y".repeat(100)))
        .await
        .unwrap();
    // the usage line may be lost to a reset when the server hangs up
    if let Ok(Some(reply)) = within(client.next_line()).await {
        assert_eq!(format!("{reply}\n"), USAGE);
    }

    within(async {
        while server.live_connections().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(broker.latest("b").await.unwrap(), None);
    assert_eq!(broker.topic_count().await.unwrap(), 1);

    within(server.stop()).await;
    service.stop().await;
}

#[tokio::test]
async fn test_stream_reports_stopped_broker() {
    let (service, _broker, server) = start_stream().await;
    let mut client = StreamClient::connect(server.local_addr()).await.unwrap();
    service.stop().await;

    client.send_line("PUB:t:x").await.unwrap();
    let reply = within(client.next_line()).await.unwrap();
    assert_eq!(reply.as_deref(), Some("broker stopped"));

    within(server.stop()).await;
}

#[tokio::test]
async fn test_stream_bind_failure_is_reported() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut settings = test_settings();
    settings.stream.port = taken.local_addr().unwrap().port();

    let service = BrokerService::start(&settings.broker);
    let result = StreamServer::start(&settings.stream, service.handle()).await;
    assert!(matches!(result, Err(TransportError::Bind { .. })));

    service.stop().await;
}

#[tokio::test]
async fn test_datagram_publish_and_subscribe() {
    let (service, _broker, server) = start_datagram().await;
    let addr = server.local_addr();

    let producer = udp_client().await;
    let consumer = udp_client().await;

    let ack = udp_request(&producer, addr, "PUB:weather:sunny\n").await;
    assert_eq!(ack, "Published message to: weather\n");

    let ack = udp_request(&consumer, addr, "SUB:weather\n").await;
    assert_eq!(ack, "Subscribed to: weather\n");

    udp_request(&producer, addr, "pub:weather:rainy").await;
    assert_eq!(udp_recv(&consumer).await, "rainy");

    within(server.stop()).await;
    service.stop().await;
}

#[tokio::test]
async fn test_datagram_malformed_request_is_not_fatal() {
    let (service, broker, server) = start_datagram().await;
    let addr = server.local_addr();
    let client = udp_client().await;

    assert_eq!(udp_request(&client, addr, "BOGUS:a").await, USAGE);
    assert_eq!(udp_request(&client, addr, "PUB:a").await, USAGE);

    let ack = udp_request(&client, addr, "PUB:a:still-here").await;
    assert_eq!(ack, "Published message to: a\n");
    assert_eq!(broker.topic_count().await.unwrap(), 1);

    within(server.stop()).await;
    service.stop().await;
}

#[tokio::test]
async fn test_datagram_stop_word_ends_loop() {
    let (service, broker, server) = start_datagram().await;
    let addr = server.local_addr();

    let consumer = udp_client().await;
    udp_request(&consumer, addr, "SUB:t").await;
    assert_eq!(broker.subscriber_count("t").await.unwrap(), 1);

    consumer.send_to(b" STOP \n", addr).await.unwrap();
    within(server.stopped()).await;
    assert_eq!(broker.subscriber_count("t").await.unwrap(), 0);

    within(server.stop()).await;
    service.stop().await;
}

#[test]
fn test_peer_table_tracks_only_subscribed_peers() {
    let mut peers = PeerTable::default();
    let a: SocketAddr = "127.0.0.1:4000".parse().unwrap();
    let b: SocketAddr = "127.0.0.1:4001".parse().unwrap();

    // a peer without subscriptions is not remembered
    let owner = peers.owner(a);
    assert_ne!(peers.owner(a), owner);
    assert_eq!(peers.len(), 0);

    peers.subscribed(a, owner);
    let again = peers.owner(a);
    assert_eq!(again, owner);
    peers.subscribed(a, again);
    peers.owner(b);
    assert_eq!(peers.len(), 1);

    peers.released(a);
    assert_eq!(peers.owner(a), owner);
    peers.released(a);
    assert_eq!(peers.len(), 0);

    peers.released(b);
    assert_eq!(peers.len(), 0);
}
