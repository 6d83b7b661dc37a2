use super::pubsub_client::{Client, ClientId};
use super::stream_client::StreamClient;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

#[test]
fn test_client_new() {
    let client = Client::new("127.0.0.1:4000".parse().unwrap());
    assert_eq!(client.peer.port(), 4000);
    assert!(client.id.to_string().starts_with("client-"));
}

#[test]
fn test_client_ids_are_unique() {
    assert_ne!(ClientId::new(), ClientId::new());
}

#[tokio::test]
async fn test_stream_client_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();
        let request = lines.next_line().await.unwrap().unwrap();
        write.write_all(b"ok\r\n").await.unwrap();
        request
    });

    let mut client = StreamClient::connect(addr).await.unwrap();
    let reply = client.publish("news", "a:b").await.unwrap();
    assert_eq!(reply, "ok");
    assert_eq!(server.await.unwrap(), "PUB:news:a:b");
    assert!(client.next_line().await.unwrap().is_none());
}
