use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::SinkExt;
use geobridge_core::{
    Bridge, BridgeOptions, SourceId,
    memory::{InMemoryBroker, InMemoryDeadLetterSink},
};
use geobridge_ws::WsIngestor;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

struct TestServer {
    bridge: Bridge,
    broker: Arc<InMemoryBroker>,
    address: SocketAddr,
    ct: CancellationToken,
    server: JoinHandle<()>,
}

async fn start_server() -> TestServer {
    let broker = Arc::new(InMemoryBroker::new());
    let dead_letter = Arc::new(InMemoryDeadLetterSink::new());
    let bridge =
        Bridge::start(BridgeOptions::default(), broker.clone(), dead_letter).expect("bridge start");

    let router = WsIngestor::new(bridge.handle()).into_router();
    let listener = geobridge_ws::bind("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind");
    let address = listener.local_addr().expect("local addr");

    let ct = CancellationToken::new();
    let server = tokio::spawn({
        let ct = ct.clone();
        async move {
            geobridge_ws::serve(listener, router, ct)
                .await
                .expect("serve");
        }
    });

    TestServer {
        bridge,
        broker,
        address,
        ct,
        server,
    }
}

async fn wait_for_published(broker: &InMemoryBroker, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while broker.published().await.len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for published records");
}

#[tokio::test]
async fn test_records_flow_from_websocket_to_broker() {
    let server = start_server().await;
    let url = format!("ws://{}/ws", server.address);

    let (mut socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("connect");

    socket
        .send(Message::text("garbage"))
        .await
        .expect("send");

    for i in 0..3 {
        let message = serde_json::json!({"obuid": 17, "lat": 40.0 + i as f64, "lon": -74.0});
        socket
            .send(Message::text(message.to_string()))
            .await
            .expect("send");
    }
    socket
        .send(Message::binary(br#"{"obuid": 18, "lat": 1.0, "lon": 2.0}"#.to_vec()))
        .await
        .expect("send");

    wait_for_published(&server.broker, 4).await;

    let records = server.broker.records().await;
    let latitudes = records
        .iter()
        .filter(|r| r.source_id() == SourceId(17))
        .map(|r| r.latitude())
        .collect::<Vec<_>>();
    assert_eq!(latitudes, vec![40.0, 41.0, 42.0]);

    let handle = server.bridge.handle();
    let sessions = handle.sessions();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].peer.starts_with("127.0.0.1:"));

    let stats = handle.stats();
    assert_eq!(stats.decode_errors, 1);

    socket.close(None).await.expect("close");

    server.bridge.shutdown(Duration::from_secs(2)).await;
    server.ct.cancel();
    server.server.await.expect("server task");
}

#[tokio::test]
async fn test_upgrade_refused_while_shutting_down() {
    let server = start_server().await;
    let handle = server.bridge.handle();

    server.bridge.shutdown(Duration::from_secs(1)).await;
    assert!(handle.is_shutting_down());

    let url = format!("ws://{}/ws", server.address);
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 503),
        other => panic!("unexpected error: {other:?}"),
    }

    server.ct.cancel();
    server.server.await.expect("server task");
}

#[tokio::test]
async fn test_plain_get_is_rejected() {
    let server = start_server().await;

    let mut stream = TcpStream::connect(server.address).await.expect("connect");
    stream
        .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("write");

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("read");
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 4"), "{response}");

    server.bridge.shutdown(Duration::from_secs(1)).await;
    server.ct.cancel();
    server.server.await.expect("server task");
}
