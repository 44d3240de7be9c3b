//! End-to-end tests over a real socket
//!
//! Each test starts a broker on an ephemeral port and talks to it the way a
//! gateway client would.

use blockfeed::auth::{AdminKey, ApiKey, StaticKeyAuthorizer};
use blockfeed::config::BrokerConfig;
use blockfeed::events::Transaction;
use blockfeed::server::{Broker, Command, Reply};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const API_KEY: &str = "0xe2e-subscriber";
const ADMIN_KEY: &str = "e2e-admin";

struct TestBroker {
    broker: Arc<Broker>,
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestBroker {
    async fn start() -> Self {
        let config = BrokerConfig::default()
            .with_queue_capacity(32)
            .with_admin_key(AdminKey::new(ADMIN_KEY.to_string()));
        let authorizer = StaticKeyAuthorizer::new([ApiKey::new(API_KEY)]);
        let broker = Arc::new(Broker::new(config, Arc::new(authorizer)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown, rx) = oneshot::channel::<()>();
        let server = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .serve(listener, async move {
                        let _ = rx.await;
                    })
                    .await
            })
        };

        Self {
            broker,
            addr,
            shutdown: Some(shutdown),
            server,
        }
    }

    async fn connect(&self) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/v1/ws", self.addr))
            .await
            .expect("websocket handshake failed");
        ws
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        timeout(Duration::from_secs(5), self.server)
            .await
            .expect("broker did not shut down")
            .unwrap()
            .unwrap();
    }
}

async fn send_command(ws: &mut Client, command: &Command) {
    ws.send(Message::Text(command.encode().unwrap().into()))
        .await
        .unwrap();
}

async fn next_text(ws: &mut Client) -> String {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return text.as_str().to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn next_reply(ws: &mut Client) -> Reply {
    serde_json::from_str(&next_text(ws).await).unwrap()
}

/// Raw HTTP/1.1 POST, returns (status code, body)
async fn http_post(addr: SocketAddr, path: &str, auth: Option<&str>, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        path,
        addr,
        body.len()
    );
    if let Some(auth) = auth {
        request.push_str(&format!("Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");
    request.push_str(body);

    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .expect("timed out waiting for HTTP response")
        .unwrap();

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn test_subscribe_and_receive_event() {
    let server = TestBroker::start().await;
    let mut ws = server.connect().await;

    send_command(&mut ws, &Command::subscribe("transaction/0xA/*", API_KEY)).await;
    assert_eq!(
        next_reply(&mut ws).await,
        Reply::ok("Subscribed to `transaction/0xA/*`")
    );

    let tx = Transaction {
        hash: "0xfeed".into(),
        from: "0xA".into(),
        to: "0xB".into(),
        ..Default::default()
    };
    let report = server.broker.dispatcher().publish_event(&tx).unwrap();
    assert_eq!(report.delivered, 1);

    let received: Transaction = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(received, tx);

    server.stop().await;
}

#[tokio::test]
async fn test_bad_key_and_bad_payload_keep_connection() {
    let server = TestBroker::start().await;
    let mut ws = server.connect().await;

    send_command(&mut ws, &Command::subscribe("block", "0xwrong")).await;
    assert_eq!(next_reply(&mut ws).await, Reply::error("Bad API Key"));

    ws.send(Message::Text("{\"name\":".into())).await.unwrap();
    assert_eq!(next_reply(&mut ws).await, Reply::error("Bad Payload"));

    send_command(&mut ws, &Command::subscribe("transaction/*", API_KEY)).await;
    let reply = next_reply(&mut ws).await;
    assert!(!reply.is_ok());
    assert!(reply.message.starts_with("Bad Topic"), "{}", reply.message);

    // Still usable
    send_command(&mut ws, &Command::subscribe("block", API_KEY)).await;
    assert!(next_reply(&mut ws).await.is_ok());
    assert_eq!(server.broker.registry().subscription_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = TestBroker::start().await;
    let mut ws = server.connect().await;

    send_command(&mut ws, &Command::subscribe("block", API_KEY)).await;
    next_reply(&mut ws).await;

    server.broker.publish("block", r#"{"number":1}"#).unwrap();
    assert_eq!(next_text(&mut ws).await, r#"{"number":1}"#);

    send_command(&mut ws, &Command::unsubscribe("block", "")).await;
    assert_eq!(next_reply(&mut ws).await, Reply::ok("Unsubscribed from `block`"));

    let report = server.broker.publish("block", r#"{"number":2}"#).unwrap();
    assert_eq!(report.matched, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_removes_session() {
    let server = TestBroker::start().await;
    let mut ws = server.connect().await;

    send_command(&mut ws, &Command::subscribe("event/*/*/*/*/*", API_KEY)).await;
    next_reply(&mut ws).await;
    assert_eq!(server.broker.session_count(), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    // Cleanup happens on the server's connection task
    let registry = server.broker.registry();
    timeout(Duration::from_secs(5), async {
        while registry.session_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session was not removed");
    assert_eq!(registry.subscription_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_http_publish() {
    let server = TestBroker::start().await;
    let mut ws = server.connect().await;

    send_command(&mut ws, &Command::subscribe("event/0xC/*/*/*/*", API_KEY)).await;
    next_reply(&mut ws).await;

    let body = r#"{"topic":"event/0xC/0xT0///","payload":{"origin":"0xC","index":3}}"#;
    let bearer = format!("Bearer {}", ADMIN_KEY);

    let (status, _) = http_post(server.addr, "/v1/publish", None, body).await;
    assert_eq!(status, 401);

    let (status, _) = http_post(server.addr, "/v1/publish", Some("Bearer nope"), body).await;
    assert_eq!(status, 401);

    let bad_topic = r#"{"topic":"event/*/0xT0///","payload":{}}"#;
    let (status, _) = http_post(server.addr, "/v1/publish", Some(&bearer), bad_topic).await;
    assert_eq!(status, 400);

    let (status, response) = http_post(server.addr, "/v1/publish", Some(&bearer), body).await;
    assert_eq!(status, 200);
    assert!(response.contains(r#""delivered":1"#), "{}", response);

    let received: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(received["origin"], "0xC");
    assert_eq!(received["index"], 3);

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let server = TestBroker::start().await;
    let mut ws = server.connect().await;

    send_command(&mut ws, &Command::subscribe("block", API_KEY)).await;
    next_reply(&mut ws).await;

    let registry = server.broker.registry();
    server.stop().await;
    assert_eq!(registry.session_count(), 0);

    // Either a close frame or the end of the stream
    let next = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("client was not disconnected");
    assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
}
