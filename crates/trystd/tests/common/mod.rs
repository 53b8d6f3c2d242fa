use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use trystd::config::ServerConfig;
use trystd::server::ServerState;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        token_secret: None,
        queue_timeout: Duration::from_secs(300),
        max_queue_size: 100,
        max_connections_per_ip: 20,
        ban_duration: Duration::from_secs(86_400),
        heartbeat_interval: Duration::from_secs(30),
        connection_timeout: Duration::from_secs(60),
        messages_per_minute: 30,
        skips_per_minute: 10,
        reports_per_hour: 3,
        max_message_size: 10_240,
        max_message_length: 500,
        cleanup_interval: Duration::from_secs(60),
        mode_switch_timeout: Duration::from_secs(30),
        max_connections: 1000,
        message_encryption: false,
    }
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    start_on(listener, test_config(addr)).await
}

pub async fn start_server_with<F>(mutate: F) -> (SocketAddr, Arc<ServerState>)
where
    F: FnOnce(&mut ServerConfig),
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    mutate(&mut config);
    start_on(listener, config).await
}

async fn start_on(listener: TcpListener, config: ServerConfig) -> (SocketAddr, Arc<ServerState>) {
    let state = Arc::new(ServerState::new(config));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = trystd::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let addr = state.config.listen;
    (addr, state)
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    pub ws_rx: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
    pub user_id: String,
}

impl TestClient {
    /// Connects and identifies as `user_id`.
    pub async fn connect(addr: &SocketAddr, user_id: &str) -> Self {
        Self::connect_from(addr, user_id, None).await
    }

    /// Connects with a forwarded-for IP and identifies as `user_id`.
    pub async fn connect_from(addr: &SocketAddr, user_id: &str, ip: Option<&str>) -> Self {
        let mut client = Self::connect_unidentified(addr, ip).await;
        client.user_id = user_id.to_string();
        client
            .send(json!({
                "type": "identify",
                "userId": user_id,
                "fingerprint": format!("fp-{user_id}"),
            }))
            .await;
        // Every identify produces a user-count broadcast; recv helpers skip
        // them, so nothing to consume here.
        client
    }

    /// Connects without identifying.
    pub async fn connect_unidentified(addr: &SocketAddr, ip: Option<&str>) -> Self {
        let url = format!("ws://{addr}/");
        let mut req = url.into_client_request().unwrap();
        if let Some(ip) = ip {
            req.headers_mut()
                .insert("X-Forwarded-For", ip.parse().unwrap());
        }
        let (ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self {
            ws_tx,
            ws_rx,
            user_id: String::new(),
        }
    }

    pub async fn send(&mut self, value: Value) {
        self.send_raw(value.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: String) {
        self.ws_tx.send(Message::Text(text)).await.unwrap();
    }

    pub async fn join(&mut self, mode: &str) {
        let user_id = self.user_id.clone();
        self.send(json!({"type": format!("join-{mode}"), "userId": user_id}))
            .await;
    }

    /// Receives the next JSON frame, skipping transport pings and
    /// `user-count` broadcasts.
    pub async fn recv(&mut self) -> Value {
        self.recv_timeout(Duration::from_secs(5))
            .await
            .expect("timeout waiting for frame")
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            let msg = tokio::time::timeout(remaining, self.ws_rx.next())
                .await
                .ok()??
                .ok()?;
            match msg {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(&text).expect("frame is json");
                    if value["type"] == "user-count" {
                        continue;
                    }
                    return Some(value);
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }

    /// Receives until a frame of `kind` arrives, skipping everything else.
    pub async fn recv_kind(&mut self, kind: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timeout waiting for {kind}"
            );
            let value = self.recv().await;
            if value["type"] == kind {
                return value;
            }
        }
    }

    /// Asserts nothing (except skipped noise) arrives within `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) {
        if let Some(value) = self.recv_timeout(quiet).await {
            panic!("expected silence, got {value}");
        }
    }

    /// Waits for the server to close the connection.
    pub async fn expect_closed(&mut self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            match tokio::time::timeout(remaining, self.ws_rx.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return,
                Ok(Some(Ok(_))) => continue,
                Err(_) => panic!("timeout waiting for close"),
            }
        }
    }
}
