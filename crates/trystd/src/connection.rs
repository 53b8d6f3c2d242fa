use crate::error::ServerError;
use crate::metrics::counters;
use crate::registry::{Outbound, DELIVERY_QUEUE_DEPTH};
use crate::router::{ConnContext, FrameDisposition};
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::WebSocketStream;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tungstenite::Message;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Accepts the WebSocket upgrade, enforces admission, and drives the
/// connection until it closes. One task per connection.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), ServerError> {
    // Bound the number of sockets that have not yet identified, so a flood
    // of idle upgrades cannot exhaust file descriptors.
    let _permit = state.pre_auth_semaphore.acquire().await.map_err(|_| {
        tracing::debug!("pre-auth semaphore closed");
        ServerError::ConnectionClosed
    })?;

    // The app-level size cap replies with an error frame; the transport cap
    // sits above it and only guards against grossly oversized frames.
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message_size * 4),
        max_frame_size: Some(state.config.max_message_size * 4),
        ..WebSocketConfig::default()
    };

    let client_ip = Arc::new(std::sync::OnceLock::new());
    let ip_cell = client_ip.clone();
    let callback_state = state.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, resp: Response| {
            admission_callback(req, resp, &callback_state, peer_addr, &ip_cell)
        },
        Some(ws_config),
    )
    .await
    .map_err(ServerError::WebSocket)?;

    let client_ip = client_ip.get().copied().unwrap_or_else(|| peer_addr.ip());
    counters::admissions_total("admitted");
    tracing::debug!(ip = %client_ip, "connection admitted");

    let (ws_tx, ws_rx) = ws_stream.split();
    let (deliver_tx, deliver_rx) = mpsc::channel::<Outbound>(DELIVERY_QUEUE_DEPTH);
    let mut ctx = ConnContext::new(deliver_tx, client_ip);

    let result = run_message_loop(ws_tx, ws_rx, deliver_rx, &state, &mut ctx).await;

    if let Some(binding) = ctx.binding.take() {
        state.router.handle_departure(&binding);
    }
    result
}

/// Header callback: extract the client IP and decide admission before the
/// upgrade completes.
fn admission_callback(
    req: &Request,
    resp: Response,
    state: &ServerState,
    peer_addr: SocketAddr,
    ip_cell: &std::sync::OnceLock<IpAddr>,
) -> Result<Response, ErrorResponse> {
    if req.uri().path() != "/" {
        counters::admissions_total("not_found");
        return Err(error_response(StatusCode::NOT_FOUND, "not found"));
    }

    // First forwarded-for entry, then the real-ip header, then the socket.
    let ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .or_else(|| {
            req.headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<IpAddr>().ok())
        })
        .unwrap_or_else(|| peer_addr.ip());
    let _ = ip_cell.set(ip);

    if state.security.is_ip_banned(ip) {
        counters::admissions_total("banned");
        tracing::debug!(%ip, "rejecting banned ip");
        return Err(error_response(StatusCode::FORBIDDEN, "banned"));
    }
    if !state.security.track_ip_connection(ip) {
        counters::admissions_total("rate_limited");
        tracing::debug!(%ip, "rejecting ip over connection rate");
        return Err(error_response(StatusCode::TOO_MANY_REQUESTS, "too many connections"));
    }

    Ok(resp)
}

fn error_response(status: StatusCode, body: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(body.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Drive the select loop for an admitted connection: inbound frames,
/// outbound deliveries, and the heartbeat.
async fn run_message_loop(
    mut ws_tx: WsSink,
    mut ws_rx: WsRecv,
    mut deliver_rx: mpsc::Receiver<Outbound>,
    state: &Arc<ServerState>,
    ctx: &mut ConnContext,
) -> Result<(), ServerError> {
    let mut ping_interval = interval(state.config.heartbeat_interval);
    let idle_timeout = state.config.connection_timeout;
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        ctx.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        ctx.stats.bytes_received.fetch_add(text.len() as u64, Ordering::Relaxed);
                        state.registry.record_inbound(text.len() as u64);

                        if state.router.handle_frame(ctx, &text) == FrameDisposition::CloseProtocol {
                            let _ = ws_tx
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Protocol,
                                    reason: "malformed frame".into(),
                                })))
                                .await;
                            return Err(ServerError::Protocol("undecodable frame"));
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!("ignoring binary frame on text protocol");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::debug!("failed to send pong: {}", e);
                        }
                    }
                    // Pongs only refresh last_activity, handled above.
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(ServerError::WebSocket(e)),
                    Some(Ok(_)) => {}
                }
            }
            out = deliver_rx.recv() => {
                match out {
                    Some(Outbound::Frame(json)) => {
                        ws_tx.send(Message::Text(json)).await.map_err(ServerError::WebSocket)?;
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        return Ok(());
                    }
                    None => return Ok(()),
                }
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    tracing::debug!("idle timeout reached, closing connection");
                    return Ok(());
                }
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                    tracing::debug!("failed to send ping: {}", e);
                }
            }
        }
    }
}
