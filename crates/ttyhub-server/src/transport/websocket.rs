//! WebSocket listener for viewers, using tokio-tungstenite.
//!
//! Viewer input arrives as text or binary messages and is treated as a raw
//! byte stream; outbound frames are always sent as binary.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use ttyhub_core::{HubError, HubResult};

/// An accepted viewer connection.
pub struct ViewerConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// `connect-pid=` from the request URI, if present.
    pub connect_pid: Option<u32>,
    /// `attach=` session specifier from the request URI, if present.
    pub attach: Option<String>,
}

/// Bind `bind_addr` and accept WebSocket upgrades in the background.
///
/// Returns a receiver that yields accepted connections.
pub async fn start_listener(bind_addr: SocketAddr) -> HubResult<mpsc::Receiver<ViewerConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| HubError::Transport(format!("bind {bind_addr} failed: {e}")))?;

    info!(addr = %bind_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<ViewerConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut connect_pid = None;
                        let mut attach = None;
                        let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            if let Some(query) = req.uri().query() {
                                connect_pid = parse_connect_pid(query);
                                attach = query_param(query, "attach").map(str::to_owned);
                            }
                            Ok(resp)
                        };
                        let accepted = tokio_tungstenite::accept_hdr_async(stream, capture).await;
                        match accepted {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, ?connect_pid, ?attach, "WebSocket connection accepted");
                                let conn = ViewerConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    connect_pid,
                                    attach,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("viewer connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

/// Value of `name=` in a query string.
pub fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Value of `connect-pid=` in a query string.
pub fn parse_connect_pid(query: &str) -> Option<u32> {
    query_param(query, "connect-pid").and_then(|pid| pid.parse().ok())
}

/// Send one binary message.
pub async fn ws_send_binary(ws: &mut WebSocketStream<TcpStream>, data: Vec<u8>) -> HubResult<()> {
    ws.send(Message::Binary(data.into()))
        .await
        .map_err(|e| HubError::Transport(format!("WS send failed: {e}")))
}

/// Largest inbound message accepted from a viewer.
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Receive the next chunk of viewer bytes, from either a text or a binary
/// message.
///
/// Returns `None` once the connection is closed.
pub async fn ws_recv(ws: &mut WebSocketStream<TcpStream>) -> HubResult<Option<Vec<u8>>> {
    loop {
        let data = match ws.next().await {
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(HubError::Transport(format!("WS recv failed: {e}"))),
        };
        if data.len() > MAX_WS_FRAME_SIZE {
            return Err(HubError::Transport(format!(
                "WS frame too large: {} bytes (max {MAX_WS_FRAME_SIZE})",
                data.len()
            )));
        }
        return Ok(Some(data));
    }
}
