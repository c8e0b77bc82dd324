//! WebSocket transport adapter.
//!
//! Devices connect to `ws://<host>/wssk/<partitionKey>/<rowKey>` with the
//! protocol selector in `Sec-WebSocket-Protocol`. This module is a thin
//! binding of that to [`MessageTransport`]; nothing protocol-specific
//! lives here.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use devlink_integration_sdk::DevicePath;

use crate::endpoint::{Gateway, IncomingConnection};
use crate::transport::{MessageTransport, TransportError};

/// URL prefix for device sessions.
const ROUTE_PREFIX: &str = "/wssk/";

/// Failures before a WebSocket connection becomes a device session.
#[derive(Debug)]
pub enum AcceptError {
    /// Path did not match `/wssk/<partitionKey>/<rowKey>`.
    BadPath(String),
    /// WebSocket upgrade failed.
    Upgrade(String),
}

impl std::fmt::Display for AcceptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadPath(path) => write!(f, "unrecognized path: {path}"),
            Self::Upgrade(msg) => write!(f, "websocket upgrade failed: {msg}"),
        }
    }
}

impl std::error::Error for AcceptError {}

/// [`MessageTransport`] over a server-side WebSocket.
pub struct WsTransport {
    ws: WebSocketStream<TcpStream>,
    closed: bool,
}

#[async_trait]
impl MessageTransport for WsTransport {
    async fn send(&mut self, record: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.ws
            .send(Message::Binary(record.to_vec()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(bytes)),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                // Control frames are answered by the protocol layer
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }

    async fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Owned(reason.to_string()),
        };
        if let Err(e) = self.ws.close(Some(frame)).await {
            debug!(error = %e, "websocket close failed");
        }
    }
}

/// Upgrade one TCP stream, capturing the path and the first offered
/// subprotocol (echoed back so the device accepts the upgrade).
pub async fn accept(stream: TcpStream) -> Result<IncomingConnection<WsTransport>, AcceptError> {
    let mut request_path = String::new();
    let mut selector = String::new();

    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        request_path = req.uri().path().to_string();
        if let Some(protocols) = req.headers().get("Sec-WebSocket-Protocol") {
            let first = protocols
                .to_str()
                .unwrap_or_default()
                .split(',')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
            if let Ok(value) = HeaderValue::from_str(&first) {
                resp.headers_mut().insert("Sec-WebSocket-Protocol", value);
            }
            selector = first;
        }
        Ok(resp)
    };

    let ws = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| AcceptError::Upgrade(e.to_string()))?;

    let path = parse_route(&request_path).ok_or(AcceptError::BadPath(request_path))?;
    Ok(IncomingConnection {
        selector,
        path,
        transport: WsTransport { ws, closed: false },
    })
}

/// `/wssk/<partitionKey>/<rowKey>` with both segments non-empty.
fn parse_route(path: &str) -> Option<DevicePath> {
    let rest = path.strip_prefix(ROUTE_PREFIX)?;
    let (partition_key, row_key) = rest.split_once('/')?;
    if partition_key.is_empty() || row_key.is_empty() || row_key.contains('/') {
        return None;
    }
    Some(DevicePath::new(partition_key, row_key))
}

/// Accept loop: one spawned task per device connection.
pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "gateway listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let gateway = gateway.clone();
        tokio::spawn(async move {
            match accept(stream).await {
                Ok(conn) => gateway.handle_connection(conn).await,
                Err(e) => warn!(%peer, error = %e, "connection rejected"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route() {
        assert_eq!(
            parse_route("/wssk/fleet1/dev42"),
            Some(DevicePath::new("fleet1", "dev42"))
        );
        assert_eq!(parse_route("/wssk/fleet1"), None);
        assert_eq!(parse_route("/wssk//dev42"), None);
        assert_eq!(parse_route("/wssk/a/b/c"), None);
        assert_eq!(parse_route("/other/fleet1/dev42"), None);
    }
}
