//! WebSocket listener using tokio-tungstenite.
//!
//! Viewers connect to `/ws?id=<session id>`. The session id is taken from the
//! upgrade request; a request without one is refused with HTTP 400 before the
//! upgrade completes, and any other path gets HTTP 404.

use futures_util::SinkExt;
use ssho_core::{SshoError, SshoResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Path of the viewer endpoint.
pub const WS_PATH: &str = "/ws";

/// Query parameter carrying the session id.
pub const SESSION_ID_PARAM: &str = "id";

/// An upgraded viewer connection bound to a session id.
pub struct ViewerConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    pub session_id: String,
}

/// Why an upgrade request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    NotFound,
    MissingSessionId,
}

impl RouteError {
    fn status(self) -> StatusCode {
        match self {
            RouteError::NotFound => StatusCode::NOT_FOUND,
            RouteError::MissingSessionId => StatusCode::BAD_REQUEST,
        }
    }

    fn message(self) -> &'static str {
        match self {
            RouteError::NotFound => "Not found",
            RouteError::MissingSessionId => "Missing session ID",
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut resp = ErrorResponse::new(Some(self.message().to_string()));
        *resp.status_mut() = self.status();
        resp
    }
}

/// Extract the session id from an upgrade request target.
pub fn route(path: &str, query: Option<&str>) -> Result<String, RouteError> {
    if path != WS_PATH {
        return Err(RouteError::NotFound);
    }
    query
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(key, _)| key == SESSION_ID_PARAM)
                .map(|(_, value)| value.into_owned())
        })
        .filter(|id| !id.is_empty())
        .ok_or(RouteError::MissingSessionId)
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields upgraded viewer connections.
pub async fn start_listener(bind_addr: SocketAddr) -> SshoResult<mpsc::Receiver<ViewerConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| SshoError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<ViewerConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match upgrade(stream, addr).await {
                            Ok(conn) => {
                                if tx.send(conn).await.is_err() {
                                    warn!("viewer connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket upgrade failed");
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

/// Perform the WebSocket handshake, routing on the request target.
pub async fn upgrade(stream: TcpStream, remote_addr: SocketAddr) -> SshoResult<ViewerConnection> {
    let mut routed: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match route(req.uri().path(), req.uri().query()) {
            Ok(id) => {
                routed = Some(id);
                Ok(resp)
            }
            Err(e) => {
                debug!(
                    remote = %remote_addr,
                    uri = %req.uri(),
                    reason = e.message(),
                    "upgrade refused"
                );
                Err(e.into_response())
            }
        }
    })
    .await
    .map_err(|e| SshoError::Transport(format!("WS handshake failed: {e}")))?;

    let session_id = routed
        .ok_or_else(|| SshoError::Transport("handshake completed without a session id".into()))?;
    debug!(remote = %remote_addr, session_id = %session_id, "WebSocket connection accepted");
    Ok(ViewerConnection {
        ws_stream,
        remote_addr,
        session_id,
    })
}

/// Build a close frame with a normal close code.
pub fn close_message(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    }))
}

/// Report a failure as a text frame, then close the connection.
pub async fn send_error_and_close(
    ws: &mut WebSocketStream<TcpStream>,
    description: &str,
) -> SshoResult<()> {
    ws.send(Message::Text(format!("Error: {description}")))
        .await
        .map_err(|e| SshoError::Transport(format!("WS send failed: {e}")))?;
    ws.close(None)
        .await
        .map_err(|e| SshoError::Transport(format!("WS close failed: {e}")))
}
