//! Core server: accepts viewer connections and runs one handler per viewer.
//!
//! A handler resolves its session, registers an outbound queue, sends the
//! replay snapshot, then pumps two directions until either side ends:
//! queued PTY output goes out as binary frames, inbound frames are applied
//! to the PTY (binary = input, text = resize control).

use crate::config::ServerConfig;
use crate::session::{PtyBackend, Session, SessionRegistry, ShellBackend, ViewerId};
use crate::transport::websocket::{self, ViewerConnection};
use futures_util::{SinkExt, StreamExt};
use ssho_core::{ClientMessage, SshoError, SshoResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Close reason sent when the shell exits.
const REASON_SESSION_ENDED: &str = "session ended";
/// Close reason sent when a viewer's queue overflowed.
const REASON_TOO_SLOW: &str = "viewer too slow";

/// The ssho server instance.
pub struct SshoServer {
    config: ServerConfig,
    registry: SessionRegistry,
}

impl SshoServer {
    /// Create a server spawning the configured shell.
    pub fn new(config: ServerConfig) -> Self {
        let backend = Arc::new(ShellBackend::new(config.shell.clone(), config.term.clone()));
        Self::with_backend(config, backend)
    }

    /// Create a server over an arbitrary PTY backend.
    pub fn with_backend(config: ServerConfig, backend: Arc<dyn PtyBackend>) -> Self {
        let registry = SessionRegistry::new(backend, config.session_settings());
        Self { config, registry }
    }

    /// Access the session registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Listen for viewers until the listener shuts down.
    pub async fn run(self) -> SshoResult<()> {
        let server = Arc::new(self);
        let mut ws_rx = websocket::start_listener(server.config.listen_addr()).await?;

        info!(
            addr = %server.config.listen_addr(),
            shell = %server.config.shell,
            "ssho server running"
        );

        while let Some(conn) = ws_rx.recv().await {
            let server = server.clone();
            tokio::spawn(async move {
                let remote = conn.remote_addr;
                if let Err(e) = server.handle_viewer(conn).await {
                    warn!(remote = %remote, error = %e, "viewer connection error");
                }
            });
        }

        Ok(())
    }

    /// Serve one viewer from attach to detach.
    pub async fn handle_viewer(&self, conn: ViewerConnection) -> SshoResult<()> {
        let ViewerConnection {
            mut ws_stream,
            remote_addr,
            session_id,
        } = conn;

        let session = match self.registry.resolve(&session_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    remote = %remote_addr,
                    session_id = %session_id,
                    error = %e,
                    "session unavailable"
                );
                let _ = websocket::send_error_and_close(&mut ws_stream, &e.to_string()).await;
                return Err(e);
            }
        };

        let (sink, mut outbound) = mpsc::channel::<Vec<u8>>(self.config.client_queue);
        let Some(attachment) = session.attach(sink).await else {
            // Lost the race with the shell exiting.
            let _ = ws_stream.send(websocket::close_message(REASON_SESSION_ENDED)).await;
            return Ok(());
        };
        let viewer_id = attachment.viewer_id;
        info!(remote = %remote_addr, session_id = %session_id, viewer_id, "viewer connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let result = async {
            if !attachment.replay.is_empty() {
                ws_tx
                    .send(Message::Binary(attachment.replay))
                    .await
                    .map_err(|e| SshoError::Delivery(format!("replay send failed: {e}")))?;
            }

            loop {
                tokio::select! {
                    queued = outbound.recv() => match queued {
                        Some(data) => {
                            ws_tx
                                .send(Message::Binary(data))
                                .await
                                .map_err(|e| SshoError::Delivery(format!("WS send failed: {e}")))?;
                        }
                        None => {
                            let reason = close_reason(&session, viewer_id).await;
                            debug!(session_id = %session_id, viewer_id, reason, "closing viewer");
                            let _ = ws_tx.send(websocket::close_message(reason)).await;
                            break;
                        }
                    },

                    inbound = ws_rx.next() => match inbound {
                        Some(Ok(Message::Binary(data))) => {
                            apply(&session, ClientMessage::from_binary(data)).await;
                        }
                        Some(Ok(Message::Text(text))) => {
                            apply(&session, ClientMessage::from_text(&text)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(session_id = %session_id, viewer_id, "viewer closed connection");
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!(
                                session_id = %session_id,
                                viewer_id,
                                error = %e,
                                "viewer read failed"
                            );
                            break;
                        }
                    },
                }
            }
            Ok::<(), SshoError>(())
        }
        .await;

        session.detach(viewer_id).await;
        let sessions = self.registry.len().await;
        info!(
            remote = %remote_addr,
            session_id = %session_id,
            viewer_id,
            sessions,
            "viewer disconnected"
        );
        result
    }
}

/// Close reason for a viewer whose outbound queue was closed by the session.
async fn close_reason(session: &Session, viewer_id: ViewerId) -> &'static str {
    if session.take_eviction(viewer_id).await {
        REASON_TOO_SLOW
    } else {
        REASON_SESSION_ENDED
    }
}

/// Apply one inbound viewer message to the session's PTY.
async fn apply(session: &Session, msg: ClientMessage) {
    match msg {
        ClientMessage::Data(data) => {
            if let Err(e) = session.pty().write(data).await {
                debug!(session_id = %session.id(), error = %e, "PTY write failed");
            }
        }
        ClientMessage::Resize { rows, cols } => {
            if let Err(e) = session.pty().resize(rows, cols) {
                warn!(session_id = %session.id(), rows, cols, error = %e, "PTY resize failed");
            }
        }
        ClientMessage::Unknown => {
            debug!(session_id = %session.id(), "ignoring unrecognized control message");
        }
    }
}
