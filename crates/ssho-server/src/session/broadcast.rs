//! A shared session and its broadcast loop.
//!
//! A [`Session`] owns one PTY, one [`HistoryBuffer`] and the set of attached
//! viewer sinks. History and the client set live behind a single lock so that
//! "append + fan out" (broadcast loop) and "register + snapshot" (attach) are
//! totally ordered: every byte reaches a viewer exactly once, either in its
//! replay snapshot or as a later live chunk.
//!
//! Viewer sinks are bounded queues drained by each viewer's own connection
//! task. The broadcast loop never waits on them; a viewer whose queue is full
//! or closed is dropped from the set.

use super::history::HistoryBuffer;
use super::pty::PtyHandle;
use super::registry::SessionRegistry;
use ssho_core::{SshoError, SshoResult};
use std::collections::{HashMap, HashSet};
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Outbound queue of one viewer. Each item is one binary frame.
pub type ViewerSink = mpsc::Sender<Vec<u8>>;

/// Identifies a viewer within its session's client set.
pub type ViewerId = u64;

/// Lifecycle of a session's shell process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Terminated,
}

/// State guarded by the per-session lock.
struct SessionState {
    history: HistoryBuffer,
    clients: HashMap<ViewerId, ViewerSink>,
    /// Viewers dropped because their queue was full, until they ask.
    evicted: HashSet<ViewerId>,
    status: SessionStatus,
}

/// Result of a successful attach.
#[derive(Debug)]
pub struct Attachment {
    pub viewer_id: ViewerId,
    /// History at the instant of registration; empty means "send no replay".
    pub replay: Vec<u8>,
}

/// One live shell shared by any number of viewers.
pub struct Session {
    id: String,
    pty: PtyHandle,
    state: Mutex<SessionState>,
    next_viewer_id: AtomicU64,
}

impl Session {
    pub(crate) fn new(id: String, pty: PtyHandle, history_limit: usize) -> Self {
        Self {
            id,
            pty,
            state: Mutex::new(SessionState {
                history: HistoryBuffer::new(history_limit),
                clients: HashMap::new(),
                evicted: HashSet::new(),
                status: SessionStatus::Running,
            }),
            next_viewer_id: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pty(&self) -> &PtyHandle {
        &self.pty
    }

    /// Register a viewer sink and snapshot history in one critical section.
    ///
    /// Returns `None` if the shell has already exited; the sink is not kept.
    pub async fn attach(&self, sink: ViewerSink) -> Option<Attachment> {
        let mut state = self.state.lock().await;
        if state.status == SessionStatus::Terminated {
            return None;
        }
        let viewer_id = self.next_viewer_id.fetch_add(1, Ordering::Relaxed);
        state.clients.insert(viewer_id, sink);
        let replay = state.history.snapshot();
        info!(
            session_id = %self.id,
            viewer_id,
            viewers = state.clients.len(),
            replay_bytes = replay.len(),
            "viewer attached"
        );
        Some(Attachment { viewer_id, replay })
    }

    /// Remove a viewer sink. Idempotent, and a no-op once the session ended.
    pub async fn detach(&self, viewer_id: ViewerId) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.clients.remove(&viewer_id).is_some();
        state.evicted.remove(&viewer_id);
        if removed {
            info!(
                session_id = %self.id,
                viewer_id,
                viewers = state.clients.len(),
                "viewer detached"
            );
        }
        removed
    }

    /// Append a chunk to history and enqueue it for every attached viewer.
    ///
    /// Viewers whose queue is full or closed are dropped; their connection
    /// task sees the queue close and disconnects.
    pub(crate) async fn publish(&self, chunk: Vec<u8>) {
        let mut state = self.state.lock().await;
        state.history.append(&chunk);

        let mut dropped = Vec::new();
        for (viewer_id, sink) in &state.clients {
            if let Err(e) = sink.try_send(chunk.clone()) {
                let full = matches!(e, mpsc::error::TrySendError::Full(_));
                let reason = if full { "viewer queue full" } else { "viewer disconnected" };
                warn!(session_id = %self.id, viewer_id, reason, "dropping viewer");
                dropped.push((*viewer_id, full));
            }
        }
        for (viewer_id, full) in dropped {
            state.clients.remove(&viewer_id);
            if full {
                state.evicted.insert(viewer_id);
            }
        }
    }

    /// Whether `viewer_id` was dropped for falling behind. Clears the record.
    pub async fn take_eviction(&self, viewer_id: ViewerId) -> bool {
        self.state.lock().await.evicted.remove(&viewer_id)
    }

    /// Mark the shell as exited and release every viewer sink.
    ///
    /// Returns the number of viewers that were still attached.
    pub(crate) async fn terminate(&self) -> usize {
        let mut state = self.state.lock().await;
        state.status = SessionStatus::Terminated;
        let count = state.clients.len();
        state.clients.clear();
        count
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status
    }

    pub async fn viewer_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn history_len(&self) -> usize {
        self.state.lock().await.history.len()
    }
}

/// Start the reader thread and broadcast task of a freshly created session.
///
/// The reader thread performs the blocking PTY reads and forwards chunks;
/// the broadcast task publishes them and, on end-of-stream, removes the
/// session from the registry and closes every remaining viewer.
pub(crate) fn start(
    session: Arc<Session>,
    registry: SessionRegistry,
    read_chunk: usize,
) -> SshoResult<()> {
    let reader = session
        .pty
        .take_reader()
        .ok_or_else(|| SshoError::Spawn("PTY reader already taken".into()))?;
    let (chunk_tx, chunk_rx) = mpsc::channel::<io::Result<Vec<u8>>>(64);

    let session_id = session.id.clone();
    std::thread::Builder::new()
        .name(format!("pty-reader-{session_id}"))
        .spawn(move || read_loop(&session_id, reader, chunk_tx, read_chunk))
        .map_err(|e| SshoError::Spawn(format!("failed to start PTY reader: {e}")))?;

    tokio::spawn(broadcast_loop(session, registry, chunk_rx));
    Ok(())
}

fn read_loop(
    session_id: &str,
    mut reader: Box<dyn Read + Send>,
    chunk_tx: mpsc::Sender<io::Result<Vec<u8>>>,
    read_chunk: usize,
) {
    let mut buf = vec![0u8; read_chunk.max(1)];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!(session_id, "PTY EOF");
                break;
            }
            Ok(n) => {
                if chunk_tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports the slave side closing.
                debug!(session_id, error = %e, "PTY read ended");
                let _ = chunk_tx.blocking_send(Err(e));
                break;
            }
        }
    }
}

async fn broadcast_loop(
    session: Arc<Session>,
    registry: SessionRegistry,
    mut chunk_rx: mpsc::Receiver<io::Result<Vec<u8>>>,
) {
    let mut read_failed = false;
    while let Some(event) = chunk_rx.recv().await {
        match event {
            Ok(chunk) => session.publish(chunk).await,
            Err(_) => {
                read_failed = true;
                break;
            }
        }
    }

    registry.remove(&session.id).await;
    let closed = session.terminate().await;
    // The shell may outlive a failed read; it must not outlive its session.
    if read_failed {
        if let Err(e) = session.pty.kill() {
            debug!(session_id = %session.id, error = %e, "kill after read failure");
        }
    }
    let exit_code = session.pty.wait().await;
    info!(
        session_id = %session.id,
        exit_code = ?exit_code,
        viewers_closed = closed,
        "shell exited, session ended"
    );
}
