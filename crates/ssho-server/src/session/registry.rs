//! Session registry: session id → live shell.
//!
//! Sessions are created lazily on the first attach for an unseen id and
//! removed only by their own broadcast loop once the shell exits. The map is
//! the single global exclusion domain; it is held for the resolve-or-create
//! step and for removal, never across viewer or PTY I/O.

use super::broadcast::{self, Session};
use super::history::DEFAULT_HISTORY_LIMIT;
use super::pty::PtyBackend;
use ssho_core::SshoResult;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Per-session parameters applied when a shell is spawned.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// History limit in bytes.
    pub history_limit: usize,
    /// Maximum bytes per PTY read (and per live chunk).
    pub read_chunk: usize,
    /// Initial window size.
    pub rows: u16,
    pub cols: u16,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            read_chunk: 4096,
            rows: 24,
            cols: 80,
        }
    }
}

/// Registry of live sessions. Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    backend: Arc<dyn PtyBackend>,
    settings: SessionSettings,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn PtyBackend>, settings: SessionSettings) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            backend,
            settings,
        }
    }

    /// Return the live session for `id`, spawning a fresh shell if there is none.
    ///
    /// On spawn failure nothing is inserted.
    pub async fn resolve(&self, id: &str) -> SshoResult<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(id) {
            return Ok(session.clone());
        }

        let pty = self.backend.spawn(self.settings.rows, self.settings.cols)?;
        let session = Arc::new(Session::new(
            id.to_string(),
            pty,
            self.settings.history_limit,
        ));
        sessions.insert(id.to_string(), session.clone());
        // Started while the map is locked, so the loop's removal always
        // happens after this insert.
        if let Err(e) = broadcast::start(session.clone(), self.clone(), self.settings.read_chunk) {
            sessions.remove(id);
            return Err(e);
        }
        info!(session_id = %id, sessions = sessions.len(), "session created");
        Ok(session)
    }

    /// Delete the entry for `id`. Idempotent.
    pub async fn remove(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        let removed = sessions.remove(id).is_some();
        if removed {
            info!(session_id = %id, sessions = sessions.len(), "session removed");
        }
        removed
    }

    /// The live session for `id`, without creating one.
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::broadcast::SessionStatus;
    use crate::session::pty::testing::FakeBackend;
    use ssho_core::SshoError;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn registry(backend: Arc<FakeBackend>) -> SessionRegistry {
        SessionRegistry::new(backend, SessionSettings::default())
    }

    async fn wait_until<F, Fut>(mut cond: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if cond().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn resolve_reuses_live_session() {
        let backend = Arc::new(FakeBackend::default());
        let reg = registry(backend.clone());
        let a = reg.resolve("s1").await.unwrap();
        let b = reg.resolve("s1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.spawned(), 1);
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_attach_spawns_one_shell() {
        let backend = Arc::new(FakeBackend::default());
        let reg = registry(backend.clone());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move { reg.resolve("same").await.unwrap() }));
        }
        let mut sessions = Vec::new();
        for h in handles {
            sessions.push(h.await.unwrap());
        }
        assert_eq!(backend.spawned(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    }

    #[tokio::test]
    async fn spawn_failure_inserts_nothing() {
        let reg = registry(Arc::new(FakeBackend::failing()));
        match reg.resolve("bad").await {
            Err(SshoError::Spawn(_)) => {}
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("resolve succeeded"),
        }
        assert!(!reg.contains("bad").await);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let reg = registry(Arc::new(FakeBackend::default()));
        reg.resolve("s").await.unwrap();
        assert!(reg.get("s").await.is_some());
        assert!(reg.remove("s").await);
        assert!(reg.get("s").await.is_none());
        assert!(!reg.remove("s").await);
        assert!(!reg.remove("never").await);
    }

    #[tokio::test]
    async fn output_reaches_every_viewer() {
        let backend = Arc::new(FakeBackend::default());
        let reg = registry(backend.clone());
        let session = reg.resolve("s").await.unwrap();
        let (tx1, mut rx1) = mpsc::channel(16);
        let (tx2, mut rx2) = mpsc::channel(16);
        session.attach(tx1).await.unwrap();
        session.attach(tx2).await.unwrap();

        backend.last().emit(b"hello\n");
        assert_eq!(rx1.recv().await.unwrap(), b"hello\n");
        assert_eq!(rx2.recv().await.unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn attach_mid_stream_sees_every_byte_once() {
        let backend = Arc::new(FakeBackend::default());
        let reg = SessionRegistry::new(
            backend.clone(),
            SessionSettings {
                read_chunk: 3,
                ..SessionSettings::default()
            },
        );
        let session = reg.resolve("s").await.unwrap();
        let shell = backend.last();

        let mut expected = Vec::new();
        for i in 0..200u32 {
            let line = format!("line {i}\n");
            expected.extend_from_slice(line.as_bytes());
            shell.emit(line.as_bytes());
        }

        // Attach while the loop is still draining; where it lands does not matter.
        let (tx, mut rx) = mpsc::channel(4096);
        let attachment = session.attach(tx).await.unwrap();
        let mut seen = attachment.replay;
        wait_until(|| {
            let session = session.clone();
            let target = expected.len();
            async move { session.history_len().await >= target }
        })
        .await;
        while let Ok(chunk) = rx.try_recv() {
            seen.extend_from_slice(&chunk);
        }
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn process_exit_removes_session_and_closes_viewers() {
        let backend = Arc::new(FakeBackend::default());
        let reg = registry(backend.clone());
        let session = reg.resolve("s").await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        session.attach(tx).await.unwrap();

        let shell = backend.last();
        shell.emit(b"bye\n");
        shell.exit();

        assert_eq!(rx.recv().await.unwrap(), b"bye\n");
        assert!(rx.recv().await.is_none());
        assert!(!reg.contains("s").await);
        assert_eq!(session.status().await, SessionStatus::Terminated);
    }

    #[tokio::test]
    async fn interrupted_read_keeps_session_alive() {
        let backend = Arc::new(FakeBackend::default());
        let reg = registry(backend.clone());
        let session = reg.resolve("s").await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        session.attach(tx).await.unwrap();

        let shell = backend.last();
        shell.emit(b"a");
        shell.fail_read(std::io::ErrorKind::Interrupted);
        shell.emit(b"b");

        assert_eq!(rx.recv().await.unwrap(), b"a");
        assert_eq!(rx.recv().await.unwrap(), b"b");
        assert!(reg.contains("s").await);
        assert_eq!(session.status().await, SessionStatus::Running);
        assert!(!shell.killed());
    }

    #[tokio::test]
    async fn failed_read_ends_session_and_kills_shell() {
        let backend = Arc::new(FakeBackend::default());
        let reg = registry(backend.clone());
        let session = reg.resolve("s").await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        session.attach(tx).await.unwrap();

        let shell = backend.last();
        shell.fail_read(std::io::ErrorKind::BrokenPipe);

        assert!(rx.recv().await.is_none());
        wait_until(|| {
            let shell = shell.clone();
            async move { shell.killed() }
        })
        .await;
        assert!(!reg.contains("s").await);
        assert_eq!(session.status().await, SessionStatus::Terminated);
    }

    #[tokio::test]
    async fn reattach_after_exit_spawns_fresh_shell() {
        let backend = Arc::new(FakeBackend::default());
        let reg = registry(backend.clone());
        let old = reg.resolve("s").await.unwrap();
        let shell = backend.last();
        shell.emit(b"old output");
        shell.exit();
        wait_until(|| {
            let reg = reg.clone();
            async move { !reg.contains("s").await }
        })
        .await;

        let fresh = reg.resolve("s").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(backend.spawned(), 2);
        let (tx, _rx) = mpsc::channel(16);
        assert!(fresh.attach(tx).await.unwrap().replay.is_empty());
    }

    #[tokio::test]
    async fn replay_after_detached_burst_is_bounded_tail() {
        let backend = Arc::new(FakeBackend::default());
        let reg = registry(backend.clone());
        let session = reg.resolve("s2").await.unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let first = session.attach(tx).await.unwrap();
        session.detach(first.viewer_id).await;

        // 2 MiB while nobody is attached, then a marker chunk.
        let shell = backend.last();
        let mut produced = Vec::new();
        for i in 0..512u32 {
            let chunk = vec![(i % 251) as u8; 4096];
            produced.extend_from_slice(&chunk);
            shell.emit(&chunk);
        }
        produced.extend_from_slice(b"END");
        shell.emit(b"END");

        let replay = loop {
            let (tx, _rx) = mpsc::channel(16);
            let attachment = session.attach(tx).await.unwrap();
            if attachment.replay.ends_with(b"END") {
                break attachment.replay;
            }
            session.detach(attachment.viewer_id).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(replay.len() <= 524_288 + 4096);
        assert!(replay.len() < produced.len());
        assert!(produced.ends_with(&replay));
    }
}
