//! PTY wrapper using portable-pty.
//!
//! A [`PtyBackend`] spawns the shell behind a session and hands back a
//! [`PtyHandle`]: a one-shot output reader for the broadcast loop, a shared
//! input writer for viewers, and the window-size control.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use ssho_core::{SshoError, SshoResult};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Window-size control of a pseudo-terminal.
pub trait PtyControl: Send + Sync {
    /// Apply a new window size.
    fn resize(&self, rows: u16, cols: u16) -> SshoResult<()>;

    /// Current window size as `(rows, cols)`.
    fn size(&self) -> SshoResult<(u16, u16)>;
}

/// Something that can start a shell attached to a fresh pseudo-terminal.
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, rows: u16, cols: u16) -> SshoResult<PtyHandle>;
}

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;
type Killer = Box<dyn ChildKiller + Send + Sync>;

/// A managed PTY instance.
pub struct PtyHandle {
    /// Output side; taken exactly once by the session's reader thread.
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    /// Input side, shared by every viewer of the session.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    control: Box<dyn PtyControl>,
    /// Child process handle (absent for in-memory backends).
    child: Option<SharedChild>,
    /// Kill switch, usable while another thread is blocked in `wait`.
    killer: Option<Mutex<Killer>>,
}

impl PtyHandle {
    /// Assemble a handle from its parts.
    pub fn new(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        control: Box<dyn PtyControl>,
    ) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Arc::new(Mutex::new(writer)),
            control,
            child: None,
            killer: None,
        }
    }

    fn with_child(mut self, child: Box<dyn Child + Send + Sync>) -> Self {
        self.killer = Some(Mutex::new(child.clone_killer()));
        self.child = Some(Arc::new(Mutex::new(child)));
        self
    }

    #[cfg(test)]
    fn with_killer(mut self, killer: Killer) -> Self {
        self.killer = Some(Mutex::new(killer));
        self
    }

    /// Take the output reader. Returns `None` once it has been taken.
    pub fn take_reader(&self) -> Option<Box<dyn Read + Send>> {
        self.reader.lock().ok().and_then(|mut r| r.take())
    }

    /// Write bytes verbatim to the shell's input.
    ///
    /// Runs on the blocking pool; a full PTY input buffer blocks the caller.
    pub async fn write(&self, data: Vec<u8>) -> SshoResult<()> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || -> SshoResult<()> {
            let mut writer = writer
                .lock()
                .map_err(|_| SshoError::Other("PTY writer lock poisoned".into()))?;
            writer.write_all(&data)?;
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| SshoError::Other(format!("join error: {e}")))?
    }

    /// Resize the PTY.
    pub fn resize(&self, rows: u16, cols: u16) -> SshoResult<()> {
        self.control.resize(rows, cols)?;
        debug!(rows, cols, "PTY resized");
        Ok(())
    }

    /// Current terminal size as `(rows, cols)`.
    pub fn size(&self) -> SshoResult<(u16, u16)> {
        self.control.size()
    }

    /// Terminate the shell process. A no-op for handles without a process.
    pub fn kill(&self) -> SshoResult<()> {
        let Some(killer) = &self.killer else {
            return Ok(());
        };
        let mut killer = killer
            .lock()
            .map_err(|_| SshoError::Other("PTY killer lock poisoned".into()))?;
        killer.kill()?;
        debug!("PTY child killed");
        Ok(())
    }

    /// Wait for the child process to exit. Returns the exit code if known.
    pub async fn wait(&self) -> Option<u32> {
        let child = self.child.clone()?;
        let status = tokio::task::spawn_blocking(move || {
            let mut child = child.lock().ok()?;
            child.wait().ok()
        })
        .await
        .ok()
        .flatten()?;
        Some(status.exit_code())
    }
}

/// Size control backed by a portable-pty master (Mutex because MasterPty is not Sync).
struct MasterControl(Mutex<Box<dyn MasterPty + Send>>);

impl PtyControl for MasterControl {
    fn resize(&self, rows: u16, cols: u16) -> SshoResult<()> {
        let master = self
            .0
            .lock()
            .map_err(|_| SshoError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SshoError::Other(format!("PTY resize failed: {e}")))
    }

    fn size(&self) -> SshoResult<(u16, u16)> {
        let master = self
            .0
            .lock()
            .map_err(|_| SshoError::Other("PTY master lock poisoned".into()))?;
        let size = master
            .get_size()
            .map_err(|e| SshoError::Other(format!("PTY size query failed: {e}")))?;
        Ok((size.rows, size.cols))
    }
}

/// Spawns the configured shell on a native pseudo-terminal.
#[derive(Debug, Clone)]
pub struct ShellBackend {
    shell: String,
    term: String,
}

impl ShellBackend {
    pub fn new(shell: impl Into<String>, term: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            term: term.into(),
        }
    }
}

impl PtyBackend for ShellBackend {
    fn spawn(&self, rows: u16, cols: u16) -> SshoResult<PtyHandle> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SshoError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.env("TERM", &self.term);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SshoError::Spawn(format!("failed to spawn {}: {e}", self.shell)))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        info!(shell = %self.shell, pid = ?child.process_id(), rows, cols, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SshoError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SshoError::Spawn(format!("failed to take PTY writer: {e}")))?;

        Ok(PtyHandle::new(
            reader,
            writer,
            Box::new(MasterControl(Mutex::new(pair.master))),
        )
        .with_child(child))
    }
}
