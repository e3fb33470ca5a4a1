//! Session management: PTY lifecycle, history buffer, viewer fan-out.

pub mod broadcast;
pub mod history;
pub mod pty;
pub mod registry;

pub use broadcast::{Attachment, Session, SessionStatus, ViewerId, ViewerSink};
pub use history::HistoryBuffer;
pub use pty::{PtyBackend, PtyHandle, ShellBackend};
pub use registry::{SessionRegistry, SessionSettings};
