//! Viewer → session message model.
//!
//! A viewer connection carries two kinds of frames: binary frames are raw
//! terminal input, text frames are JSON control messages. The only control
//! message understood today is a resize request:
//!
//! ```json
//! {"type": "resize", "rows": 40, "cols": 120}
//! ```
//!
//! Anything else in a text frame maps to [`ClientMessage::Unknown`] and is
//! dropped by the server without surfacing an error.

use crate::error::{SshoError, SshoResult};
use serde::{Deserialize, Serialize};

/// A JSON control message sent by a viewer in a text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Set the terminal window size.
    Resize { rows: u16, cols: u16 },
}

impl ControlMessage {
    /// Strictly parse a text frame. Zero dimensions are rejected.
    pub fn parse(text: &str) -> SshoResult<Self> {
        let msg: ControlMessage = serde_json::from_str(text)?;
        match msg {
            ControlMessage::Resize { rows, cols } if rows == 0 || cols == 0 => Err(
                SshoError::InvalidMessage(format!("resize to {rows}x{cols} has a zero dimension")),
            ),
            msg => Ok(msg),
        }
    }
}

/// An inbound viewer message after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Raw bytes for the shell's input stream.
    Data(Vec<u8>),
    /// Terminal resize request.
    Resize { rows: u16, cols: u16 },
    /// Malformed or unrecognized control text; a no-op.
    Unknown,
}

impl ClientMessage {
    /// Classify a binary frame.
    pub fn from_binary(data: impl Into<Vec<u8>>) -> Self {
        ClientMessage::Data(data.into())
    }

    /// Classify a text frame. Never fails: bad input becomes `Unknown`.
    pub fn from_text(text: &str) -> Self {
        match ControlMessage::parse(text) {
            Ok(ControlMessage::Resize { rows, cols }) => ClientMessage::Resize { rows, cols },
            Err(_) => ClientMessage::Unknown,
        }
    }
}
