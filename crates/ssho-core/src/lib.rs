//! ssho-core: Shared protocol library for persistent shared terminal sessions.
//!
//! Provides the viewer message model (raw input vs. resize control), the
//! strict control-message parser, and the crate-wide error type.

pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use error::{SshoError, SshoResult};
pub use messages::{ClientMessage, ControlMessage};
