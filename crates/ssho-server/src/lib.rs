//! ssho-server: persistent shell sessions shared by many WebSocket viewers.
//!
//! Each session id maps to exactly one live shell. Viewers attach over
//! `/ws?id=<id>`, receive a replay of recent output, then live output, and
//! may send input and resize requests.

pub mod config;
pub mod server;
pub mod session;
pub mod transport;
