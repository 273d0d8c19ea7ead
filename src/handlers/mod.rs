//! HTTP handlers for the REST surface. The voice socket lives in `websocket`.

pub mod config;
pub mod conversations;

pub use config::*;
pub use conversations::*;
