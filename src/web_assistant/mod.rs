//! Rate-limited network transports shared by every exchange plugin.

pub mod rest;
pub mod ws;

pub use rest::RestAssistant;
pub use ws::{BackoffCalculator, WsAssistant};
