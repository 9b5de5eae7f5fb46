//! HTTP/WebSocket façade
//!
//! Translates requests one-for-one into service-manager calls and bridges
//! the event bus onto WebSocket subscribers.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod websocket;

pub use server::{ApiServer, AppState};
