//! Swivel - Local Proxy Control Plane
//!
//! A single-operator daemon that runs three networking subsystems:
//!
//! - A rotating outbound proxy: a local listener whose upstream outbound
//!   is probed, selected and swapped without ever rebinding the socket
//! - A bulk latency/throughput tester for lists of proxy links
//! - A Cloudflare edge IP scanner sweeping CIDR ranges
//!
//! A small HTTP API plus a WebSocket event stream front the three jobs
//! for a browser client.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod jobs;
pub mod manager;
pub mod models;
pub mod probe;
pub mod proxy;

pub use config::Config;
pub use error::{Result, SwivelError};
pub use events::EventBus;
pub use manager::ServiceManager;
