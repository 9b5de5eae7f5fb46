//! Proxy subsystem: the local inbound relay and the rotation engine

pub mod core;
pub mod rotation;

pub use core::{InboundHandle, ProxyCore, TcpRelayCore};
pub use rotation::{RotationConfig, RotationEngine, SharedDetails};
