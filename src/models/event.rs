//! Typed events multiplexed to WebSocket subscribers
//!
//! The discriminator/payload shape (`{"type": …, "data": …}`) is the wire
//! protocol consumed by the browser client; variant names map onto the
//! message types it dispatches on.

use serde::{Deserialize, Serialize};

use super::proxy::{ProxyDetails, RotationState};
use super::results::{HttpResult, ScanResult};

/// Status payload for `proxy_status` events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyStatusPayload {
    pub status: RotationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyStatusPayload {
    pub fn new(status: RotationState) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub fn with_error(status: RotationState, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
        }
    }
}

/// Terminal and running status payload for the tester and scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEventStatus {
    Running,
    Finished,
    Stopped,
}

impl JobEventStatus {
    /// Whether this status is the last event a job publishes
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEventStatus::Finished | JobEventStatus::Stopped)
    }
}

/// `(done, total)` progress counter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
}

/// `(tested, total)` progress counter used by the scanner
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanProgress {
    pub tested: u64,
    pub total: u64,
}

/// Tagged union over everything the daemon streams to subscribers
///
/// Events are value-typed and cheap to clone; the bus fans them out by
/// value to every subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    Log(String),
    ProxyStatus(ProxyStatusPayload),
    ProxyDetails(ProxyDetails),
    HttpResult(HttpResult),
    HttpTestStatus(JobEventStatus),
    HttpTestProgress(Progress),
    CfscanResult(ScanResult),
    CfscanStatus(JobEventStatus),
    CfScanProgress(ScanProgress),
}

impl Event {
    pub fn log(message: impl Into<String>) -> Self {
        Event::Log(message.into())
    }

    /// The wire discriminator of this event
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Log(_) => "log",
            Event::ProxyStatus(_) => "proxy_status",
            Event::ProxyDetails(_) => "proxy_details",
            Event::HttpResult(_) => "http_result",
            Event::HttpTestStatus(_) => "http_test_status",
            Event::HttpTestProgress(_) => "http_test_progress",
            Event::CfscanResult(_) => "cfscan_result",
            Event::CfscanStatus(_) => "cfscan_status",
            Event::CfScanProgress(_) => "cf_scan_progress",
        }
    }
}
