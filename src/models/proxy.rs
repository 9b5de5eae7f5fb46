use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rotation engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationState {
    Idle,
    Probing,
    Switching,
    Active,
    Stalled,
    Stopping,
    #[default]
    Stopped,
}

impl RotationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationState::Idle => "idle",
            RotationState::Probing => "probing",
            RotationState::Switching => "switching",
            RotationState::Active => "active",
            RotationState::Stalled => "stalled",
            RotationState::Stopping => "stopping",
            RotationState::Stopped => "stopped",
        }
    }

    /// States in which an operator-forced rotation is accepted
    pub fn accepts_rotate(&self) -> bool {
        matches!(self, RotationState::Active | RotationState::Stalled)
    }
}

impl std::fmt::Display for RotationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse lifecycle status of the proxy service as reported by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyLifecycle {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ProxyLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyLifecycle::Stopped => "stopped",
            ProxyLifecycle::Starting => "starting",
            ProxyLifecycle::Running => "running",
            ProxyLifecycle::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ProxyLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of the tester and scanner jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Stopping,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Stopping => "stopping",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, JobStatus::Idle)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health snapshot of an outbound, produced by a successful probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundHealth {
    /// The outbound's protocol URI
    pub config: String,
    /// Round-trip delay of the probe request in milliseconds
    pub delay_ms: u32,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    /// Edge location observed by the probe, empty when unknown
    pub location: String,
    pub last_ok_at: DateTime<Utc>,
}

/// The local inbound listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundInfo {
    /// Listener protocol (socks, http, mixed)
    pub protocol: String,
    pub addr: String,
    pub port: u16,
    /// The share link the listener was configured from, if any
    #[serde(default)]
    pub orig_link: String,
}

impl InboundInfo {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// Observer snapshot of the single proxy instance
///
/// `active` is either the pre-swap or the post-swap health record, never a
/// mix; the engine replaces the whole snapshot under a write lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDetails {
    pub inbound: InboundInfo,
    pub active: Option<OutboundHealth>,
    pub pool: Vec<String>,
    pub interval_s: u64,
    pub rotation_state: RotationState,
    pub next_rotation_at: Option<DateTime<Utc>>,
    /// Pool size; rotation is disabled when `total <= 1`
    pub total: usize,
}

/// Request body for starting the proxy service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStartRequest {
    /// Candidate outbound pool, ordered
    pub links: Vec<String>,
    /// Listener protocol (default: socks)
    #[serde(default = "default_inbound_protocol")]
    pub protocol: String,
    /// Listener address (default: 127.0.0.1)
    #[serde(default = "default_inbound_addr")]
    pub addr: String,
    /// Listener port (default: 1080)
    #[serde(default = "default_inbound_port")]
    pub port: u16,
    /// Rotation interval in seconds; 0 disables timed rotation
    #[serde(default = "default_interval_s")]
    pub interval_s: u64,
    /// Probe destination URL
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    /// Per-probe timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_inbound_protocol() -> String {
    "socks".to_string()
}

fn default_inbound_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_inbound_port() -> u16 {
    1080
}

fn default_interval_s() -> u64 {
    300
}

fn default_probe_url() -> String {
    "https://www.gstatic.com/generate_204".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

impl ProxyStartRequest {
    pub fn inbound(&self) -> InboundInfo {
        InboundInfo {
            protocol: self.protocol.clone(),
            addr: self.addr.clone(),
            port: self.port,
            orig_link: String::new(),
        }
    }
}
