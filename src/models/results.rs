use serde::{Deserialize, Serialize};

/// Outcome of testing a single link
///
/// Doubles as the CSV row schema for `http_test_history.csv`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpResult {
    pub link: String,
    /// Round-trip delay in milliseconds; unset when the probe failed
    pub delay_ms: Option<u32>,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    /// HTTP status of the probe response
    pub status: Option<u16>,
    #[serde(default)]
    pub location: String,
    /// Failure description; unset on success
    pub error: Option<String>,
}

impl HttpResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.delay_ms.is_some()
    }

    pub fn failed(link: String, error: String) -> Self {
        Self {
            link,
            delay_ms: None,
            download_mbps: None,
            upload_mbps: None,
            status: None,
            location: String::new(),
            error: Some(error),
        }
    }
}

/// Outcome of probing a single edge IP
///
/// Doubles as the CSV row schema for `cf_scan_history.csv`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanResult {
    pub ip: String,
    /// Mean delay of successful attempts in milliseconds
    pub delay_ms: Option<u32>,
    /// Failed attempts as a percentage of all attempts
    pub loss_pct: f64,
    #[serde(default)]
    pub location: String,
}

impl ScanResult {
    pub fn is_success(&self) -> bool {
        self.delay_ms.is_some()
    }
}

/// Request body for starting a bulk HTTP test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTestRequest {
    pub links: Vec<String>,
    #[serde(default = "default_thread_count")]
    pub thread_count: u16,
    #[serde(default = "default_destination_url")]
    pub destination_url: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub measure_speed: bool,
    #[serde(default)]
    pub ipv4_only: bool,
}

fn default_thread_count() -> u16 {
    5
}

fn default_destination_url() -> String {
    "https://www.gstatic.com/generate_204".to_string()
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

/// Request body for starting a Cloudflare edge scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerRequest {
    /// CIDRs to sweep; empty means fetch the live Cloudflare ranges
    #[serde(default)]
    pub cidr_list: Vec<String>,
    #[serde(default = "default_scan_concurrency")]
    pub concurrency: usize,
    /// Timed attempts per IP
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,
    /// How many of the best results to persist
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_scan_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_scan_concurrency() -> usize {
    50
}

fn default_ping_count() -> u32 {
    3
}

fn default_top_n() -> usize {
    100
}

fn default_scan_timeout_ms() -> u64 {
    4_000
}
