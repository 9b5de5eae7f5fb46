//! Single-link prober
//!
//! The rotation engine and the bulk tester both depend on the [`Prober`]
//! trait; [`HttpProber`] is the production implementation, issuing a timed
//! request through the candidate outbound.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Result, SwivelError};
use crate::models::OutboundHealth;

/// Probe parameters
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// URL requested through the candidate outbound
    pub destination_url: String,
    pub timeout_ms: u64,
    /// Also measure download throughput from the timed body transfer
    pub measure_speed: bool,
    /// Force an IPv4 source address
    pub ipv4_only: bool,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            destination_url: "https://www.gstatic.com/generate_204".to_string(),
            timeout_ms: 10_000,
            measure_speed: false,
            ipv4_only: false,
        }
    }
}

impl ProbeOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A single timed request through one candidate outbound
///
/// Implementations must return promptly once `cancel` flips, with an error
/// distinguishable from a timeout.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        config: &str,
        opts: &ProbeOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<(OutboundHealth, u16)>;
}

/// Production prober backed by reqwest
///
/// Builds a throwaway client per probe so each candidate gets a fresh
/// connection through its own proxy URI (reqwest speaks http, https and
/// socks5 schemes).
pub struct HttpProber;

impl HttpProber {
    pub fn new() -> Self {
        Self
    }

    fn build_client(config: &str, opts: &ProbeOptions) -> Result<reqwest::Client> {
        let proxy = reqwest::Proxy::all(config)
            .map_err(|e| SwivelError::Validation(format!("unusable proxy config: {}", e)))?;

        let mut builder = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(opts.timeout());

        if opts.ipv4_only {
            builder = builder.local_address("0.0.0.0".parse::<std::net::IpAddr>().ok());
        }

        builder
            .build()
            .map_err(|e| SwivelError::Internal(format!("client build failed: {}", e)))
    }

    async fn run_probe(
        config: &str,
        opts: &ProbeOptions,
    ) -> Result<(OutboundHealth, u16)> {
        let client = Self::build_client(config, opts)?;

        let started = Instant::now();
        let response = client.get(&opts.destination_url).send().await?;
        let delay = started.elapsed();
        let status = response.status().as_u16();

        if !response.status().is_success() && response.status().as_u16() != 204 {
            return Err(SwivelError::Probe(format!(
                "unexpected status {} from {}",
                status, opts.destination_url
            )));
        }

        let location = colo_from_headers(response.headers());

        let download_mbps = if opts.measure_speed {
            let body_started = Instant::now();
            let body = response.bytes().await?;
            let secs = body_started.elapsed().as_secs_f64();
            if secs > 0.0 {
                (body.len() as f64 * 8.0) / secs / 1_000_000.0
            } else {
                0.0
            }
        } else {
            // Drain the body so the connection is reusable, ignoring size.
            let _ = response.bytes().await;
            0.0
        };

        debug!(config, delay_ms = delay.as_millis() as u64, "probe ok");

        Ok((
            OutboundHealth {
                config: config.to_string(),
                delay_ms: delay.as_millis() as u32,
                download_mbps,
                upload_mbps: 0.0,
                location,
                last_ok_at: Utc::now(),
            },
            status,
        ))
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(
        &self,
        config: &str,
        opts: &ProbeOptions,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(OutboundHealth, u16)> {
        if *cancel.borrow() {
            return Err(SwivelError::Cancelled);
        }

        tokio::select! {
            result = Self::run_probe(config, opts) => result,
            _ = cancel.changed() => Err(SwivelError::Cancelled),
        }
    }
}

/// Extract the edge colo code from a `cf-ray` header (`<ray-id>-<COLO>`)
pub fn colo_from_headers(headers: &reqwest::header::HeaderMap) -> String {
    headers
        .get("cf-ray")
        .and_then(|v| v.to_str().ok())
        .and_then(|ray| ray.rsplit_once('-'))
        .map(|(_, colo)| colo.to_string())
        .unwrap_or_default()
}
