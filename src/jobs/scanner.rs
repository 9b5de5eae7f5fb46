//! Cloudflare edge IP scanner
//!
//! Expands a CIDR list into individual edge IPs and measures latency and
//! loss to each in parallel. Results stream out per probe; the best
//! `top_n` successful rows are persisted when the sweep ends.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::error::{Result, SwivelError};
use crate::events::EventBus;
use crate::history::HistoryFile;
use crate::jobs::cidr::expand_cidr;
use crate::models::{Event, JobEventStatus, ScanProgress, ScanResult, ScannerRequest};
use crate::probe::colo_from_headers;

/// Live range list endpoints, newline-separated CIDR text
const RANGE_URLS: [&str; 2] = [
    "https://www.cloudflare.com/ips-v4",
    "https://www.cloudflare.com/ips-v6",
];

/// Published Cloudflare ranges, used whenever the live fetch fails
const FALLBACK_RANGES: &[&str] = &[
    // IPv4
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
    "131.0.72.0/22",
    // IPv6
    "2606:4700::/32",
    "2803:f800::/32",
    "2400:cb00::/32",
    "2c0f:f248::/32",
    "2a06:98c0::/29",
];

pub fn fallback_ranges() -> Vec<String> {
    FALLBACK_RANGES.iter().map(|s| s.to_string()).collect()
}

/// Fetch the live Cloudflare ranges; any failure fails the whole fetch
pub async fn fetch_cloudflare_ranges() -> Result<Vec<String>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| SwivelError::Internal(format!("client build failed: {}", e)))?;

    let fetch = |url: &'static str| {
        let client = client.clone();
        async move {
            let response = client.get(url).send().await?;
            if !response.status().is_success() {
                return Err(SwivelError::Http(format!(
                    "bad status {} from {}",
                    response.status(),
                    url
                )));
            }
            Ok::<_, SwivelError>(response.text().await?)
        }
    };

    let (v4, v6) = futures::join!(fetch(RANGE_URLS[0]), fetch(RANGE_URLS[1]));
    let mut ranges = Vec::new();
    for body in [v4?, v6?] {
        ranges.extend(
            body.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );
    }
    Ok(ranges)
}

/// Live ranges with fallback to the published constant list
pub async fn ranges_or_fallback() -> Vec<String> {
    match fetch_cloudflare_ranges().await {
        Ok(ranges) => ranges,
        Err(e) => {
            warn!("failed to fetch live Cloudflare ranges, using fallback: {}", e);
            fallback_ranges()
        }
    }
}

/// Measures latency and loss to a single edge IP
#[async_trait]
pub trait IpProber: Send + Sync {
    async fn probe_ip(
        &self,
        ip: IpAddr,
        attempts: u32,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<ScanResult>;
}

/// Production prober: timed HTTPS requests with the hostname pinned to
/// the candidate IP
pub struct HttpsIpProber {
    host: String,
}

impl HttpsIpProber {
    pub fn new() -> Self {
        Self {
            host: "cloudflare.com".to_string(),
        }
    }
}

impl Default for HttpsIpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IpProber for HttpsIpProber {
    async fn probe_ip(
        &self,
        ip: IpAddr,
        attempts: u32,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ScanResult> {
        let client = reqwest::Client::builder()
            .resolve(&self.host, SocketAddr::new(ip, 443))
            .timeout(timeout)
            .build()
            .map_err(|e| SwivelError::Internal(format!("client build failed: {}", e)))?;

        let url = format!("https://{}/cdn-cgi/trace", self.host);
        let attempts = attempts.max(1);
        let mut delays: Vec<u32> = Vec::new();
        let mut location = String::new();
        let mut failures = 0u32;

        for _ in 0..attempts {
            if *cancel.borrow() {
                return Err(SwivelError::Cancelled);
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                outcome = client.get(&url).send() => outcome,
                _ = cancel.changed() => return Err(SwivelError::Cancelled),
            };

            match outcome {
                Ok(response) => {
                    delays.push(started.elapsed().as_millis() as u32);
                    if location.is_empty() {
                        location = colo_from_headers(response.headers());
                    }
                    let _ = response.bytes().await;
                }
                Err(_) => failures += 1,
            }
        }

        let delay_ms = if delays.is_empty() {
            None
        } else {
            Some(delays.iter().sum::<u32>() / delays.len() as u32)
        };

        Ok(ScanResult {
            ip: ip.to_string(),
            delay_ms,
            loss_pct: f64::from(failures) * 100.0 / f64::from(attempts),
            location,
        })
    }
}

pub struct ScannerJob {
    request: ScannerRequest,
    prober: Arc<dyn IpProber>,
    bus: EventBus,
    history: Arc<HistoryFile>,
}

impl ScannerJob {
    pub fn new(
        request: ScannerRequest,
        prober: Arc<dyn IpProber>,
        bus: EventBus,
        history: Arc<HistoryFile>,
    ) -> Self {
        Self {
            request,
            prober,
            bus,
            history,
        }
    }

    #[instrument(skip_all, fields(cidrs = self.request.cidr_list.len(), concurrency = self.request.concurrency))]
    pub async fn run(self, cancel: watch::Receiver<bool>) {
        let cidrs = if self.request.cidr_list.is_empty() {
            match fetch_cloudflare_ranges().await {
                Ok(ranges) => ranges,
                Err(e) => {
                    self.bus.log(format!(
                        "live Cloudflare ranges unavailable ({}), using fallback list",
                        e
                    ));
                    fallback_ranges()
                }
            }
        } else {
            self.request.cidr_list.clone()
        };

        let mut ips: Vec<IpAddr> = Vec::new();
        for cidr in &cidrs {
            match expand_cidr(cidr) {
                Ok(expanded) => ips.extend(expanded),
                Err(e) => self.bus.log(format!("skipping {}: {}", cidr, e)),
            }
        }

        let total = ips.len() as u64;
        let attempts = self.request.ping_count;
        let timeout = Duration::from_millis(self.request.timeout_ms);
        let concurrency = self.request.concurrency.max(1);

        info!(total, "cloudflare scan started");
        self.bus.publish(Event::CfscanStatus(JobEventStatus::Running));

        let progress = Arc::new(Mutex::new(0u64));

        let results: Vec<Option<ScanResult>> = futures::stream::iter(ips)
            .map(|ip| {
                let prober = self.prober.clone();
                let cancel = cancel.clone();
                let bus = self.bus.clone();
                let progress = progress.clone();

                async move {
                    if *cancel.borrow() {
                        return None;
                    }

                    match prober.probe_ip(ip, attempts, timeout, cancel).await {
                        Ok(result) => {
                            let mut tested = progress.lock();
                            *tested += 1;
                            if result.is_success() {
                                bus.publish(Event::CfscanResult(result.clone()));
                            }
                            bus.publish(Event::CfScanProgress(ScanProgress {
                                tested: *tested,
                                total,
                            }));
                            drop(tested);
                            result.is_success().then_some(result)
                        }
                        Err(_) => None,
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let stopped = *cancel.borrow();

        let mut successes: Vec<ScanResult> = results.into_iter().flatten().collect();
        successes.sort_by_key(|r| r.delay_ms.unwrap_or(u32::MAX));
        successes.truncate(self.request.top_n.max(1));

        if let Err(e) = self.history.append(&successes).await {
            self.bus
                .log(format!("failed to persist scan history: {}", e));
        }

        let terminal = if stopped {
            JobEventStatus::Stopped
        } else {
            JobEventStatus::Finished
        };
        info!(kept = successes.len(), status = ?terminal, "cloudflare scan ended");
        self.bus.publish(Event::CfscanStatus(terminal));
    }
}
