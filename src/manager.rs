//! Service manager
//!
//! Process-wide coordinator owning the proxy rotation engine, the bulk
//! HTTP tester and the Cloudflare scanner. A single mutex serializes
//! start/stop/rotate transitions; status and details reads go through
//! atomic snapshot cells so a stalled probe can never block polling.
//!
//! Jobs get a publish handle into the event bus and a cancel token,
//! never a reference back to the manager. Every job task runs under a
//! supervisor that converts a panic into a fatal log plus the terminal
//! status event the job could no longer publish, then resets the slot.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{info, warn};

use crate::error::{Result, SwivelError};
use crate::events::EventBus;
use crate::history::Histories;
use crate::jobs::scanner::IpProber;
use crate::jobs::{HttpTestJob, ScannerJob};
use crate::models::{
    Event, HttpTestRequest, JobEventStatus, JobStatus, ProxyDetails, ProxyLifecycle,
    ProxyStatusPayload, ProxyStartRequest, RotationState, ScannerRequest,
};
use crate::probe::{ProbeOptions, Prober};
use crate::proxy::core::ProxyCore;
use crate::proxy::rotation::{RotationConfig, RotationEngine, SharedDetails};

/// Runtime handles of the live proxy instance
struct ProxyRuntime {
    shared: Arc<SharedDetails>,
    rotate: Arc<Notify>,
    stop: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

impl ProxyRuntime {
    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Slot tracking one of the two exclusive background jobs
#[derive(Default)]
struct JobSlot {
    status: JobStatus,
    cancel: Option<watch::Sender<bool>>,
    done: Option<watch::Receiver<bool>>,
}

/// The process-wide service coordinator
pub struct ServiceManager {
    bus: EventBus,
    prober: Arc<dyn Prober>,
    ip_prober: Arc<dyn IpProber>,
    core: Arc<dyn ProxyCore>,
    histories: Histories,
    /// Serializes start/stop/rotate; never held across I/O
    ops: Mutex<()>,
    proxy: RwLock<Option<ProxyRuntime>>,
    http_test: RwLock<JobSlot>,
    scanner: RwLock<JobSlot>,
}

impl ServiceManager {
    pub fn new(
        bus: EventBus,
        prober: Arc<dyn Prober>,
        ip_prober: Arc<dyn IpProber>,
        core: Arc<dyn ProxyCore>,
        histories: Histories,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            prober,
            ip_prober,
            core,
            histories,
            ops: Mutex::new(()),
            proxy: RwLock::new(None),
            http_test: RwLock::new(JobSlot::default()),
            scanner: RwLock::new(JobSlot::default()),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // --- Proxy service ---

    /// Create the proxy instance and start its rotation engine
    pub async fn start_proxy(self: &Arc<Self>, request: ProxyStartRequest) -> Result<()> {
        if request.links.is_empty() {
            return Err(SwivelError::Validation(
                "at least one outbound link is required".to_string(),
            ));
        }

        let _ops = self.ops.lock().await;

        if self.proxy.read().is_some() {
            return Err(SwivelError::Busy(
                "proxy service is already running".to_string(),
            ));
        }

        let engine = RotationEngine::new(
            RotationConfig {
                pool: request.links.clone(),
                interval: std::time::Duration::from_secs(request.interval_s),
                probe_opts: ProbeOptions {
                    destination_url: request.probe_url.clone(),
                    timeout_ms: request.probe_timeout_ms,
                    ..ProbeOptions::default()
                },
            },
            request.inbound(),
            self.prober.clone(),
            self.core.clone(),
            self.bus.clone(),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        *self.proxy.write() = Some(ProxyRuntime {
            shared: engine.shared(),
            rotate: engine.rotate_handle(),
            stop: stop_tx,
            done: done_rx,
        });

        info!(pool = request.links.len(), "proxy service starting");

        let manager = self.clone();
        tokio::spawn(async move {
            let task = tokio::spawn(engine.run(stop_rx));
            match task.await {
                // The engine publishes its own terminal status, including
                // on fatal errors.
                Ok(_) => {}
                Err(e) if e.is_panic() => {
                    warn!("rotation engine panicked");
                    manager.bus.log("proxy rotation engine panicked");
                    manager
                        .bus
                        .publish(Event::ProxyStatus(ProxyStatusPayload::with_error(
                            RotationState::Stopped,
                            "internal error",
                        )));
                }
                Err(_) => {}
            }
            *manager.proxy.write() = None;
            let _ = done_tx.send(true);
        });

        Ok(())
    }

    /// Signal the rotation engine to stop and wait for its terminal event
    pub async fn stop_proxy(&self) -> Result<()> {
        let mut done = {
            let _ops = self.ops.lock().await;

            let proxy = self.proxy.read();
            let Some(runtime) = proxy.as_ref() else {
                return Err(SwivelError::NotFound(
                    "proxy service is not running".to_string(),
                ));
            };

            // A second stop while stopping is a no-op returning success.
            if runtime.stop_requested() {
                return Ok(());
            }

            let _ = runtime.stop.send(true);
            runtime.done.clone()
        };

        // Await the terminal event outside of every lock.
        let _ = done.changed().await;
        info!("proxy service stopped");
        Ok(())
    }

    /// Forward a forced-rotation signal to the engine
    pub async fn rotate_proxy(&self) -> Result<()> {
        let _ops = self.ops.lock().await;

        let proxy = self.proxy.read();
        let Some(runtime) = proxy.as_ref() else {
            return Err(SwivelError::Conflict(
                "proxy service is not running".to_string(),
            ));
        };

        let state = runtime.shared.state();
        if !state.accepts_rotate() {
            return Err(SwivelError::Conflict(format!(
                "cannot rotate while {}",
                state
            )));
        }

        runtime.rotate.notify_one();
        Ok(())
    }

    /// Coarse lifecycle status; never touches the ops mutex
    pub fn proxy_status(&self) -> ProxyLifecycle {
        let proxy = self.proxy.read();
        match proxy.as_ref() {
            None => ProxyLifecycle::Stopped,
            Some(runtime) if runtime.stop_requested() => ProxyLifecycle::Stopping,
            Some(runtime) => {
                let details = runtime.shared.snapshot();
                match details.rotation_state {
                    RotationState::Probing if details.active.is_none() => ProxyLifecycle::Starting,
                    RotationState::Stopping => ProxyLifecycle::Stopping,
                    RotationState::Stopped => ProxyLifecycle::Starting,
                    _ => ProxyLifecycle::Running,
                }
            }
        }
    }

    /// Snapshot of the proxy instance; never touches the ops mutex
    pub fn proxy_details(&self) -> Result<ProxyDetails> {
        let proxy = self.proxy.read();
        proxy
            .as_ref()
            .map(|runtime| runtime.shared.snapshot())
            .ok_or_else(|| SwivelError::NotFound("proxy service is not running".to_string()))
    }

    // --- HTTP test job ---

    pub async fn start_http_test(self: &Arc<Self>, request: HttpTestRequest) -> Result<()> {
        if request.links.is_empty() {
            return Err(SwivelError::Validation(
                "at least one link is required".to_string(),
            ));
        }

        let _ops = self.ops.lock().await;

        if !self.http_test.read().status.is_idle() {
            return Err(SwivelError::Conflict(
                "http test is already running".to_string(),
            ));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let job = HttpTestJob::new(
            request,
            self.prober.clone(),
            self.bus.clone(),
            self.histories.http_test.clone(),
        );

        {
            let mut slot = self.http_test.write();
            slot.status = JobStatus::Running;
            slot.cancel = Some(cancel_tx);
            slot.done = Some(done_rx);
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let task = tokio::spawn(job.run(cancel_rx));
            if matches!(&task.await, Err(e) if e.is_panic()) {
                warn!("http test job panicked");
                manager.bus.log("http test job panicked");
                manager
                    .bus
                    .publish(Event::HttpTestStatus(JobEventStatus::Stopped));
            }
            // The job has published its terminal event; back to idle.
            let mut slot = manager.http_test.write();
            slot.status = JobStatus::Idle;
            slot.cancel = None;
            slot.done = None;
            let _ = done_tx.send(true);
        });

        Ok(())
    }

    /// Signal cancellation; idempotent
    pub async fn stop_http_test(&self) -> Result<()> {
        let _ops = self.ops.lock().await;

        let mut slot = self.http_test.write();
        if let Some(cancel) = slot.cancel.as_ref() {
            let _ = cancel.send(true);
            slot.status = JobStatus::Stopping;
        }
        Ok(())
    }

    pub fn http_test_status(&self) -> JobStatus {
        self.http_test.read().status
    }

    // --- Scanner job ---

    pub async fn start_scanner(self: &Arc<Self>, request: ScannerRequest) -> Result<()> {
        let _ops = self.ops.lock().await;

        if !self.scanner.read().status.is_idle() {
            return Err(SwivelError::Conflict(
                "scanner is already running".to_string(),
            ));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let job = ScannerJob::new(
            request,
            self.ip_prober.clone(),
            self.bus.clone(),
            self.histories.cf_scan.clone(),
        );

        {
            let mut slot = self.scanner.write();
            slot.status = JobStatus::Running;
            slot.cancel = Some(cancel_tx);
            slot.done = Some(done_rx);
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let task = tokio::spawn(job.run(cancel_rx));
            if matches!(&task.await, Err(e) if e.is_panic()) {
                warn!("scanner job panicked");
                manager.bus.log("scanner job panicked");
                manager
                    .bus
                    .publish(Event::CfscanStatus(JobEventStatus::Stopped));
            }
            let mut slot = manager.scanner.write();
            slot.status = JobStatus::Idle;
            slot.cancel = None;
            slot.done = None;
            let _ = done_tx.send(true);
        });

        Ok(())
    }

    /// Signal cancellation; idempotent
    pub async fn stop_scanner(&self) -> Result<()> {
        let _ops = self.ops.lock().await;

        let mut slot = self.scanner.write();
        if let Some(cancel) = slot.cancel.as_ref() {
            let _ = cancel.send(true);
            slot.status = JobStatus::Stopping;
        }
        Ok(())
    }

    pub fn scanner_status(&self) -> JobStatus {
        self.scanner.read().status
    }

    pub fn is_scanning(&self) -> bool {
        !self.scanner.read().status.is_idle()
    }

    // --- Shutdown ---

    /// Stop everything in reverse start order: scanner, tester, proxy
    pub async fn shutdown(&self) {
        info!("shutting down services");

        let scanner_done = self.scanner.read().done.clone();
        let _ = self.stop_scanner().await;
        if let Some(mut done) = scanner_done {
            let _ = done.changed().await;
        }

        let http_done = self.http_test.read().done.clone();
        let _ = self.stop_http_test().await;
        if let Some(mut done) = http_done {
            let _ = done.changed().await;
        }

        match self.stop_proxy().await {
            Ok(()) | Err(SwivelError::NotFound(_)) => {}
            Err(e) => warn!("proxy shutdown error: {}", e),
        }

        info!("all services stopped");
    }
}
