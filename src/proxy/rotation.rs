//! Proxy rotation engine
//!
//! A state machine that continuously keeps a healthy outbound installed
//! behind the local listener: `probing` sweeps the pool, `active` holds a
//! working outbound while watching its liveness and the rotation timer,
//! `switching` replaces it, `stalled` backs off after a fully failed
//! sweep. The listener is bound once at start and stays bound until
//! `stopped`; swaps never touch the socket.

use std::cmp::max;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tokio::time::{interval_at, sleep, sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SwivelError};
use crate::events::EventBus;
use crate::models::{
    Event, InboundInfo, OutboundHealth, ProxyDetails, ProxyStatusPayload, RotationState,
};
use crate::probe::{ProbeOptions, Prober};
use crate::proxy::core::{InboundHandle, ProxyCore};

/// Floor of the liveness probe cadence while active
const LIVENESS_FLOOR: Duration = Duration::from_secs(30);
/// Consecutive liveness failures that force a switch
const LIVENESS_THRESHOLD: u32 = 3;
/// Stall backoff ladder
const BACKOFF_INITIAL: Duration = Duration::from_secs(10);
const BACKOFF_CAP: Duration = Duration::from_secs(120);
/// Details republish cadence while active
const DETAILS_CADENCE: Duration = Duration::from_secs(5);

/// Rotation engine parameters
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Ordered candidate pool
    pub pool: Vec<String>,
    /// Time between rotations; zero disables timed rotation
    pub interval: Duration,
    pub probe_opts: ProbeOptions,
}

/// Atomically replaceable observer snapshot of the proxy instance
///
/// The engine writes the whole record under a short write lock; readers
/// never contend with probe or swap I/O.
pub struct SharedDetails {
    inner: RwLock<ProxyDetails>,
}

impl SharedDetails {
    fn new(details: ProxyDetails) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(details),
        })
    }

    pub fn snapshot(&self) -> ProxyDetails {
        self.inner.read().clone()
    }

    pub fn state(&self) -> RotationState {
        self.inner.read().rotation_state
    }

    fn update(&self, f: impl FnOnce(&mut ProxyDetails)) {
        f(&mut self.inner.write());
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Probing,
    Active,
    Switching { current_usable: bool },
    Stalled,
    Stopping,
}

enum SweepOutcome {
    Activated(OutboundHealth),
    Exhausted,
    Cancelled,
}

/// The rotation state machine
pub struct RotationEngine {
    pool: Vec<String>,
    interval: Duration,
    probe_opts: ProbeOptions,
    inbound: InboundInfo,
    prober: Arc<dyn Prober>,
    core: Arc<dyn ProxyCore>,
    bus: EventBus,
    shared: Arc<SharedDetails>,
    rotate: Arc<Notify>,
}

impl RotationEngine {
    pub fn new(
        config: RotationConfig,
        inbound: InboundInfo,
        prober: Arc<dyn Prober>,
        core: Arc<dyn ProxyCore>,
        bus: EventBus,
    ) -> Self {
        let details = ProxyDetails {
            inbound: inbound.clone(),
            active: None,
            pool: config.pool.clone(),
            interval_s: config.interval.as_secs(),
            rotation_state: RotationState::Stopped,
            next_rotation_at: None,
            total: config.pool.len(),
        };

        Self {
            pool: config.pool,
            interval: config.interval,
            probe_opts: config.probe_opts,
            inbound,
            prober,
            core,
            bus,
            shared: SharedDetails::new(details),
            rotate: Arc::new(Notify::new()),
        }
    }

    /// Observer snapshot handle, valid for the engine's whole lifetime
    pub fn shared(&self) -> Arc<SharedDetails> {
        self.shared.clone()
    }

    /// Non-blocking forced-rotation signal; coalesced while a sweep runs
    pub fn rotate_handle(&self) -> Arc<Notify> {
        self.rotate.clone()
    }

    /// Whether timed rotation is in effect
    fn rotation_enabled(&self) -> bool {
        self.pool.len() > 1 && !self.interval.is_zero()
    }

    /// Run the engine until `stop` flips
    ///
    /// Binds the listener first; a bind failure is fatal and terminates
    /// the lifecycle with `proxy_status=stopped` carrying the error.
    #[instrument(skip_all, fields(inbound = %self.inbound.bind_addr(), pool = self.pool.len()))]
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let handle = match self.core.bind(&self.inbound).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("listener bind failed: {}", e);
                self.bus.log(format!("proxy start failed: {}", e));
                self.shared.update(|d| d.rotation_state = RotationState::Stopped);
                self.bus.publish(Event::ProxyStatus(ProxyStatusPayload::with_error(
                    RotationState::Stopped,
                    e.to_string(),
                )));
                return Err(e);
            }
        };

        let mut phase = Phase::Probing;
        let mut current: Option<OutboundHealth> = None;
        let mut next_rotation: Option<Instant> = None;
        let mut backoff = BACKOFF_INITIAL;

        loop {
            match phase {
                Phase::Probing => {
                    self.drain_rotate();
                    self.transition(RotationState::Probing, &current, None);

                    match self.sweep(&current, false, &stop).await {
                        SweepOutcome::Activated(health) => {
                            match self.activate(&*handle, health, &mut current, &mut next_rotation)
                            {
                                Ok(()) => {
                                    backoff = BACKOFF_INITIAL;
                                    phase = Phase::Active;
                                }
                                Err(e) => {
                                    return self.fail_fatal(&*handle, e);
                                }
                            }
                        }
                        SweepOutcome::Exhausted => phase = Phase::Stalled,
                        SweepOutcome::Cancelled => phase = Phase::Stopping,
                    }
                }

                Phase::Active => {
                    phase = self.run_active(&mut current, &mut next_rotation, &mut stop).await;
                }

                Phase::Switching { current_usable } => {
                    self.drain_rotate();
                    self.transition(RotationState::Switching, &current, None);

                    let sole = self.pool.len() <= 1;
                    match self.sweep(&current, !sole, &stop).await {
                        SweepOutcome::Activated(health) => {
                            match self.activate(&*handle, health, &mut current, &mut next_rotation)
                            {
                                Ok(()) => {
                                    backoff = BACKOFF_INITIAL;
                                    phase = Phase::Active;
                                }
                                Err(e) => {
                                    return self.fail_fatal(&*handle, e);
                                }
                            }
                        }
                        SweepOutcome::Exhausted => {
                            if current_usable && current.is_some() && !sole {
                                // No alternative passed, but the installed
                                // outbound is still live: keep it.
                                info!("sweep found no alternative, keeping current outbound");
                                self.bus
                                    .log("rotation found no healthy alternative, keeping current");
                                next_rotation = self
                                    .rotation_enabled()
                                    .then(|| Instant::now() + self.interval);
                                self.transition(
                                    RotationState::Active,
                                    &current,
                                    wall_clock(next_rotation),
                                );
                                phase = Phase::Active;
                            } else {
                                phase = Phase::Stalled;
                            }
                        }
                        SweepOutcome::Cancelled => phase = Phase::Stopping,
                    }
                }

                Phase::Stalled => {
                    self.transition(RotationState::Stalled, &current, None);
                    self.bus.log(format!(
                        "no healthy outbound after full sweep, retrying in {}s",
                        backoff.as_secs()
                    ));

                    tokio::select! {
                        _ = sleep(backoff) => {
                            backoff = max(BACKOFF_INITIAL, (backoff * 2).min(BACKOFF_CAP));
                            phase = Phase::Probing;
                        }
                        _ = self.rotate.notified() => {
                            // Operator override short-circuits the backoff.
                            phase = Phase::Probing;
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                phase = Phase::Stopping;
                            }
                        }
                    }
                }

                Phase::Stopping => {
                    self.transition(RotationState::Stopping, &current, None);
                    handle.close();
                    self.shared.update(|d| {
                        d.rotation_state = RotationState::Stopped;
                        d.next_rotation_at = None;
                    });
                    // Terminal event: nothing is published after this.
                    self.bus
                        .publish(Event::ProxyStatus(ProxyStatusPayload::new(
                            RotationState::Stopped,
                        )));
                    info!("rotation engine stopped");
                    return Ok(());
                }
            }
        }
    }

    /// The `active` hold loop; returns the next phase
    async fn run_active(
        &self,
        current: &mut Option<OutboundHealth>,
        next_rotation: &mut Option<Instant>,
        stop: &mut watch::Receiver<bool>,
    ) -> Phase {
        let active_config = match current.as_ref() {
            Some(health) => health.config.clone(),
            None => return Phase::Probing,
        };

        let liveness_cadence = max(LIVENESS_FLOOR, self.interval / 4);
        let mut liveness = interval_at(Instant::now() + liveness_cadence, liveness_cadence);
        let mut details = interval_at(Instant::now() + DETAILS_CADENCE, DETAILS_CADENCE);
        let mut consecutive_failures = 0u32;

        loop {
            let deadline = *next_rotation;
            let rotation_due = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = rotation_due => {
                    debug!("rotation interval elapsed");
                    return Phase::Switching { current_usable: true };
                }
                _ = self.rotate.notified() => {
                    info!("forced rotation requested");
                    return Phase::Switching { current_usable: true };
                }
                _ = liveness.tick() => {
                    match self
                        .prober
                        .probe(&active_config, &self.probe_opts, stop.clone())
                        .await
                    {
                        Ok((health, _)) => {
                            consecutive_failures = 0;
                            *current = Some(health.clone());
                            self.shared.update(|d| d.active = Some(health));
                            self.bus.publish(Event::ProxyDetails(self.shared.snapshot()));
                        }
                        Err(SwivelError::Cancelled) => return Phase::Stopping,
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(
                                "liveness probe {}/{} failed: {}",
                                consecutive_failures, LIVENESS_THRESHOLD, e
                            );
                            self.bus.log(format!("active outbound probe failed: {}", e));
                            if consecutive_failures >= LIVENESS_THRESHOLD {
                                return Phase::Switching { current_usable: false };
                            }
                        }
                    }
                }
                _ = details.tick() => {
                    self.shared.update(|d| d.next_rotation_at = wall_clock(*next_rotation));
                    self.bus.publish(Event::ProxyDetails(self.shared.snapshot()));
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return Phase::Stopping;
                    }
                }
            }
        }
    }

    /// One pass over the pool, starting after the current outbound
    ///
    /// The current config is excluded when `exclude_current` (forced and
    /// timed switches), otherwise it is tried last by virtue of the start
    /// offset.
    async fn sweep(
        &self,
        current: &Option<OutboundHealth>,
        exclude_current: bool,
        stop: &watch::Receiver<bool>,
    ) -> SweepOutcome {
        let len = self.pool.len();
        if len == 0 {
            return SweepOutcome::Exhausted;
        }

        let current_config = current.as_ref().map(|h| h.config.as_str());
        let start = current_config
            .and_then(|c| self.pool.iter().position(|p| p == c))
            .map(|i| (i + 1) % len)
            .unwrap_or(0);

        for offset in 0..len {
            let candidate = &self.pool[(start + offset) % len];
            if exclude_current && len > 1 && Some(candidate.as_str()) == current_config {
                continue;
            }

            match self
                .prober
                .probe(candidate, &self.probe_opts, stop.clone())
                .await
            {
                Ok((health, _)) => {
                    debug!(%candidate, delay_ms = health.delay_ms, "candidate healthy");
                    return SweepOutcome::Activated(health);
                }
                Err(SwivelError::Cancelled) => return SweepOutcome::Cancelled,
                Err(e) => {
                    debug!(%candidate, "candidate failed: {}", e);
                    self.bus.log(format!("probe {} failed: {}", candidate, e));
                }
            }
        }

        SweepOutcome::Exhausted
    }

    /// Install a freshly probed outbound and move to `active`
    ///
    /// The health record was produced by the sweep that just returned, so
    /// the swap-freshness requirement holds by construction.
    fn activate(
        &self,
        handle: &dyn InboundHandle,
        health: OutboundHealth,
        current: &mut Option<OutboundHealth>,
        next_rotation: &mut Option<Instant>,
    ) -> Result<()> {
        handle.swap_outbound(&health.config)?;
        info!(config = %health.config, delay_ms = health.delay_ms, "outbound activated");

        *current = Some(health);
        *next_rotation = self
            .rotation_enabled()
            .then(|| Instant::now() + self.interval);

        self.transition(RotationState::Active, current, wall_clock(*next_rotation));
        Ok(())
    }

    /// Publish a state change: status, then the refreshed details snapshot
    fn transition(
        &self,
        state: RotationState,
        current: &Option<OutboundHealth>,
        next_rotation_at: Option<DateTime<Utc>>,
    ) {
        let changed = {
            let mut details = self.shared.inner.write();
            let changed = details.rotation_state != state;
            details.rotation_state = state;
            details.active = current.clone();
            details.next_rotation_at = next_rotation_at;
            changed
        };

        if changed {
            self.bus
                .publish(Event::ProxyStatus(ProxyStatusPayload::new(state)));
            self.bus
                .publish(Event::ProxyDetails(self.shared.snapshot()));
        }
    }

    fn fail_fatal(&self, handle: &dyn InboundHandle, error: SwivelError) -> Result<()> {
        warn!("fatal rotation error: {}", error);
        self.bus.log(format!("proxy failed: {}", error));
        handle.close();
        self.shared.update(|d| {
            d.rotation_state = RotationState::Stopped;
            d.next_rotation_at = None;
        });
        self.bus
            .publish(Event::ProxyStatus(ProxyStatusPayload::with_error(
                RotationState::Stopped,
                error.to_string(),
            )));
        Err(error)
    }

    /// Absorb a pending rotate permit so signals raised mid-sweep coalesce
    fn drain_rotate(&self) {
        let _ = self.rotate.notified().now_or_never();
    }
}

/// Convert a monotonic deadline into the published wall-clock time
fn wall_clock(next: Option<Instant>) -> Option<DateTime<Utc>> {
    next.map(|at| {
        let remaining = at.saturating_duration_since(Instant::now());
        Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BusMessage;
    use crate::probe::testing::ScriptedProber;
    use crate::proxy::core::testing::{FailingCore, MockCore};
    use std::sync::atomic::Ordering;

    fn test_inbound() -> InboundInfo {
        InboundInfo {
            protocol: "socks".to_string(),
            addr: "127.0.0.1".to_string(),
            port: 1080,
            orig_link: String::new(),
        }
    }

    fn engine_with(
        pool: &[&str],
        interval: Duration,
        prober: Arc<ScriptedProber>,
        core: Arc<MockCore>,
        bus: EventBus,
    ) -> RotationEngine {
        RotationEngine::new(
            RotationConfig {
                pool: pool.iter().map(|s| s.to_string()).collect(),
                interval,
                probe_opts: ProbeOptions::default(),
            },
            test_inbound(),
            prober,
            core,
            bus,
        )
    }

    /// Collect proxy_status states until `target` appears or time runs out
    async fn wait_for_state(
        stream: &mut crate::events::EventStream,
        target: RotationState,
    ) -> Vec<RotationState> {
        let mut states = Vec::new();
        let deadline = tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                if let BusMessage::Event(Event::ProxyStatus(payload)) = stream.recv().await {
                    states.push(payload.status);
                    if payload.status == target {
                        break;
                    }
                }
            }
        });
        deadline.await.expect("state not reached in time");
        states
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_rotation_cycle() {
        let prober = ScriptedProber::new();
        prober.set_healthy("a");
        prober.set_healthy("b");
        let core = MockCore::new();
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        let engine = engine_with(&["a", "b"], Duration::from_secs(2), prober, core.clone(), bus);
        let shared = engine.shared();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));

        // stopped -> probing -> active(a)
        let states = wait_for_state(&mut stream, RotationState::Active).await;
        assert_eq!(states, vec![RotationState::Probing, RotationState::Active]);
        assert_eq!(
            shared.snapshot().active.unwrap().config,
            "a".to_string()
        );
        assert_eq!(shared.snapshot().total, 2);

        // Interval elapses: switching -> active(b)
        let states = wait_for_state(&mut stream, RotationState::Active).await;
        assert_eq!(
            states,
            vec![RotationState::Switching, RotationState::Active]
        );
        assert_eq!(shared.snapshot().active.unwrap().config, "b".to_string());

        // And wraps back to a on the next interval.
        wait_for_state(&mut stream, RotationState::Active).await;
        assert_eq!(shared.snapshot().active.unwrap().config, "a".to_string());

        // The listener was bound exactly once across all swaps.
        assert_eq!(core.bind_count.load(Ordering::SeqCst), 1);

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_skips_unreachable_candidate() {
        let prober = ScriptedProber::new();
        prober.set_failing("a");
        prober.set_healthy("b");
        let core = MockCore::new();
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        // Long interval so the timer never fires during the test.
        let engine = engine_with(
            &["a", "b"],
            Duration::from_secs(3600),
            prober.clone(),
            core,
            bus,
        );
        let shared = engine.shared();
        let rotate = engine.rotate_handle();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));

        wait_for_state(&mut stream, RotationState::Active).await;
        assert_eq!(shared.snapshot().active.unwrap().config, "b".to_string());

        // Forced rotation: the only alternative (a) is still down, so the
        // engine keeps b after one sweep.
        rotate.notify_one();
        let states = wait_for_state(&mut stream, RotationState::Active).await;
        assert_eq!(
            states,
            vec![RotationState::Switching, RotationState::Active]
        );
        assert_eq!(shared.snapshot().active.unwrap().config, "b".to_string());

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_and_recovery_keeps_listener_bound() {
        let prober = ScriptedProber::new();
        prober.set_healthy("a");
        let core = MockCore::new();
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        let engine = engine_with(&["a"], Duration::from_secs(0), prober.clone(), core.clone(), bus);
        let shared = engine.shared();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));

        wait_for_state(&mut stream, RotationState::Active).await;
        // Sole member: rotation is disabled.
        assert!(shared.snapshot().next_rotation_at.is_none());

        // The outbound dies; three liveness failures force a switch, the
        // sole-member sweep fails, and the engine stalls.
        prober.set_failing("a");
        let states = wait_for_state(&mut stream, RotationState::Stalled).await;
        assert_eq!(
            states,
            vec![RotationState::Switching, RotationState::Stalled]
        );

        // Recovery on a later backoff tick.
        prober.set_healthy("a");
        let states = wait_for_state(&mut stream, RotationState::Active).await;
        assert!(states.contains(&RotationState::Probing));
        assert_eq!(shared.snapshot().active.unwrap().config, "a".to_string());

        // Stall never rebound or closed the listener.
        assert_eq!(core.bind_count.load(Ordering::SeqCst), 1);

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_candidates_down_backs_off_and_retries() {
        let prober = ScriptedProber::new();
        prober.set_failing("a");
        prober.set_failing("b");
        let core = MockCore::new();
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        let engine = engine_with(&["a", "b"], Duration::from_secs(60), prober.clone(), core, bus);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));

        let states = wait_for_state(&mut stream, RotationState::Stalled).await;
        assert_eq!(states, vec![RotationState::Probing, RotationState::Stalled]);

        // One candidate recovers; a backoff tick finds it.
        prober.set_healthy("b");
        let states = wait_for_state(&mut stream, RotationState::Active).await;
        assert_eq!(
            states,
            vec![RotationState::Probing, RotationState::Active]
        );

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_publishes_terminal_status_last() {
        let prober = ScriptedProber::new();
        prober.set_healthy("a");
        let core = MockCore::new();
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        let engine = engine_with(&["a", "b"], Duration::from_secs(3600), prober, core, bus);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));

        wait_for_state(&mut stream, RotationState::Active).await;

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        // Drain whatever remains; the last event must be stopped status.
        let mut last = None;
        while let Some(event) = stream.try_recv() {
            last = Some(event);
        }
        match last {
            Some(Event::ProxyStatus(payload)) => {
                assert_eq!(payload.status, RotationState::Stopped)
            }
            other => panic!("expected terminal proxy_status, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_failure_terminates_with_error() {
        let prober = ScriptedProber::new();
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        let engine = RotationEngine::new(
            RotationConfig {
                pool: vec!["a".to_string()],
                interval: Duration::from_secs(60),
                probe_opts: ProbeOptions::default(),
            },
            test_inbound(),
            prober,
            Arc::new(FailingCore),
            bus,
        );
        let (_stop_tx, stop_rx) = watch::channel(false);

        let err = engine.run(stop_rx).await.unwrap_err();
        assert!(matches!(err, SwivelError::Fatal(_)));

        // The terminal status carries the bind error.
        let mut saw_terminal_error = false;
        while let Some(event) = stream.try_recv() {
            if let Event::ProxyStatus(payload) = event {
                if payload.status == RotationState::Stopped {
                    saw_terminal_error = payload.error.is_some();
                }
            }
        }
        assert!(saw_terminal_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_zero_holds_active_indefinitely() {
        let prober = ScriptedProber::new();
        prober.set_healthy("a");
        prober.set_healthy("b");
        let core = MockCore::new();
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        let engine = engine_with(&["a", "b"], Duration::from_secs(0), prober, core, bus);
        let shared = engine.shared();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));

        wait_for_state(&mut stream, RotationState::Active).await;
        assert!(shared.snapshot().next_rotation_at.is_none());

        // A long quiet period passes without any switch.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(shared.state(), RotationState::Active);
        assert_eq!(shared.snapshot().active.unwrap().config, "a".to_string());

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
