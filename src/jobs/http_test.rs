//! Bulk HTTP test job
//!
//! Probes a list of outbound links in parallel, streaming a result and a
//! progress event per completed probe. Successful results are appended to
//! the history file in one batch when the job ends; the terminal status
//! event is always the last event the job publishes.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::events::EventBus;
use crate::history::HistoryFile;
use crate::models::{Event, HttpResult, HttpTestRequest, JobEventStatus, Progress};
use crate::probe::{ProbeOptions, Prober};

pub struct HttpTestJob {
    request: HttpTestRequest,
    prober: Arc<dyn Prober>,
    bus: EventBus,
    history: Arc<HistoryFile>,
}

impl HttpTestJob {
    pub fn new(
        request: HttpTestRequest,
        prober: Arc<dyn Prober>,
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

    #[instrument(skip_all, fields(links = self.request.links.len(), threads = self.request.thread_count))]
    pub async fn run(self, cancel: watch::Receiver<bool>) {
        let total = self.request.links.len() as u64;
        let opts = ProbeOptions {
            destination_url: self.request.destination_url.clone(),
            timeout_ms: self.request.timeout_ms,
            measure_speed: self.request.measure_speed,
            ipv4_only: self.request.ipv4_only,
        };
        let workers = self.request.thread_count.max(1) as usize;

        info!("http test started");
        self.bus
            .publish(Event::HttpTestStatus(JobEventStatus::Running));

        // Progress publications happen under this lock so `done` counts
        // reach subscribers in non-decreasing order.
        let progress = Arc::new(Mutex::new(0u64));

        let results: Vec<Option<HttpResult>> = futures::stream::iter(self.request.links.clone())
            .map(|link| {
                let prober = self.prober.clone();
                let opts = opts.clone();
                let cancel = cancel.clone();
                let bus = self.bus.clone();
                let progress = progress.clone();

                async move {
                    if *cancel.borrow() {
                        return None;
                    }

                    match prober.probe(&link, &opts, cancel).await {
                        Ok((health, status)) => {
                            let result = HttpResult {
                                link,
                                delay_ms: Some(health.delay_ms),
                                download_mbps: opts.measure_speed.then_some(health.download_mbps),
                                upload_mbps: None,
                                status: Some(status),
                                location: health.location,
                                error: None,
                            };
                            {
                                let mut done = progress.lock();
                                *done += 1;
                                bus.publish(Event::HttpResult(result.clone()));
                                bus.publish(Event::HttpTestProgress(Progress { done: *done, total }));
                            }
                            Some(result)
                        }
                        Err(crate::error::SwivelError::Cancelled) => None,
                        Err(e) => {
                            let mut done = progress.lock();
                            *done += 1;
                            bus.log(format!("test {} failed: {}", link, e));
                            bus.publish(Event::HttpTestProgress(Progress { done: *done, total }));
                            None
                        }
                    }
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let stopped = *cancel.borrow();
        let successes: Vec<HttpResult> = results.into_iter().flatten().collect();

        if let Err(e) = self.history.append(&successes).await {
            self.bus
                .log(format!("failed to persist http test history: {}", e));
        }

        let terminal = if stopped {
            JobEventStatus::Stopped
        } else {
            JobEventStatus::Finished
        };
        info!(successes = successes.len(), status = ?terminal, "http test ended");
        self.bus.publish(Event::HttpTestStatus(terminal));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BusMessage;
    use crate::probe::testing::ScriptedProber;
    use std::time::Duration;

    fn request(links: &[&str], threads: u16) -> HttpTestRequest {
        HttpTestRequest {
            links: links.iter().map(|s| s.to_string()).collect(),
            thread_count: threads,
            destination_url: "https://example.test/generate_204".to_string(),
            timeout_ms: 1_000,
            measure_speed: false,
            ipv4_only: false,
        }
    }

    async fn collect_until_terminal(stream: &mut crate::events::EventStream) -> Vec<Event> {
        let mut events = Vec::new();
        let deadline = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if let BusMessage::Event(event) = stream.recv().await {
                    let terminal = matches!(
                        event,
                        Event::HttpTestStatus(status) if status.is_terminal()
                    );
                    events.push(event);
                    if terminal {
                        break;
                    }
                }
            }
        });
        deadline.await.expect("job never finished");
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_and_progress_per_completion() {
        let prober = ScriptedProber::new();
        prober.set_healthy("a");
        prober.set_healthy("b");
        prober.set_failing("c");

        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(HistoryFile::new(dir.path().join("http.csv")));
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        let job = HttpTestJob::new(request(&["a", "b", "c"], 2), prober, bus, history.clone());
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        job.run(cancel_rx).await;

        let events = collect_until_terminal(&mut stream).await;

        let result_count = events
            .iter()
            .filter(|e| matches!(e, Event::HttpResult(_)))
            .count();
        let progress: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                Event::HttpTestProgress(p) => Some(p.done),
                _ => None,
            })
            .collect();

        // Two successes stream result rows; the failure contributes only
        // progress (and a log line).
        assert_eq!(result_count, 2);
        assert_eq!(progress.len(), 3);
        let mut sorted = progress.clone();
        sorted.sort_unstable();
        assert_eq!(progress, sorted, "progress must be non-decreasing");
        assert_eq!(*progress.last().unwrap(), 3);

        // Terminal status is the last event.
        assert!(matches!(
            events.last(),
            Some(Event::HttpTestStatus(JobEventStatus::Finished))
        ));

        // Only successes were persisted.
        let rows: Vec<HttpResult> = history.load().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.is_success()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_produces_stopped_terminal() {
        let prober = ScriptedProber::new();
        for link in ["a", "b", "c", "d"] {
            prober.set_healthy(link);
        }

        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(HistoryFile::new(dir.path().join("http.csv")));
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let job = HttpTestJob::new(request(&["a", "b", "c", "d"], 2), prober, bus, history);
        job.run(cancel_rx).await;

        let events = collect_until_terminal(&mut stream).await;
        assert!(matches!(
            events.last(),
            Some(Event::HttpTestStatus(JobEventStatus::Stopped))
        ));
    }
}
