//! Poll loop, change detection and propagation
//!
//! One [`SyncDriver`] exists per process. It owns the only copy of the
//! change-detection state, applies every change to the local load balancers
//! first and only then fans it out to siblings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fanout::{FanOut, FanOutReport};
use super::message::PipeMessage;
use crate::discovery::fetcher::SnapshotFetcher;
use crate::discovery::load_balancer::NodeSink;
use crate::error::{Error, Result};
use nodesync_core::metrics::POLL_ITERATIONS;
use nodesync_core::{ConsumerSpec, SyncBatch};

/// Result of one poll iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Fetched content matches the last propagated batch
    Unchanged,
    /// Batch was applied locally and delivered to every sibling
    Changed { forced: bool, report: FanOutReport },
}

/// Change-detection state of one process, never persisted
#[derive(Debug)]
struct DriverState {
    previous_fingerprint: Mutex<String>,
    force_refresh_pending: AtomicBool,
}

impl DriverState {
    fn new() -> Self {
        Self {
            previous_fingerprint: Mutex::new(SyncBatch::default().fingerprint()),
            force_refresh_pending: AtomicBool::new(false),
        }
    }
}

pub struct SyncDriver {
    name: String,
    interval: Duration,
    consumers: Arc<[ConsumerSpec]>,
    fetcher: SnapshotFetcher,
    sink: Arc<dyn NodeSink>,
    fanout: FanOut,
    state: DriverState,
    loop_started: AtomicBool,
    shutdown: CancellationToken,
}

impl SyncDriver {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        consumers: Arc<[ConsumerSpec]>,
        fetcher: SnapshotFetcher,
        sink: Arc<dyn NodeSink>,
        fanout: FanOut,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            consumers,
            fetcher,
            sink,
            fanout,
            state: DriverState::new(),
            loop_started: AtomicBool::new(false),
            shutdown,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub const fn fetcher(&self) -> &SnapshotFetcher {
        &self.fetcher
    }

    #[must_use]
    pub fn consumers(&self) -> &[ConsumerSpec] {
        &self.consumers
    }

    #[must_use]
    pub fn force_refresh_pending(&self) -> bool {
        self.state.force_refresh_pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn previous_fingerprint(&self) -> String {
        self.state.previous_fingerprint.lock().clone()
    }

    /// Boot-time fetch, applied to this process only
    ///
    /// Every process performs its own boot fetch, so nothing is fanned out.
    /// The fingerprint is left alone: the first poll propagates once, which
    /// also repairs any sibling whose own boot fetch came back empty.
    pub async fn fetch_instance(&self) -> SyncBatch {
        let batch = self.fetcher.fetch_all(&self.consumers).await;
        if batch.is_empty() {
            debug!(driver = %self.name, "Boot fetch returned no services");
            return batch;
        }

        self.apply_locally(&batch);
        info!(
            driver = %self.name,
            services = batch.len(),
            nodes = batch.node_count(),
            "Applied boot-time node snapshot"
        );
        batch
    }

    /// Start the poll loop; a second call fails
    pub fn create_message_instance_loop(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        if self.loop_started.swap(true, Ordering::AcqRel) {
            return Err(Error::LoopAlreadyRunning(self.name.clone()));
        }
        Ok(tokio::spawn(Arc::clone(self).run_loop()))
    }

    async fn run_loop(self: Arc<Self>) {
        info!(
            driver = %self.name,
            interval_secs = self.interval.as_secs(),
            consumers = self.consumers.len(),
            "Node sync loop started"
        );

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }

            match self.poll_once().await {
                Ok(PollOutcome::Unchanged) => {
                    POLL_ITERATIONS.with_label_values(&["unchanged"]).inc();
                    debug!(driver = %self.name, "Service nodes unchanged");
                }
                Ok(PollOutcome::Changed { forced, report }) => {
                    POLL_ITERATIONS.with_label_values(&["changed"]).inc();
                    info!(
                        driver = %self.name,
                        forced = forced,
                        recipients = report.total(),
                        "Service nodes propagated"
                    );
                }
                Err(e) => {
                    POLL_ITERATIONS.with_label_values(&["failed"]).inc();
                    error!(
                        driver = %self.name,
                        error = %e,
                        "Node sync iteration failed, retrying next tick"
                    );
                }
            }
        }

        info!(driver = %self.name, "Node sync loop stopped");
    }

    /// One poll iteration: fetch, compare, propagate
    ///
    /// A pending force-refresh is taken before the fetch, so a push that
    /// lands while this fetch is in flight still forces the next poll. The
    /// forced flag ends here: the poll's own fan-out never arms a sibling.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let forced = self.state.force_refresh_pending.swap(false, Ordering::AcqRel);

        let batch = self.fetcher.fetch_all(&self.consumers).await;
        let fingerprint = batch.fingerprint();

        let unchanged = !forced && *self.state.previous_fingerprint.lock() == fingerprint;
        if unchanged {
            return Ok(PollOutcome::Unchanged);
        }

        match self.propagate(batch, false).await {
            Ok(report) => {
                *self.state.previous_fingerprint.lock() = fingerprint;
                Ok(PollOutcome::Changed { forced, report })
            }
            Err(e) => {
                if forced {
                    self.state.force_refresh_pending.store(true, Ordering::Release);
                }
                Err(e)
            }
        }
    }

    /// Apply and fan out a batch right away
    ///
    /// With `force_refresh` the next scheduled poll also propagates, even if
    /// its content matches the previous one. Siblings receive the flag too,
    /// so it reaches whichever process owns the poll loop.
    pub async fn sync_nodes(&self, batch: SyncBatch, force_refresh: bool) -> Result<FanOutReport> {
        if force_refresh {
            self.state.force_refresh_pending.store(true, Ordering::Release);
        }
        self.propagate(batch, force_refresh).await
    }

    /// Message from a sibling: apply here, never forward
    ///
    /// A forced message arms this driver's next poll.
    pub fn on_pipe_message(&self, message: &PipeMessage) {
        debug!(
            driver = %self.name,
            services = message.data().len(),
            force_refresh = message.force_refresh(),
            "Applying node update from sibling"
        );
        self.apply_locally(message.data());
        if message.force_refresh() {
            self.state.force_refresh_pending.store(true, Ordering::Release);
        }
    }

    async fn propagate(&self, batch: SyncBatch, force_refresh: bool) -> Result<FanOutReport> {
        self.apply_locally(&batch);

        let message = PipeMessage::new(batch, force_refresh);
        let report = self.fanout.broadcast(&message).await;
        if report.is_complete() {
            Ok(report)
        } else {
            Err(Error::FanOutIncomplete {
                failed: report.failed.len(),
                total: report.total(),
            })
        }
    }

    fn apply_locally(&self, batch: &SyncBatch) {
        for snapshot in batch {
            if snapshot.service_name.is_empty() || snapshot.load_balancer.is_empty() {
                warn!(
                    driver = %self.name,
                    service = %snapshot.service_name,
                    "Skipping snapshot without service or load balancer name"
                );
                continue;
            }
            self.sink
                .set_nodes(&snapshot.service_name, &snapshot.load_balancer, snapshot.nodes.clone());
        }
    }
}
