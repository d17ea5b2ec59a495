//! Periodic poll coordinator: a drop-never-queue scheduler with stuck-poll
//! detection and exponential backoff, publishing the most recent decoded
//! [`Snapshot`] to any number of readers.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::InverterClient;
use crate::model::ModelName;
use crate::snapshot::Snapshot;

/// A poll is declared stuck if it has run longer than this without
/// completing. Checked once per tick, not via a dedicated timer.
const STUCK_THRESHOLD: Duration = Duration::from_secs(30);
/// Upper bound on one poll's own wall-clock budget: the nominal 30s window
/// plus a 5s grace period, matching the coordinator's `wait_for` deadline.
const POLL_DEADLINE: Duration = Duration::from_secs(35);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// One poll attempt, abstracted away from any particular transport so the
/// scheduling logic below can be exercised without real sockets.
type PollFn = Arc<dyn Fn(ModelName) -> Pin<Box<dyn Future<Output = Snapshot> + Send>> + Send + Sync>;

fn inverter_poll_fn(inverter_ip: IpAddr, local_ip: IpAddr, local_port: u16) -> PollFn {
    Arc::new(move |model_name| {
        Box::pin(async move {
            let mut client = InverterClient::new(inverter_ip, local_ip, local_port, model_name);
            client.poll().await
        })
    })
}

/// Handle to a running poll coordinator. Dropping it does not stop the
/// background task; call [`PollCoordinator::shutdown`] for that.
pub struct PollCoordinator {
    snapshots: watch::Receiver<Snapshot>,
    model_tx: mpsc::UnboundedSender<ModelName>,
    handle: JoinHandle<()>,
}

impl PollCoordinator {
    /// Spawns the coordinator's background task, immediately. The first
    /// tick (and therefore the first poll) fires after `scan_interval`.
    pub fn spawn(inverter_ip: IpAddr, local_ip: IpAddr, local_port: u16, model_name: ModelName, scan_interval: Duration) -> Self {
        Self::spawn_with(inverter_poll_fn(inverter_ip, local_ip, local_port), model_name, scan_interval)
    }

    fn spawn_with(poll_fn: PollFn, model_name: ModelName, scan_interval: Duration) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::empty(Utc::now()));
        let (model_tx, model_rx) = mpsc::unbounded_channel();
        let model = Arc::new(Mutex::new(model_name));

        let handle = tokio::spawn(run_loop(poll_fn, model, scan_interval, snapshot_tx, model_rx));

        Self {
            snapshots: snapshot_rx,
            model_tx,
            handle,
        }
    }

    /// A receiver observing the most recently published snapshot. Cloning
    /// it is cheap; every clone always sees either a complete snapshot or
    /// the one before it, never a partially constructed one.
    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// Requests an atomic model change, effective before the next tick.
    /// Silently dropped if the coordinator has already shut down.
    pub fn set_model(&self, model_name: ModelName) {
        let _ = self.model_tx.send(model_name);
    }

    /// Aborts the background task, tearing down any in-flight transport.
    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// Why a spawned poll produced no snapshot.
enum PollFailure {
    Timeout,
    Aborted,
}

type PollOutcome = Result<Snapshot, PollFailure>;

async fn run_loop(
    poll_fn: PollFn,
    model: Arc<Mutex<ModelName>>,
    scan_interval: Duration,
    snapshot_tx: watch::Sender<Snapshot>,
    mut model_rx: mpsc::UnboundedReceiver<ModelName>,
) {
    let mut ticker = tokio::time::interval(scan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut in_flight: Option<JoinHandle<PollOutcome>> = None;
    let mut last_start: Option<Instant> = None;
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::select! {
            biased;

            Some(new_model) = model_rx.recv() => {
                info!(model = new_model, "switching active inverter model");
                *model.lock().unwrap() = new_model;
            }

            result = poll_in_flight(&mut in_flight), if in_flight.is_some() => {
                in_flight = None;
                last_start = None;
                handle_completion(result, &mut consecutive_failures, &snapshot_tx).await;
            }

            _ = ticker.tick() => {
                if in_flight.is_some() {
                    let stuck = last_start.map(|t| t.elapsed() > STUCK_THRESHOLD).unwrap_or(false);
                    if !stuck {
                        debug!("poll already in flight, dropping this tick");
                        continue;
                    }
                    error!("poll exceeded the stuck-poll threshold, forcing it to clear");
                    if let Some(handle) = in_flight.take() {
                        handle.abort();
                    }
                    last_start = None;
                    record_failure(&mut consecutive_failures);
                    backoff_sleep(consecutive_failures).await;
                }

                let model_name = *model.lock().unwrap();
                last_start = Some(Instant::now());
                in_flight = Some(spawn_poll(poll_fn.clone(), model_name));
            }
        }
    }
}

async fn poll_in_flight(handle: &mut Option<JoinHandle<PollOutcome>>) -> PollOutcome {
    match handle.as_mut() {
        Some(h) => h.await.unwrap_or(Err(PollFailure::Aborted)),
        None => std::future::pending().await,
    }
}

fn spawn_poll(poll_fn: PollFn, model_name: ModelName) -> JoinHandle<PollOutcome> {
    tokio::spawn(async move {
        tokio::time::timeout(POLL_DEADLINE, poll_fn(model_name))
            .await
            .map_err(|_| PollFailure::Timeout)
    })
}

async fn handle_completion(outcome: PollOutcome, consecutive_failures: &mut u32, snapshot_tx: &watch::Sender<Snapshot>) {
    match outcome {
        Ok(snapshot) if !snapshot.is_empty() => {
            debug!("poll succeeded, publishing snapshot");
            *consecutive_failures = 0;
            let _ = snapshot_tx.send(snapshot);
        }
        Ok(_empty) => {
            warn!("poll returned no usable data across any register group");
            record_failure(consecutive_failures);
            backoff_sleep(*consecutive_failures).await;
        }
        Err(PollFailure::Timeout) => {
            warn!("poll timed out");
            record_failure(consecutive_failures);
            backoff_sleep(*consecutive_failures).await;
        }
        Err(PollFailure::Aborted) => {
            warn!("poll task was aborted before completing");
            record_failure(consecutive_failures);
            backoff_sleep(*consecutive_failures).await;
        }
    }
}

fn record_failure(consecutive_failures: &mut u32) {
    *consecutive_failures += 1;
}

async fn backoff_sleep(consecutive_failures: u32) {
    let secs = 2u64.saturating_pow(consecutive_failures.min(30));
    let duration = Duration::from_secs(secs).min(MAX_BACKOFF);
    debug!(?duration, consecutive_failures, "backing off before next poll");
    tokio::time::sleep(duration).await;
}
