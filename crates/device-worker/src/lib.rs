//! Background polling engine shared by every physical device.
//!
//! A worker owns its device (and through it the transport) exclusively. Other
//! components talk to it through a [`WorkerHandle`]: they read the latest
//! published snapshot, check health, and append commands. Commands only run
//! inside the worker's own tick, before the telemetry read.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use inverter_codec::CodecError;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use transport::TransportError;
use types::TelemetryPoint;

pub mod inverter;
pub mod meter;

pub use inverter::{plan_limit, EnergyRequest, InverterDevice, InverterDeviceConfig, LimitPlan};
pub use meter::{MeterDevice, MeterDeviceConfig};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pause between two ticks.
    pub poll_interval: Duration,
    /// Pause before retrying a failed connect.
    pub connect_backoff: Duration,
    /// Snapshot age that triggers a reconnect.
    pub stale_soft: Duration,
    /// Snapshot age after which the device is considered gone.
    pub stale_hard: Duration,
    /// Pause after a reconnect before the next tick.
    pub reconnect_pause: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            connect_backoff: Duration::from_secs(10),
            stale_soft: Duration::from_secs(60),
            stale_hard: Duration::from_secs(120),
            reconnect_pause: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] CodecError),
    #[error("device is not connected")]
    NotConnected,
    #[error("unsupported device type {0:?}")]
    Unsupported(String),
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("no telemetry received yet")]
    NoTelemetry,
}

impl DeviceError {
    /// Transport failures are retried; everything else is a bad answer.
    pub fn is_transport(&self) -> bool {
        matches!(self, DeviceError::Transport(_))
    }
}

/// One physical device driven by a worker.
#[async_trait]
pub trait Device: Send + 'static {
    type Snapshot: Send + Sync + 'static;
    type Command: fmt::Debug + Send + Sync + 'static;

    fn name(&self) -> String;

    /// Opens the transport and fetches whatever the device needs up front.
    async fn connect(&mut self) -> Result<(), DeviceError>;

    async fn disconnect(&mut self);

    async fn execute(&mut self, command: &Self::Command) -> Result<(), DeviceError>;

    /// `Ok(None)` means nothing usable arrived this tick.
    async fn read(&mut self) -> Result<Option<Self::Snapshot>, DeviceError>;

    fn telemetry(&self, _snapshot: &Self::Snapshot) -> Vec<TelemetryPoint> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Polling,
    Reconnecting,
    Suspended,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Run,
    Suspend,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    NotRunning,
    NoData,
    /// Older than the soft threshold; a reconnect was requested.
    Lagging { age_secs: u64 },
    /// Older than the hard threshold.
    Stale { age_secs: u64 },
}

/// A snapshot together with the moment the worker received it.
#[derive(Debug)]
pub struct Published<S> {
    pub snapshot: Arc<S>,
    pub received_at: Instant,
}

impl<S> Clone for Published<S> {
    fn clone(&self) -> Self {
        Self {
            snapshot: Arc::clone(&self.snapshot),
            received_at: self.received_at,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    running: AtomicBool,
    reconnect: AtomicBool,
}

/// An entry on the command queue. A discard drops everything queued or
/// retried before it, and nothing queued after it.
#[derive(Debug)]
enum Queued<C> {
    Command(C),
    Discard,
}

/// Commands taken off the queue in one go.
#[derive(Debug)]
pub struct Pending<C> {
    /// Still wanted, oldest first.
    pub commands: Vec<C>,
    /// A discard was queued; earlier retries are dropped too.
    pub discard: bool,
    /// Commands dropped by that discard.
    pub dropped: usize,
}

/// The caller side of a worker.
pub struct WorkerHandle<S, C> {
    name: Arc<str>,
    config: WorkerConfig,
    commands: mpsc::UnboundedSender<Queued<C>>,
    snapshot: watch::Receiver<Option<Published<S>>>,
    state: watch::Receiver<WorkerState>,
    mode: Arc<watch::Sender<RunMode>>,
    shared: Arc<Shared>,
}

impl<S, C> Clone for WorkerHandle<S, C> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: self.config.clone(),
            commands: self.commands.clone(),
            snapshot: self.snapshot.clone(),
            state: self.state.clone(),
            mode: Arc::clone(&self.mode),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, C: fmt::Debug> WorkerHandle<S, C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a command for the worker's next tick. Never blocks.
    pub fn enqueue(&self, command: C) -> bool {
        match self.commands.send(Queued::Command(command)) {
            Ok(()) => true,
            Err(err) => {
                warn!(device = %self.name, command = ?err.0, "worker gone, command dropped");
                false
            }
        }
    }

    /// Drops every command queued or retried so far. Commands enqueued after
    /// this call still run.
    pub fn discard_pending(&self) {
        if self.commands.send(Queued::Discard).is_err() {
            debug!(device = %self.name, "worker gone, nothing to discard");
        }
    }

    pub fn snapshot(&self) -> Option<Arc<S>> {
        self.snapshot
            .borrow()
            .as_ref()
            .map(|published| Arc::clone(&published.snapshot))
    }

    pub fn snapshot_age(&self) -> Option<Duration> {
        self.snapshot
            .borrow()
            .as_ref()
            .map(|published| published.received_at.elapsed())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Published<S>>> {
        self.snapshot.clone()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Evaluated on every call; requests a reconnect once data goes stale.
    pub fn health(&self) -> Health {
        if !self.is_running() {
            return Health::NotRunning;
        }
        let Some(age) = self.snapshot_age() else {
            return Health::NoData;
        };

        let age_secs = age.as_secs();
        if age > self.config.stale_hard {
            warn!(device = %self.name, age_secs, "no data from device");
            self.request_reconnect();
            return Health::Stale { age_secs };
        }
        if age > self.config.stale_soft {
            warn!(device = %self.name, age_secs, "data lagging, reconnecting");
            self.request_reconnect();
            return Health::Lagging { age_secs };
        }
        Health::Healthy
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == Health::Healthy
    }

    pub fn request_reconnect(&self) {
        self.shared.reconnect.store(true, Ordering::Release);
    }

    /// Idempotent; the worker leaves its loop at the next tick boundary.
    pub fn stop(&self) {
        let changed = self.mode.send_if_modified(|mode| {
            let changed = *mode != RunMode::Stop;
            *mode = RunMode::Stop;
            changed
        });
        if changed {
            info!(device = %self.name, "worker stop requested");
        }
    }

    /// Closes the transport until [`resume`](Self::resume) is called.
    pub fn suspend(&self) {
        self.set_mode(RunMode::Suspend);
    }

    pub fn resume(&self) {
        self.set_mode(RunMode::Run);
    }

    fn set_mode(&self, next: RunMode) {
        self.mode.send_if_modified(|mode| {
            if *mode == RunMode::Stop || *mode == next {
                return false;
            }
            *mode = next;
            true
        });
    }
}

/// The worker side of the channels behind a [`WorkerHandle`].
pub struct WorkerEnds<S, C> {
    commands: mpsc::UnboundedReceiver<Queued<C>>,
    snapshot: watch::Sender<Option<Published<S>>>,
    state: watch::Sender<WorkerState>,
    mode: watch::Receiver<RunMode>,
    shared: Arc<Shared>,
    orphaned: bool,
}

impl<S, C> WorkerEnds<S, C> {
    pub fn publish(&self, snapshot: S) {
        self.snapshot.send_replace(Some(Published {
            snapshot: Arc::new(snapshot),
            received_at: Instant::now(),
        }));
    }

    pub fn set_running(&self, running: bool) {
        self.shared.running.store(running, Ordering::Release);
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    pub fn mode(&self) -> RunMode {
        if self.orphaned {
            return RunMode::Stop;
        }
        *self.mode.borrow()
    }

    pub fn take_reconnect_request(&self) -> bool {
        self.shared.reconnect.swap(false, Ordering::AcqRel)
    }

    /// Everything queued so far, with discards applied.
    pub fn take_pending(&mut self) -> Pending<C> {
        let mut pending = Pending {
            commands: Vec::new(),
            discard: false,
            dropped: 0,
        };
        while let Ok(queued) = self.commands.try_recv() {
            match queued {
                Queued::Command(command) => pending.commands.push(command),
                Queued::Discard => {
                    pending.discard = true;
                    pending.dropped += pending.commands.len();
                    pending.commands.clear();
                }
            }
        }
        pending
    }

    /// The commands still wanted, oldest first.
    pub fn drain_commands(&mut self) -> Vec<C> {
        self.take_pending().commands
    }

    /// Resolves when the run mode changes or every handle is gone.
    pub async fn mode_changed(&mut self) {
        if self.orphaned || self.mode.changed().await.is_err() {
            self.orphaned = true;
        }
    }
}

pub fn worker_channel<S, C>(
    name: impl Into<String>,
    config: WorkerConfig,
) -> (WorkerHandle<S, C>, WorkerEnds<S, C>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(None);
    let (state_tx, state_rx) = watch::channel(WorkerState::Disconnected);
    let (mode_tx, mode_rx) = watch::channel(RunMode::Run);
    let shared = Arc::new(Shared::default());
    let name: String = name.into();

    let handle = WorkerHandle {
        name: Arc::from(name),
        config,
        commands: commands_tx,
        snapshot: snapshot_rx,
        state: state_rx,
        mode: Arc::new(mode_tx),
        shared: Arc::clone(&shared),
    };
    let ends = WorkerEnds {
        commands: commands_rx,
        snapshot: snapshot_tx,
        state: state_tx,
        mode: mode_rx,
        shared,
        orphaned: false,
    };
    (handle, ends)
}

/// Starts `device` on its own task.
pub fn spawn<D: Device>(
    device: D,
    config: WorkerConfig,
    telemetry: Option<mpsc::Sender<TelemetryPoint>>,
) -> (WorkerHandle<D::Snapshot, D::Command>, JoinHandle<()>) {
    let (handle, ends) = worker_channel(device.name(), config.clone());
    let worker = DeviceWorker::new(device, ends, config, telemetry);
    let join = tokio::spawn(worker.run());
    (handle, join)
}

pub struct DeviceWorker<D: Device> {
    device: D,
    name: String,
    config: WorkerConfig,
    ends: WorkerEnds<D::Snapshot, D::Command>,
    retry: VecDeque<D::Command>,
    telemetry: Option<mpsc::Sender<TelemetryPoint>>,
    connected: bool,
}

impl<D: Device> DeviceWorker<D> {
    pub fn new(
        device: D,
        ends: WorkerEnds<D::Snapshot, D::Command>,
        config: WorkerConfig,
        telemetry: Option<mpsc::Sender<TelemetryPoint>>,
    ) -> Self {
        Self {
            name: device.name(),
            device,
            config,
            ends,
            retry: VecDeque::new(),
            telemetry,
            connected: false,
        }
    }

    pub async fn run(mut self) {
        info!(device = %self.name, "worker started");
        self.ends.set_running(true);

        loop {
            match self.ends.mode() {
                RunMode::Stop => break,
                RunMode::Suspend => {
                    self.suspend().await;
                    continue;
                }
                RunMode::Run => {}
            }

            if !self.connected {
                self.ends.set_state(WorkerState::Connecting);
                if !self.connect().await {
                    self.wait(self.config.connect_backoff).await;
                    continue;
                }
            }

            self.tick().await;
            self.wait(self.config.poll_interval).await;
        }

        self.device.disconnect().await;
        self.connected = false;
        self.ends.set_running(false);
        self.ends.set_state(WorkerState::Stopped);
        info!(device = %self.name, "worker stopped");
    }

    async fn tick(&mut self) {
        if self.ends.take_reconnect_request() {
            self.reconnect().await;
            if !self.connected {
                return;
            }
        }

        self.drain_commands().await;
        self.poll_once().await;
    }

    async fn drain_commands(&mut self) {
        let queued = self.ends.take_pending();
        if queued.discard {
            let dropped = self.retry.len() + queued.dropped;
            self.retry.clear();
            if dropped > 0 {
                warn!(device = %self.name, dropped, "discarded pending commands");
            }
        }
        let mut pending: Vec<D::Command> = self.retry.drain(..).collect();
        pending.extend(queued.commands);

        for command in pending {
            match self.device.execute(&command).await {
                Ok(()) => {
                    debug!(device = %self.name, ?command, "command executed");
                    metrics::counter!("worker_commands_executed_total", "device" => self.name.clone())
                        .increment(1);
                }
                Err(err) => {
                    warn!(device = %self.name, ?command, error = %err, "command failed, retrying next tick");
                    metrics::counter!("worker_commands_failed_total", "device" => self.name.clone())
                        .increment(1);
                    self.retry.push_back(command);
                }
            }
        }
    }

    async fn poll_once(&mut self) {
        match self.device.read().await {
            Ok(Some(snapshot)) => {
                self.forward_telemetry(&snapshot);
                self.ends.publish(snapshot);
                metrics::counter!("worker_polls_total", "device" => self.name.clone()).increment(1);
            }
            Ok(None) => {
                debug!(device = %self.name, "no data this tick");
            }
            Err(err) => {
                warn!(
                    device = %self.name,
                    transport = err.is_transport(),
                    error = %err,
                    "telemetry read failed"
                );
                metrics::counter!("worker_poll_failures_total", "device" => self.name.clone())
                    .increment(1);
            }
        }
    }

    fn forward_telemetry(&self, snapshot: &D::Snapshot) {
        let Some(sender) = &self.telemetry else {
            return;
        };
        for point in self.device.telemetry(snapshot) {
            if let Err(err) = sender.try_send(point) {
                debug!(device = %self.name, error = %err, "telemetry point dropped");
            }
        }
    }

    async fn connect(&mut self) -> bool {
        match self.device.connect().await {
            Ok(()) => {
                info!(device = %self.name, "device connected");
                self.connected = true;
                self.ends.set_state(WorkerState::Polling);
                true
            }
            Err(err) => {
                warn!(
                    device = %self.name,
                    error = %err,
                    retry_in_secs = self.config.connect_backoff.as_secs(),
                    "device connect failed"
                );
                metrics::counter!("worker_connect_failures_total", "device" => self.name.clone())
                    .increment(1);
                false
            }
        }
    }

    async fn reconnect(&mut self) {
        info!(device = %self.name, "reconnecting");
        metrics::counter!("worker_reconnects_total", "device" => self.name.clone()).increment(1);
        self.ends.set_state(WorkerState::Reconnecting);
        self.device.disconnect().await;
        self.connected = false;
        if self.connect().await {
            self.wait(self.config.reconnect_pause).await;
        }
    }

    async fn suspend(&mut self) {
        info!(device = %self.name, "worker suspended");
        self.device.disconnect().await;
        self.connected = false;
        self.ends.set_running(false);
        self.ends.set_state(WorkerState::Suspended);

        while self.ends.mode() == RunMode::Suspend {
            self.ends.mode_changed().await;
        }

        if self.ends.mode() == RunMode::Run {
            info!(device = %self.name, "worker resumed");
            self.ends.set_running(true);
        }
    }

    /// Sleeps for `duration` unless the run mode changes first.
    async fn wait(&mut self, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = self.ends.mode_changed() => {}
        }
    }
}
