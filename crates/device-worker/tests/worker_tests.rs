use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use device_worker::{spawn, worker_channel, Device, DeviceError, Health, WorkerConfig, WorkerState};
use tokio::sync::mpsc;
use tokio::time::{advance, sleep};
use types::TelemetryPoint;

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("log").push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().expect("log").clone()
    }
}

struct FakeDevice {
    log: Log,
    /// Commands that fail the first time they are executed.
    fail_once: HashSet<u32>,
    reading: u32,
}

impl FakeDevice {
    fn new(log: Log) -> Self {
        Self {
            log,
            fail_once: HashSet::new(),
            reading: 0,
        }
    }
}

#[async_trait]
impl Device for FakeDevice {
    type Snapshot = u32;
    type Command = u32;

    fn name(&self) -> String {
        "fake".to_string()
    }

    async fn connect(&mut self) -> Result<(), DeviceError> {
        self.log.push("connect");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.log.push("disconnect");
    }

    async fn execute(&mut self, command: &u32) -> Result<(), DeviceError> {
        if self.fail_once.remove(command) {
            self.log.push(format!("fail {command}"));
            return Err(DeviceError::Rejected("busy".to_string()));
        }
        self.log.push(format!("exec {command}"));
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<u32>, DeviceError> {
        self.reading += 1;
        self.log.push("read");
        Ok(Some(self.reading))
    }

    fn telemetry(&self, snapshot: &u32) -> Vec<TelemetryPoint> {
        vec![TelemetryPoint::new("Fake", Utc::now()).field("reading", f64::from(*snapshot))]
    }
}

#[tokio::test(start_paused = true)]
async fn queued_commands_run_before_the_read() {
    let log = Log::default();
    let (handle, _join) = spawn(FakeDevice::new(log.clone()), WorkerConfig::default(), None);
    assert!(handle.enqueue(1));
    assert!(handle.enqueue(2));

    sleep(Duration::from_millis(1)).await;

    assert_eq!(log.entries(), vec!["connect", "exec 1", "exec 2", "read"]);
    assert_eq!(handle.snapshot().as_deref(), Some(&1));
    assert_eq!(handle.state(), WorkerState::Polling);
}

#[tokio::test(start_paused = true)]
async fn failed_command_is_retried_next_tick() {
    let log = Log::default();
    let mut device = FakeDevice::new(log.clone());
    device.fail_once.insert(7);
    let (handle, _join) = spawn(device, WorkerConfig::default(), None);
    handle.enqueue(7);

    sleep(Duration::from_millis(1)).await;
    assert_eq!(log.entries(), vec!["connect", "fail 7", "read"]);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(
        log.entries(),
        vec!["connect", "fail 7", "read", "exec 7", "read"]
    );
}

#[tokio::test(start_paused = true)]
async fn discarded_commands_are_not_retried() {
    let log = Log::default();
    let mut device = FakeDevice::new(log.clone());
    device.fail_once.insert(3);
    let (handle, _join) = spawn(device, WorkerConfig::default(), None);
    handle.enqueue(3);

    sleep(Duration::from_millis(1)).await;
    handle.discard_pending();
    sleep(Duration::from_secs(10)).await;

    assert_eq!(log.entries(), vec!["connect", "fail 3", "read", "read"]);
}

#[tokio::test(start_paused = true)]
async fn commands_after_a_discard_still_run() {
    let log = Log::default();
    let mut device = FakeDevice::new(log.clone());
    device.fail_once.insert(3);
    let (handle, _join) = spawn(device, WorkerConfig::default(), None);
    handle.enqueue(3);

    sleep(Duration::from_millis(1)).await;
    handle.enqueue(4);
    handle.discard_pending();
    handle.enqueue(5);
    sleep(Duration::from_secs(10)).await;

    assert_eq!(
        log.entries(),
        vec!["connect", "fail 3", "read", "exec 5", "read"]
    );
}

#[test]
fn discard_drops_only_earlier_commands() {
    let (handle, mut ends) = worker_channel::<u32, u32>("inverter", WorkerConfig::default());
    handle.enqueue(1);
    handle.enqueue(2);
    handle.discard_pending();
    handle.enqueue(3);

    let pending = ends.take_pending();
    assert!(pending.discard);
    assert_eq!(pending.dropped, 2);
    assert_eq!(pending.commands, vec![3]);
    assert!(ends.drain_commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn health_follows_snapshot_age() {
    let (handle, ends) = worker_channel::<u32, u32>("meter", WorkerConfig::default());
    assert_eq!(handle.health(), Health::NotRunning);

    ends.set_running(true);
    assert_eq!(handle.health(), Health::NoData);

    ends.publish(42);
    advance(Duration::from_secs(10)).await;
    assert!(handle.is_healthy());
    assert!(!ends.take_reconnect_request());

    advance(Duration::from_secs(60)).await;
    assert_eq!(handle.health(), Health::Lagging { age_secs: 70 });
    assert!(ends.take_reconnect_request());

    advance(Duration::from_secs(60)).await;
    assert!(!handle.is_healthy());
    assert_eq!(handle.health(), Health::Stale { age_secs: 130 });

    ends.publish(43);
    assert!(handle.is_healthy());
}

#[tokio::test(start_paused = true)]
async fn reconnect_request_reopens_the_device() {
    let log = Log::default();
    let (handle, _join) = spawn(FakeDevice::new(log.clone()), WorkerConfig::default(), None);
    sleep(Duration::from_millis(1)).await;

    handle.request_reconnect();
    sleep(Duration::from_secs(13)).await;

    assert_eq!(
        log.entries(),
        vec!["connect", "read", "disconnect", "connect", "read"]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_final() {
    let log = Log::default();
    let (handle, join) = spawn(FakeDevice::new(log.clone()), WorkerConfig::default(), None);
    sleep(Duration::from_millis(1)).await;

    handle.stop();
    handle.stop();
    join.await.expect("worker task");

    assert_eq!(handle.state(), WorkerState::Stopped);
    assert!(!handle.is_running());
    assert_eq!(log.entries().last().map(String::as_str), Some("disconnect"));

    handle.resume();
    assert!(!handle.enqueue(1));
}

#[tokio::test(start_paused = true)]
async fn suspend_closes_and_resume_reconnects() {
    let log = Log::default();
    let (handle, _join) = spawn(FakeDevice::new(log.clone()), WorkerConfig::default(), None);
    sleep(Duration::from_millis(1)).await;

    handle.suspend();
    sleep(Duration::from_millis(1)).await;
    assert_eq!(handle.state(), WorkerState::Suspended);
    assert!(!handle.is_running());
    assert_eq!(handle.health(), Health::NotRunning);

    sleep(Duration::from_secs(3_600)).await;
    assert_eq!(log.entries(), vec!["connect", "read", "disconnect"]);

    handle.resume();
    sleep(Duration::from_millis(1)).await;
    assert!(handle.is_running());
    assert_eq!(
        log.entries(),
        vec!["connect", "read", "disconnect", "connect", "read"]
    );
}

#[tokio::test(start_paused = true)]
async fn readings_are_forwarded_as_telemetry() {
    let (tx, mut rx) = mpsc::channel(8);
    let (_handle, _join) = spawn(
        FakeDevice::new(Log::default()),
        WorkerConfig::default(),
        Some(tx),
    );

    let point = rx.recv().await.expect("point");
    assert_eq!(point.measurement, "Fake");
    assert_eq!(point.fields.get("reading"), Some(&1.0));
}
