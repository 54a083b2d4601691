use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use device_worker::{spawn, Device, MeterDevice, MeterDeviceConfig, WorkerConfig};
use meter_codec::DecodeOptions;
use tokio::time::sleep;
use transport::{DatagramSource, TransportError};

const SERIAL: u32 = 1_900_123_456;
const OTHER_SERIAL: u32 = 42;

/// Datagrams queued like a kernel socket buffer. `recv` waits up to two
/// seconds when empty.
#[derive(Clone, Default)]
struct QueuedSource {
    datagrams: Arc<Mutex<VecDeque<Vec<u8>>>>,
    open: bool,
}

impl QueuedSource {
    fn with(datagrams: Vec<Vec<u8>>) -> Self {
        let source = Self::default();
        for datagram in datagrams {
            source.push(datagram);
        }
        source
    }

    fn push(&self, datagram: Vec<u8>) {
        self.datagrams.lock().expect("queue").push_back(datagram);
    }

    fn queued(&self) -> usize {
        self.datagrams.lock().expect("queue").len()
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.datagrams.lock().expect("queue").pop_front()
    }
}

#[async_trait]
impl DatagramSource for QueuedSource {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.open = true;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        for _ in 0..20 {
            if !self.open {
                return Err(TransportError::NotOpen);
            }
            if let Some(datagram) = self.pop() {
                return Ok(datagram);
            }
            sleep(Duration::from_millis(100)).await;
        }
        Err(TransportError::Timeout { timeout_ms: 2_000 })
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        Ok(self.pop())
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

/// A 600 byte datagram from `serial` importing `import_w`.
fn datagram(serial: u32, import_w: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 600];
    buf[..4].copy_from_slice(b"SMA\0");
    buf[20..24].copy_from_slice(&serial.to_be_bytes());
    buf[32..36].copy_from_slice(&(import_w * 10).to_be_bytes());
    buf[52..56].copy_from_slice(&6_000u32.to_be_bytes());
    buf
}

fn meter(serial_number: Option<u32>, source: QueuedSource) -> MeterDevice<QueuedSource> {
    MeterDevice::new(
        source,
        MeterDeviceConfig {
            serial_number,
            options: DecodeOptions::default(),
        },
    )
}

#[tokio::test]
async fn matching_serial_is_decoded() {
    let mut device = meter(Some(SERIAL), QueuedSource::with(vec![datagram(SERIAL, 0)]));
    device.connect().await.expect("connect");

    let snapshot = device.read().await.expect("read").expect("snapshot");
    assert_eq!(snapshot.serial_number, SERIAL);
    assert_eq!(snapshot.export_w(), 600.0);
}

#[tokio::test]
async fn datagrams_from_other_meters_are_ignored() {
    let mut device = meter(
        Some(SERIAL),
        QueuedSource::with(vec![datagram(OTHER_SERIAL, 0)]),
    );
    device.connect().await.expect("connect");

    assert!(device.read().await.expect("read").is_none());
}

#[tokio::test]
async fn any_meter_is_accepted_without_filter() {
    let mut device = meter(None, QueuedSource::with(vec![datagram(OTHER_SERIAL, 0)]));
    device.connect().await.expect("connect");

    let snapshot = device.read().await.expect("read").expect("snapshot");
    assert_eq!(snapshot.serial_number, OTHER_SERIAL);
    assert_eq!(device.name(), "meter");
}

#[tokio::test]
async fn short_datagram_is_no_data() {
    let short = datagram(SERIAL, 0)[..300].to_vec();
    let mut device = meter(Some(SERIAL), QueuedSource::with(vec![short]));
    device.connect().await.expect("connect");

    assert!(device.read().await.expect("read").is_none());
    assert_eq!(device.name(), format!("meter-{SERIAL}"));
}

#[tokio::test]
async fn closed_source_reports_transport_error() {
    let mut device = meter(None, QueuedSource::with(vec![datagram(SERIAL, 0)]));

    let err = device.read().await.expect_err("not connected");
    assert!(err.is_transport());
}

#[tokio::test]
async fn backlog_is_drained_to_newest_reading() {
    let source = QueuedSource::with(vec![
        datagram(SERIAL, 100),
        datagram(OTHER_SERIAL, 900),
        datagram(SERIAL, 250),
        datagram(SERIAL, 0)[..300].to_vec(),
        datagram(OTHER_SERIAL, 700),
    ]);
    let mut device = meter(Some(SERIAL), source.clone());
    device.connect().await.expect("connect");

    let snapshot = device.read().await.expect("read").expect("snapshot");
    assert_eq!(snapshot.import_w(), 250.0);
    assert_eq!(source.queued(), 0);
}

#[tokio::test(start_paused = true)]
async fn worker_keeps_up_with_two_meters_on_the_group() {
    let source = QueuedSource::default();
    let config = WorkerConfig {
        poll_interval: Duration::from_secs(1),
        ..WorkerConfig::default()
    };
    let (handle, join) = spawn(meter(Some(SERIAL), source.clone()), config, None);

    for import_w in 1..=600 {
        source.push(datagram(SERIAL, import_w));
        source.push(datagram(OTHER_SERIAL, 5_000));
        sleep(Duration::from_secs(1)).await;
    }
    sleep(Duration::from_millis(1_500)).await;

    let snapshot = handle.snapshot().expect("snapshot");
    assert_eq!(snapshot.import_w(), 600.0);
    assert!(handle.is_healthy());
    assert_eq!(source.queued(), 0);

    handle.stop();
    join.await.expect("worker");
}
