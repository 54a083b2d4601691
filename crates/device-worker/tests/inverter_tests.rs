use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use device_worker::{
    plan_limit, spawn, Device, DeviceError, EnergyRequest, InverterDevice, InverterDeviceConfig,
    LimitPlan, WorkerConfig,
};
use inverter_codec::{encode_value, LIMIT_ACCEPTED};
use tokio::time::sleep;
use transport::{FrameTransport, TransportError};
use types::InverterCommand;

const POWER_LIMIT_SET_BIT: u8 = 0x08;

fn register(value: f64) -> [u8; 4] {
    encode_value(value).expect("encodable").to_be_bytes()
}

/// Answers every request the way a healthy inverter would.
#[derive(Clone)]
struct MockInverter {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    device_type: [u8; 6],
    max_watt: f64,
    ac_watts: f64,
    pv_volts: f64,
    status_states: u8,
}

impl Default for MockInverter {
    fn default() -> Self {
        Self {
            sent: Arc::default(),
            device_type: *b"500-90",
            max_watt: 500.0,
            ac_watts: 100.0,
            pv_volts: 52.0,
            status_states: POWER_LIMIT_SET_BIT,
        }
    }
}

impl MockInverter {
    fn opcodes(&self) -> Vec<[u8; 2]> {
        self.sent
            .lock()
            .expect("sent")
            .iter()
            .map(|frame| [frame[3], frame[4]])
            .collect()
    }

    fn set_limit_frames(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .expect("sent")
            .iter()
            .filter(|frame| frame[3..5] == [0x03, 0xFE])
            .cloned()
            .collect()
    }

    fn data_response(&self) -> Vec<u8> {
        let mut bytes = vec![0x21, 0x27, 0x10];
        let values = [0.0, 0.0, 2.0, self.pv_volts, self.ac_watts, 110.0, 31.5, 0.0];
        for value in values {
            bytes.extend_from_slice(&register(value));
        }
        bytes.push(0x00);
        bytes
    }

    fn parameters_response(&self) -> Vec<u8> {
        let mut bytes = vec![0x21, 0x27, 0x10, 0x00, 0x00, 0x00, 0x00];
        bytes.extend_from_slice(&self.device_type);
        bytes.extend(std::iter::repeat(0x00).take(38));
        bytes.extend_from_slice(b"FW 2.11\0\0\0\0\0\0\0\0\0");
        bytes.extend_from_slice(&register(self.max_watt));
        bytes
    }
}

#[async_trait]
impl FrameTransport for MockInverter {
    async fn open(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn exchange(
        &mut self,
        request: &[u8],
        _min_response_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        self.sent.lock().expect("sent").push(request.to_vec());
        let response = match [request[3], request[4]] {
            [0x03, 0xED] => self.data_response(),
            [0x03, 0xF6] => self.parameters_response(),
            [0x03, 0xF0] => vec![0x21, 0x27, 0x13, 0x00, 0x00, 0x00, self.status_states, 0x00],
            [0x03, 0xFD] => {
                let mut bytes = vec![0x21, 0x27, 0x10];
                bytes.extend_from_slice(&register(120.0));
                bytes.extend_from_slice(&register(1_500.0));
                bytes.push(0x00);
                bytes
            }
            [0x03, 0xFE] => LIMIT_ACCEPTED[..4].to_vec(),
            _ => return Err(TransportError::Incomplete),
        };
        Ok(response)
    }

    async fn close(&mut self) {}

    fn endpoint(&self) -> String {
        "/dev/ttyMOCK".to_string()
    }
}

fn energy_request(watt_request: f64, watt_max: f64) -> EnergyRequest {
    EnergyRequest {
        watt_request,
        watt_tolerance: 20.0,
        set_limit_interval: Duration::from_secs(120),
        watt_max,
    }
}

#[test]
fn increase_is_capped_above_last_limit() {
    let plan = plan_limit(&energy_request(300.0, 400.0), 100.0, 500.0, 50.0, Some(200.0), None);
    assert_eq!(plan, LimitPlan::Apply(250.0));
}

#[test]
fn first_request_uses_requested_maximum() {
    let plan = plan_limit(&energy_request(300.0, 400.0), 100.0, 500.0, 50.0, None, None);
    assert_eq!(plan, LimitPlan::Apply(400.0));

    let plan = plan_limit(&energy_request(300.0, 900.0), 100.0, 500.0, 50.0, None, None);
    assert_eq!(plan, LimitPlan::Apply(420.0));
}

#[test]
fn negative_target_is_clamped_to_floor() {
    let request = energy_request(-500.0, 400.0);

    let plan = plan_limit(&request, 100.0, 500.0, 50.0, Some(150.0), None);
    assert_eq!(plan, LimitPlan::Apply(10.0));

    let plan = plan_limit(&request, 100.0, 500.0, 50.0, Some(10.0), None);
    assert_eq!(plan, LimitPlan::InTolerance { last: 10.0 });
}

#[test]
fn small_positive_target_is_kept() {
    let plan = plan_limit(&energy_request(-115.0, 400.0), 100.0, 500.0, 50.0, Some(100.0), None);
    assert_eq!(plan, LimitPlan::Apply(5.0));
}

#[test]
fn floor_is_forced_even_within_tolerance() {
    let plan = plan_limit(&energy_request(-500.0, 400.0), 100.0, 500.0, 50.0, Some(25.0), None);
    assert_eq!(plan, LimitPlan::Apply(10.0));
}

#[test]
fn target_near_last_limit_is_skipped() {
    let plan = plan_limit(&energy_request(130.0, 400.0), 100.0, 500.0, 50.0, Some(240.0), None);
    assert_eq!(plan, LimitPlan::InTolerance { last: 240.0 });
}

#[test]
fn recent_change_defers_new_limit() {
    let plan = plan_limit(
        &energy_request(0.0, 400.0),
        100.0,
        500.0,
        50.0,
        Some(300.0),
        Some(Duration::from_secs(10)),
    );
    assert_eq!(
        plan,
        LimitPlan::Waiting {
            since: Duration::from_secs(10)
        }
    );
}

#[tokio::test]
async fn unsupported_device_type_fails_connect() {
    let mock = MockInverter {
        device_type: *b"999-99",
        ..MockInverter::default()
    };
    let (mut device, runtime) = InverterDevice::new(mock, InverterDeviceConfig::default());

    let err = device.connect().await.expect_err("unsupported");
    assert!(matches!(err, DeviceError::Unsupported(ref kind) if kind == "999-99"));
    assert!(runtime.borrow().parameters.is_none());
}

#[tokio::test]
async fn limit_above_device_maximum_is_never_sent() {
    let mock = MockInverter::default();
    let (mut device, _runtime) = InverterDevice::new(mock.clone(), InverterDeviceConfig::default());
    device.connect().await.expect("connect");

    let err = device.set_limit(600.0).await.expect_err("over max");
    assert!(matches!(err, DeviceError::Rejected(_)));
    assert!(!err.is_transport());
    assert!(mock.set_limit_frames().is_empty());
}

#[tokio::test]
async fn limit_counts_only_when_status_confirms_it() {
    let mock = MockInverter {
        status_states: 0x01,
        ..MockInverter::default()
    };
    let (mut device, runtime) = InverterDevice::new(mock.clone(), InverterDeviceConfig::default());
    device.connect().await.expect("connect");

    assert!(device.set_limit(200.0).await.is_err());
    assert_eq!(runtime.borrow().last_limit_watt, None);
    assert_eq!(mock.opcodes(), vec![[0x03, 0xF6], [0x03, 0xFE], [0x03, 0xF0]]);
}

#[tokio::test]
async fn accepted_limit_is_remembered_and_cleared_by_command() {
    let mock = MockInverter::default();
    let (mut device, runtime) = InverterDevice::new(mock.clone(), InverterDeviceConfig::default());
    device.connect().await.expect("connect");

    device
        .execute(&InverterCommand::SetLimit { watt: 200.0 })
        .await
        .expect("set limit");
    assert_eq!(runtime.borrow().last_limit_watt, Some(200.0));
    assert!(runtime.borrow().last_limit_change.is_some());
    assert_eq!(
        mock.set_limit_frames()[0][3..9],
        [0x03, 0xFE, 0x00, 0xC8, 0x00, 0x00]
    );

    device
        .execute(&InverterCommand::ClearLimit)
        .await
        .expect("clear");
    assert_eq!(runtime.borrow().last_limit_watt, None);
    assert!(runtime.borrow().last_limit_change.is_some());
}

#[tokio::test]
async fn energy_request_needs_a_reading() {
    let (mut device, _runtime) =
        InverterDevice::new(MockInverter::default(), InverterDeviceConfig::default());
    device.connect().await.expect("connect");

    let err = device
        .request_energy(&energy_request(50.0, 400.0))
        .await
        .expect_err("no reading");
    assert!(matches!(err, DeviceError::NoTelemetry));
}

#[tokio::test]
async fn diagnostics_read_status_and_yield() {
    let (mut device, _runtime) =
        InverterDevice::new(MockInverter::default(), InverterDeviceConfig::default());
    device.connect().await.expect("connect");

    let status = device.read_status().await.expect("status");
    assert!(status.states.contains("POWER_LIMIT_SET"));
    let yield_ = device.read_yield().await.expect("yield");
    assert_eq!(yield_.watt, 120.0);
    assert_eq!(yield_.watt_hours, 1_500.0);
}

#[tokio::test]
async fn reading_produces_inverter_telemetry() {
    let (mut device, _runtime) =
        InverterDevice::new(MockInverter::default(), InverterDeviceConfig::default());
    device.connect().await.expect("connect");

    let snapshot = device.read().await.expect("read").expect("snapshot");
    assert_eq!(snapshot.ac_watts, 100.0);
    assert_eq!(snapshot.pv_volts, 52.0);

    let points = device.telemetry(&snapshot);
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].measurement, "InverterData");
    assert_eq!(points[0].tags["inverter_id"], "10000");
    assert_eq!(points[0].tags["dev"], "/dev/ttyMOCK");
    assert_eq!(points[0].fields["ac_watts"], 100.0);
}

#[tokio::test(start_paused = true)]
async fn requests_ten_seconds_apart_set_the_limit_once() {
    let mock = MockInverter::default();
    let (device, runtime) = InverterDevice::new(mock.clone(), InverterDeviceConfig::default());
    let (handle, _join) = spawn(device, WorkerConfig::default(), None);
    sleep(Duration::from_millis(1)).await;
    assert!(handle.snapshot().is_some());

    let request = |watt_request| InverterCommand::RequestEnergy {
        watt_request,
        watt_tolerance: 20.0,
        set_limit_interval: Duration::from_secs(120),
        watt_max: 400.0,
    };

    handle.enqueue(request(50.0));
    sleep(Duration::from_secs(10)).await;
    assert_eq!(runtime.borrow().last_limit_watt, Some(170.0));

    handle.enqueue(request(200.0));
    sleep(Duration::from_secs(10)).await;

    assert_eq!(mock.set_limit_frames().len(), 1);
    assert_eq!(runtime.borrow().last_limit_watt, Some(170.0));
    handle.stop();
}
