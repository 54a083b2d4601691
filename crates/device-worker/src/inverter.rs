use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use inverter_codec::{
    decode_data, decode_device_parameters, decode_status, decode_yield, is_limit_accepted,
    is_supported_type, Request, POWER_LIMIT_SET,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};
use transport::FrameTransport;
use types::{
    DeviceParameters, InverterCommand, InverterRuntime, InverterSnapshot, InverterStatus,
    InverterYield, TelemetryPoint, LIMIT_FLOOR_WATT,
};

use crate::{Device, DeviceError};

#[derive(Debug, Clone)]
pub struct InverterDeviceConfig {
    pub inverter_id: u16,
    /// Largest increase of the limit a single energy request may apply.
    pub max_increase_watt: f64,
}

impl Default for InverterDeviceConfig {
    fn default() -> Self {
        Self {
            inverter_id: 10_000,
            max_increase_watt: 50.0,
        }
    }
}

/// Arguments of [`InverterCommand::RequestEnergy`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyRequest {
    pub watt_request: f64,
    pub watt_tolerance: f64,
    pub set_limit_interval: Duration,
    pub watt_max: f64,
}

/// Outcome of an energy request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitPlan {
    Apply(f64),
    /// The remembered limit is close enough to the target.
    InTolerance { last: f64 },
    /// The last change is younger than the set-limit interval.
    Waiting { since: Duration },
}

/// Turns an energy request into a limit decision.
///
/// The target covers the request on top of what the inverter already feeds
/// in. It is capped by the requested and rated maximum and may rise at most
/// `max_increase` above the remembered limit. A non-positive target becomes
/// the safety floor.
pub fn plan_limit(
    request: &EnergyRequest,
    ac_watts: f64,
    device_max: f64,
    max_increase: f64,
    last_limit: Option<f64>,
    since_last_change: Option<Duration>,
) -> LimitPlan {
    let mut ceiling = request.watt_max.min(device_max);
    if let Some(last) = last_limit {
        if ceiling - last > max_increase {
            debug!(last, ceiling, capped = last + max_increase, "limit increase capped");
            ceiling = last + max_increase;
        }
    }

    let mut target = (request.watt_request + ac_watts + request.watt_tolerance).min(ceiling);
    let mut force = false;
    if target <= 0.0 {
        target = LIMIT_FLOOR_WATT;
        force = last_limit != Some(LIMIT_FLOOR_WATT);
    }

    if let Some(last) = last_limit {
        if !force && (target - last).abs() <= request.watt_tolerance {
            return LimitPlan::InTolerance { last };
        }
    }

    if let Some(since) = since_last_change {
        if since < request.set_limit_interval {
            return LimitPlan::Waiting { since };
        }
    }

    LimitPlan::Apply(target)
}

/// The battery inverter on the serial line.
pub struct InverterDevice<T> {
    transport: T,
    config: InverterDeviceConfig,
    last_reading: Option<InverterSnapshot>,
    runtime: InverterRuntime,
    runtime_tx: watch::Sender<InverterRuntime>,
}

impl<T: FrameTransport> InverterDevice<T> {
    /// Returns the device and a read-only view of its limit bookkeeping.
    pub fn new(
        transport: T,
        config: InverterDeviceConfig,
    ) -> (Self, watch::Receiver<InverterRuntime>) {
        let (runtime_tx, runtime_rx) = watch::channel(InverterRuntime::default());
        let device = Self {
            transport,
            config,
            last_reading: None,
            runtime: InverterRuntime::default(),
            runtime_tx,
        };
        (device, runtime_rx)
    }

    pub fn parameters(&self) -> Option<&DeviceParameters> {
        self.runtime.parameters.as_ref()
    }

    pub fn runtime(&self) -> &InverterRuntime {
        &self.runtime
    }

    async fn request(&mut self, request: Request) -> Result<Vec<u8>, DeviceError> {
        let frame = request.encode(self.config.inverter_id)?;
        let response = self
            .transport
            .exchange(&frame, request.min_response_len())
            .await?;
        Ok(response)
    }

    fn max_watt(&self) -> Result<f64, DeviceError> {
        self.runtime.max_watt().ok_or(DeviceError::NotConnected)
    }

    fn publish_runtime(&self) {
        self.runtime_tx.send_replace(self.runtime.clone());
    }

    pub async fn read_status(&mut self) -> Result<InverterStatus, DeviceError> {
        let response = self.request(Request::Status).await?;
        Ok(decode_status(&response)?)
    }

    pub async fn read_yield(&mut self) -> Result<InverterYield, DeviceError> {
        let response = self.request(Request::Yield).await?;
        Ok(decode_yield(&response)?)
    }

    pub async fn set_limit(&mut self, watt: f64) -> Result<f64, DeviceError> {
        let max_watt = self.max_watt()?;
        if watt > max_watt {
            return Err(DeviceError::Rejected(format!(
                "limit {watt:.0}W above device maximum {max_watt:.0}W"
            )));
        }

        let response = self.request(Request::SetLimit { watt }).await?;
        if !is_limit_accepted(&response) {
            return Err(DeviceError::Rejected(format!(
                "unexpected limit response {response:02x?}"
            )));
        }

        let status = self.read_status().await?;
        if !status.states.contains(POWER_LIMIT_SET) {
            return Err(DeviceError::Rejected(format!(
                "{POWER_LIMIT_SET} missing from states {:?}",
                status.states
            )));
        }

        info!(inverter_id = self.config.inverter_id, watt, "power limit set");
        self.runtime.last_limit_watt = Some(watt);
        self.runtime.last_limit_change = Some(Instant::now());
        self.publish_runtime();
        Ok(watt)
    }

    pub async fn request_energy(&mut self, request: &EnergyRequest) -> Result<(), DeviceError> {
        let ac_watts = self
            .last_reading
            .as_ref()
            .map(|reading| reading.ac_watts)
            .ok_or(DeviceError::NoTelemetry)?;
        let device_max = self.max_watt()?;

        let plan = plan_limit(
            request,
            ac_watts,
            device_max,
            self.config.max_increase_watt,
            self.runtime.last_limit_watt,
            self.runtime.since_last_limit_change(),
        );
        match plan {
            LimitPlan::Apply(watt) => {
                if self.runtime.last_limit_watt.is_none() {
                    debug!(inverter_id = self.config.inverter_id, "no remembered limit");
                }
                self.set_limit(watt).await?;
            }
            LimitPlan::InTolerance { last } => {
                debug!(inverter_id = self.config.inverter_id, last, "limit within tolerance");
            }
            LimitPlan::Waiting { since } => {
                debug!(
                    inverter_id = self.config.inverter_id,
                    since_secs = since.as_secs(),
                    "limit changed recently, waiting"
                );
            }
        }
        Ok(())
    }

    fn clear_limit(&mut self) {
        if self.runtime.last_limit_watt.take().is_some() {
            info!(inverter_id = self.config.inverter_id, "remembered limit cleared");
            self.publish_runtime();
        }
    }
}

#[async_trait]
impl<T: FrameTransport + 'static> Device for InverterDevice<T> {
    type Snapshot = InverterSnapshot;
    type Command = InverterCommand;

    fn name(&self) -> String {
        format!("inverter-{}", self.config.inverter_id)
    }

    async fn connect(&mut self) -> Result<(), DeviceError> {
        self.transport.close().await;
        self.transport.open().await?;

        let response = self.request(Request::Parameters).await?;
        let parameters = decode_device_parameters(&response)?;
        if !is_supported_type(&parameters.device_type) {
            self.transport.close().await;
            return Err(DeviceError::Unsupported(parameters.device_type));
        }

        info!(
            inverter_id = self.config.inverter_id,
            device_type = %parameters.device_type,
            firmware = %parameters.firmware_version,
            max_watt = parameters.max_watt,
            "inverter identified"
        );
        self.runtime.parameters = Some(parameters);
        self.publish_runtime();
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.transport.close().await;
    }

    async fn execute(&mut self, command: &InverterCommand) -> Result<(), DeviceError> {
        match command {
            InverterCommand::SetLimit { watt } => self.set_limit(*watt).await.map(|_| ()),
            InverterCommand::RequestEnergy {
                watt_request,
                watt_tolerance,
                set_limit_interval,
                watt_max,
            } => {
                let request = EnergyRequest {
                    watt_request: *watt_request,
                    watt_tolerance: *watt_tolerance,
                    set_limit_interval: *set_limit_interval,
                    watt_max: *watt_max,
                };
                self.request_energy(&request).await
            }
            InverterCommand::ClearLimit => {
                self.clear_limit();
                Ok(())
            }
        }
    }

    async fn read(&mut self) -> Result<Option<InverterSnapshot>, DeviceError> {
        let max_watt = self.max_watt()?;
        let response = self.request(Request::Data).await?;
        let snapshot = decode_data(&response, max_watt, Utc::now())?;
        self.last_reading = Some(snapshot.clone());
        Ok(Some(snapshot))
    }

    fn telemetry(&self, snapshot: &InverterSnapshot) -> Vec<TelemetryPoint> {
        vec![TelemetryPoint::new("InverterData", snapshot.timestamp)
            .tag("inverter_id", self.config.inverter_id.to_string())
            .tag("dev", self.transport.endpoint())
            .field("pv_amps", snapshot.pv_amps)
            .field("pv_volts", snapshot.pv_volts)
            .field("ac_watts", snapshot.ac_watts)
            .field("pv_watts", snapshot.pv_watts)
            .field("temperature", snapshot.temperature_c)]
    }
}
