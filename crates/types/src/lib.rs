use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Lowest power limit the inverter is allowed to run at. A limit at this
/// value means the battery side can no longer deliver and the inverter must be
/// switched off instead.
pub const LIMIT_FLOOR_WATT: f64 = 10.0;

/// Static identification read once from the inverter at connect time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceParameters {
    pub device_type: String,
    pub max_watt: f64,
    pub firmware_version: String,
}

/// One decoded inverter data frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterSnapshot {
    pub pv_amps: f64,
    pub pv_volts: f64,
    pub ac_watts: f64,
    pub pv_watts: f64,
    pub temperature_c: f64,
    pub timestamp: DateTime<Utc>,
}

impl InverterSnapshot {
    /// The inverter is feeding power into the grid.
    pub fn is_active(&self) -> bool {
        self.ac_watts > 0.0
    }
}

/// Decoded state/error/disturbance bitfields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InverterStatus {
    pub states: BTreeSet<&'static str>,
    pub errors: BTreeSet<&'static str>,
    pub disturbances: BTreeSet<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterYield {
    pub watt: f64,
    pub watt_hours: f64,
}

/// Energy counters in kWh, present only when counter decoding was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyCounters {
    pub active_import_kwh: f64,
    pub active_export_kwh: f64,
    pub reactive_import_kvarh: f64,
    pub reactive_export_kvarh: f64,
    pub apparent_import_kvah: f64,
    pub apparent_export_kvah: f64,
}

/// Power figures of the sum block or of a single phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerBlock {
    pub active_import_w: f64,
    pub active_export_w: f64,
    pub reactive_import_var: f64,
    pub reactive_export_var: f64,
    pub apparent_import_va: f64,
    pub apparent_export_va: f64,
    pub power_factor: f64,
    /// Phase blocks only.
    pub thd: Option<f64>,
    /// Phase blocks only.
    pub voltage: Option<f64>,
    pub counters: Option<EnergyCounters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterSnapshot {
    pub serial_number: u32,
    pub total: PowerBlock,
    pub phases: Option<[PowerBlock; 3]>,
    pub timestamp: DateTime<Utc>,
}

impl MeterSnapshot {
    pub fn import_w(&self) -> f64 {
        self.total.active_import_w
    }

    pub fn export_w(&self) -> f64 {
        self.total.active_export_w
    }

    /// Positive when power is pushed into the grid.
    pub fn balance_w(&self) -> f64 {
        self.export_w() - self.import_w()
    }

    /// Import and export are both within `tolerance` of zero.
    pub fn is_balanced(&self, tolerance: f64) -> bool {
        self.import_w() + self.export_w() < tolerance
    }
}

/// Commands understood by the inverter worker.
#[derive(Debug, Clone, PartialEq)]
pub enum InverterCommand {
    SetLimit {
        watt: f64,
    },
    RequestEnergy {
        watt_request: f64,
        watt_tolerance: f64,
        set_limit_interval: Duration,
        watt_max: f64,
    },
    /// Forget the remembered limit so the next adjustment starts fresh.
    ClearLimit,
}

/// The meter is receive-only.
#[derive(Debug, Clone, PartialEq)]
pub enum MeterCommand {}

/// Limit bookkeeping owned by the inverter worker and published read-only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InverterRuntime {
    pub parameters: Option<DeviceParameters>,
    pub last_limit_watt: Option<f64>,
    pub last_limit_change: Option<Instant>,
}

impl InverterRuntime {
    pub fn max_watt(&self) -> Option<f64> {
        self.parameters.as_ref().map(|params| params.max_watt)
    }

    pub fn since_last_limit_change(&self) -> Option<Duration> {
        self.last_limit_change.map(|at| at.elapsed())
    }
}

/// A measurement handed to the telemetry sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub time: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
}

impl TelemetryPoint {
    pub fn new(measurement: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            time,
            fields: BTreeMap::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}
