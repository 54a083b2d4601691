//! Grid balancing for the battery inverter and the switched load.
//!
//! Once per tick the loop reads the meter and inverter snapshots, switches the
//! load on surplus, protects the battery, and decides whether the inverter
//! relay should be on and which limit it should be asked for. It never talks
//! to a transport; commands go through the inverter worker's queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use device_worker::WorkerHandle;
use types::{
    InverterCommand, InverterRuntime, InverterSnapshot, MeterCommand, MeterSnapshot,
    TelemetryPoint, LIMIT_FLOOR_WATT,
};

use crate::actuators::{ActuatorError, Relay, SwitchedLoad};
use crate::clock::{local_hour, next_local_hour, Clock, SystemClock};
use crate::config::{BalancerConfig, BatteryConfig, ControlConfig};
use crate::liveness::{sleep_with_pulses, Liveness, NoLiveness};
use crate::throttler::Throttler;

pub type MeterHandle = WorkerHandle<MeterSnapshot, MeterCommand>;
pub type InverterHandle = WorkerHandle<InverterSnapshot, InverterCommand>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailSafe {
    MeterUnhealthy,
    InverterUnhealthy,
    /// Stepping the limit down would go below the safety floor.
    BatteryLow,
}

impl FailSafe {
    fn label(self) -> &'static str {
        match self {
            FailSafe::MeterUnhealthy => "meter_unhealthy",
            FailSafe::InverterUnhealthy => "inverter_unhealthy",
            FailSafe::BatteryLow => "battery_low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InverterAction {
    /// Battery voltage below minimum; a lower limit was queued.
    StepDown { watt: f64 },
    OffExcessExport,
    OffAtFloor,
    Running { energy_requested: bool },
    Activated,
    ActivationPending,
    ChargingWindow,
    LoadRunning,
    Idle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub balance_w: f64,
    pub battery_level: f64,
    pub max_discharge_w: f64,
    pub available_power_w: f64,
    pub load_on: bool,
    pub load_draw_w: f64,
    pub action: InverterAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    FailSafe(FailSafe),
    Sleep { until: DateTime<Utc> },
    Completed(TickReport),
}

pub struct ControlLoop {
    control: ControlConfig,
    battery: BatteryConfig,
    limit_step_watt: f64,
    meter: MeterHandle,
    inverter: InverterHandle,
    runtime: watch::Receiver<InverterRuntime>,
    relay: Arc<dyn Relay>,
    load: Arc<dyn SwitchedLoad>,
    clock: Arc<dyn Clock>,
    liveness: Arc<dyn Liveness>,
    telemetry: Option<mpsc::Sender<TelemetryPoint>>,
    load_off: Throttler,
    activation: Throttler,
    load_latched_until: Option<DateTime<Utc>>,
}

impl ControlLoop {
    pub fn new(
        config: &BalancerConfig,
        meter: MeterHandle,
        inverter: InverterHandle,
        runtime: watch::Receiver<InverterRuntime>,
        relay: Arc<dyn Relay>,
        load: Arc<dyn SwitchedLoad>,
    ) -> Self {
        Self {
            control: config.control.clone(),
            battery: config.battery.clone(),
            limit_step_watt: config.inverter.limit_step_watt,
            meter,
            inverter,
            runtime,
            relay,
            load,
            clock: Arc::new(SystemClock),
            liveness: Arc::new(NoLiveness),
            telemetry: None,
            load_off: Throttler::new(config.control.load_off_hysteresis),
            activation: Throttler::new(config.control.activation_hysteresis),
            load_latched_until: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn Liveness>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_telemetry(mut self, telemetry: mpsc::Sender<TelemetryPoint>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn load_off_throttler(&self) -> &Throttler {
        &self.load_off
    }

    pub fn load_latched_until(&self) -> Option<DateTime<Utc>> {
        self.load_latched_until
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = self.control.tick_interval.as_secs(), "control loop started");
        self.liveness.ready();

        let mut ticker = interval(self.control.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.liveness.alive();
            match self.tick().await {
                Ok(TickOutcome::Completed(report)) => {
                    debug!(
                        balance = report.balance_w,
                        battery_level = report.battery_level,
                        action = ?report.action,
                        "tick complete"
                    );
                }
                Ok(TickOutcome::FailSafe(reason)) => {
                    warn!(?reason, "inverter idled");
                }
                Ok(TickOutcome::Sleep { until }) => {
                    if !self.sleep_until(until, &mut shutdown).await {
                        break;
                    }
                    ticker.reset();
                }
                Err(err) => {
                    warn!(error = %err, "tick failed, retrying next tick");
                }
            }
        }

        self.shutdown().await;
    }

    /// One balancing decision.
    pub async fn tick(&mut self) -> Result<TickOutcome, ActuatorError> {
        if !self.meter.is_healthy() {
            warn!("no data from energy meter");
            return self.fail_safe(FailSafe::MeterUnhealthy).await;
        }
        if !self.inverter.is_healthy() {
            warn!("inverter worker unhealthy");
            return self.fail_safe(FailSafe::InverterUnhealthy).await;
        }
        let Some(meter) = self.meter.snapshot() else {
            return self.fail_safe(FailSafe::MeterUnhealthy).await;
        };
        let Some(inverter) = self.inverter.snapshot() else {
            return self.fail_safe(FailSafe::InverterUnhealthy).await;
        };
        let runtime = self.runtime.borrow().clone();
        let Some(inverter_max) = runtime.max_watt() else {
            return self.fail_safe(FailSafe::InverterUnhealthy).await;
        };

        let now = self.clock.now();
        let hour = local_hour(now, self.control.timezone);
        let balance = meter.balance_w();
        debug!(import = meter.import_w(), export = meter.export_w(), balance, "grid exchange");

        let mut load_on = self.load.is_on().await?;
        if !load_on {
            if balance > self.control.surplus_on_watt && !self.load_latched(now) {
                info!(balance, "surplus, turning load on");
                self.load.set(true).await?;
                self.load_off.reset();
                load_on = true;
            } else if self.is_evening(hour) {
                return Ok(self.sleep_outcome(now));
            }
        }

        let load_draw = if load_on {
            self.load.power_watt().await?
        } else {
            0.0
        };
        if load_on && load_draw > self.control.load_idle_watt && load_draw < self.control.fully_charged_watt
        {
            if self.load_off.trigger() {
                info!(load_draw, "load fully charged, turning off");
                self.load.set(false).await?;
                load_on = false;
                if self.is_evening(hour) {
                    return Ok(self.sleep_outcome(now));
                }
                let until = next_local_hour(now, self.control.timezone, self.control.wake_hour);
                info!(%until, "load stays off until wake hour");
                self.load_latched_until = Some(until);
            } else {
                info!(load_draw, "load draw low, waiting");
            }
        }

        let battery_level = self.battery.level_percent(inverter.pv_volts);
        let mut max_discharge = self.battery.max_discharge_watt;
        if battery_level < self.battery.low_level_percent {
            info!(battery_level, "battery low, halving discharge");
            max_discharge /= 2.0;
        }
        let available = balance - self.control.reserved_watt + load_draw;

        let mut report = TickReport {
            balance_w: balance,
            battery_level,
            max_discharge_w: max_discharge,
            available_power_w: available,
            load_on,
            load_draw_w: load_draw,
            action: InverterAction::Idle,
        };

        if inverter.pv_volts < self.battery.min_voltage {
            let watt = self.stepped_down_limit(&inverter, &runtime, inverter_max);
            if watt < LIMIT_FLOOR_WATT {
                warn!(pv_volts = inverter.pv_volts, watt, "battery voltage too low");
                return self.fail_safe(FailSafe::BatteryLow).await;
            }
            info!(pv_volts = inverter.pv_volts, watt, "battery voltage low, limiting");
            self.inverter.enqueue(InverterCommand::SetLimit { watt });
            report.action = InverterAction::StepDown { watt };
            self.publish(now, &report);
            return Ok(TickOutcome::Completed(report));
        }

        report.action = self
            .decide_inverter(&meter, &inverter, &runtime, inverter_max, hour, load_on, battery_level, max_discharge)
            .await?;
        self.publish(now, &report);
        Ok(TickOutcome::Completed(report))
    }

    #[allow(clippy::too_many_arguments)]
    async fn decide_inverter(
        &mut self,
        meter: &MeterSnapshot,
        inverter: &InverterSnapshot,
        runtime: &InverterRuntime,
        inverter_max: f64,
        hour: u32,
        load_on: bool,
        battery_level: f64,
        max_discharge: f64,
    ) -> Result<InverterAction, ActuatorError> {
        if meter.export_w() > inverter_max {
            debug!(export = meter.export_w(), "export above inverter maximum");
            self.go_idle().await?;
            return Ok(InverterAction::OffExcessExport);
        }

        if runtime.last_limit_watt == Some(LIMIT_FLOOR_WATT) {
            info!("last limit at safety floor, turning inverter off");
            self.go_idle().await?;
            self.inverter.enqueue(InverterCommand::ClearLimit);
            return Ok(InverterAction::OffAtFloor);
        }

        if inverter.is_active() {
            let energy_requested = self.request_energy_if_due(meter, runtime, max_discharge);
            return Ok(InverterAction::Running { energy_requested });
        }

        let (window_start, window_end) = self.control.charging_window;
        if hour >= window_start && hour < window_end {
            debug!(hour, "charging window, not activating");
            self.activation.reset();
            return Ok(InverterAction::ChargingWindow);
        }
        if load_on {
            info!("load running, not activating inverter");
            self.activation.reset();
            return Ok(InverterAction::LoadRunning);
        }
        if battery_level > self.control.activation_level_percent
            && meter.import_w() > self.control.activation_import_watt
        {
            if !self.activation.trigger() {
                debug!(battery_level, import = meter.import_w(), "activation pending");
                return Ok(InverterAction::ActivationPending);
            }
            info!(battery_level, import = meter.import_w(), "turning inverter on");
            self.relay.set(true).await?;
            sleep(self.control.relay_settle).await;
            self.inverter.enqueue(InverterCommand::SetLimit {
                watt: self.control.initial_limit_watt,
            });
            return Ok(InverterAction::Activated);
        }

        debug!("no reason to activate inverter");
        self.activation.reset();
        Ok(InverterAction::Idle)
    }

    fn request_energy_if_due(
        &self,
        meter: &MeterSnapshot,
        runtime: &InverterRuntime,
        max_discharge: f64,
    ) -> bool {
        let balanced = meter.is_balanced(self.control.watt_tolerance);
        let refresh_due = runtime
            .since_last_limit_change()
            .map_or(true, |since| since > self.control.limit_refresh_interval);
        if balanced && !refresh_due {
            return false;
        }

        info!(balanced, refresh_due, "requesting energy");
        self.inverter.enqueue(InverterCommand::RequestEnergy {
            watt_request: meter.import_w() - meter.export_w(),
            watt_tolerance: self.control.watt_tolerance,
            set_limit_interval: self.control.set_limit_interval,
            watt_max: max_discharge,
        })
    }

    fn stepped_down_limit(
        &self,
        inverter: &InverterSnapshot,
        runtime: &InverterRuntime,
        inverter_max: f64,
    ) -> f64 {
        if inverter.ac_watts > inverter_max {
            warn!(ac_watts = inverter.ac_watts, "implausible ac power, using initial limit");
            return self.control.initial_limit_watt;
        }
        match runtime.last_limit_watt {
            Some(last) => last - self.limit_step_watt,
            None => inverter.ac_watts - self.limit_step_watt,
        }
    }

    fn is_evening(&self, hour: u32) -> bool {
        self.control
            .evening_cutoff_hour
            .is_some_and(|cutoff| hour >= cutoff)
    }

    fn load_latched(&mut self, now: DateTime<Utc>) -> bool {
        match self.load_latched_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.load_latched_until = None;
                false
            }
            None => false,
        }
    }

    fn sleep_outcome(&self, now: DateTime<Utc>) -> TickOutcome {
        TickOutcome::Sleep {
            until: next_local_hour(now, self.control.timezone, self.control.wake_hour),
        }
    }

    async fn fail_safe(&self, reason: FailSafe) -> Result<TickOutcome, ActuatorError> {
        metrics::counter!("balancer_fail_safe_total", "reason" => reason.label()).increment(1);
        self.go_idle().await?;
        Ok(TickOutcome::FailSafe(reason))
    }

    /// Switches the inverter relay off if it is not already. Limits queued
    /// for a running inverter are dropped so they are not replayed later.
    async fn go_idle(&self) -> Result<(), ActuatorError> {
        self.inverter.discard_pending();
        match self.relay.is_on().await {
            Ok(false) => Ok(()),
            Ok(true) => {
                info!("turning inverter relay off");
                self.relay.set(false).await
            }
            Err(err) => {
                warn!(error = %err, "relay state unknown, switching off");
                self.relay.set(false).await
            }
        }
    }

    async fn sleep_until(
        &mut self,
        until: DateTime<Utc>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let duration = (until - self.clock.now()).to_std().unwrap_or_default();
        info!(%until, hours = duration.as_secs_f64() / 3_600.0, "sleeping until wake hour");
        if let Err(err) = self.go_idle().await {
            warn!(error = %err, "failed to idle inverter before sleeping");
        }
        self.meter.suspend();

        let completed = sleep_with_pulses(duration, self.liveness.as_ref(), shutdown).await;

        self.meter.resume();
        if completed {
            info!("waking up");
        }
        completed
    }

    async fn shutdown(&mut self) {
        info!("control loop stopping");
        self.liveness.stopping();
        if let Err(err) = self.go_idle().await {
            warn!(error = %err, "failed to idle inverter on shutdown");
        }
        self.meter.stop();
        self.inverter.stop();
        info!("control loop stopped");
    }

    fn publish(&self, now: DateTime<Utc>, report: &TickReport) {
        metrics::gauge!("balancer_grid_balance_watt").set(report.balance_w);
        metrics::gauge!("balancer_battery_level_percent").set(report.battery_level);

        let Some(sender) = &self.telemetry else {
            return;
        };
        let point = TelemetryPoint::new("InverterController", now)
            .field("balance", report.balance_w)
            .field("battery_level", report.battery_level)
            .field("available_power", report.available_power_w);
        if let Err(err) = sender.try_send(point) {
            debug!(error = %err, "telemetry point dropped");
        }
    }
}
