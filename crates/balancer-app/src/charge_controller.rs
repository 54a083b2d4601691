//! Surplus charging through a PWM-controlled charger behind a smart plug.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use types::TelemetryPoint;

use crate::actuators::{ActuatorError, PwmOutput, SwitchedLoad};
use crate::clock::{local_hour, next_local_hour, Clock, SystemClock};
use crate::config::{BalancerConfig, ChargerConfig, ControlConfig};
use crate::control_loop::MeterHandle;
use crate::liveness::{sleep_with_pulses, Liveness, NoLiveness};
use crate::throttler::Throttler;

/// The highest level whose watt threshold does not exceed `watt`.
pub fn select_level(levels: &[(f64, f64)], watt: f64) -> Option<(f64, f64)> {
    levels
        .iter()
        .take_while(|(threshold, _)| *threshold <= watt)
        .last()
        .copied()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeReport {
    pub balance_w: f64,
    pub charger_draw_w: f64,
    pub available_power_w: f64,
    pub level_watt: f64,
    pub volt: f64,
    /// False when the available power was below every level and the plug was
    /// switched off.
    pub plug_on: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChargeOutcome {
    NoData,
    Sleep { until: DateTime<Utc> },
    Idle,
    Charging(ChargeReport),
}

pub struct ChargeController {
    control: ControlConfig,
    charger: ChargerConfig,
    meter: MeterHandle,
    plug: Arc<dyn SwitchedLoad>,
    pwm: Arc<dyn PwmOutput>,
    clock: Arc<dyn Clock>,
    liveness: Arc<dyn Liveness>,
    telemetry: Option<mpsc::Sender<TelemetryPoint>>,
    off: Throttler,
}

impl ChargeController {
    pub fn new(
        config: &BalancerConfig,
        meter: MeterHandle,
        plug: Arc<dyn SwitchedLoad>,
        pwm: Arc<dyn PwmOutput>,
    ) -> Self {
        Self {
            control: config.control.clone(),
            charger: config.charger.clone(),
            meter,
            plug,
            pwm,
            clock: Arc::new(SystemClock),
            liveness: Arc::new(NoLiveness),
            telemetry: None,
            off: Throttler::new(config.control.load_off_hysteresis),
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

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        match self.pwm.volt().await {
            Ok(volt) => info!(volt, "charge controller started"),
            Err(err) => warn!(error = %err, "charge controller started, pwm unreadable"),
        }
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
                Ok(ChargeOutcome::Charging(report)) => {
                    info!(
                        charger = report.charger_draw_w,
                        balance = report.balance_w,
                        available = report.available_power_w,
                        volt = report.volt,
                        "charger adjusted"
                    );
                }
                Ok(ChargeOutcome::Sleep { until }) => {
                    let duration = (until - self.clock.now()).to_std().unwrap_or_default();
                    info!(%until, hours = duration.as_secs_f64() / 3_600.0, "sleeping until wake hour");
                    self.meter.suspend();
                    let completed =
                        sleep_with_pulses(duration, self.liveness.as_ref(), &mut shutdown).await;
                    self.meter.resume();
                    if !completed {
                        break;
                    }
                    info!("waking up");
                    ticker.reset();
                }
                Ok(ChargeOutcome::NoData) => warn!("no energy meter data"),
                Ok(ChargeOutcome::Idle) => debug!("charger off"),
                Err(err) => warn!(error = %err, "charger tick failed, retrying next tick"),
            }
        }

        self.shutdown().await;
    }

    pub async fn tick(&mut self) -> Result<ChargeOutcome, ActuatorError> {
        let snapshot = match self.meter.snapshot() {
            Some(snapshot) if self.meter.is_healthy() => snapshot,
            _ => {
                self.park().await?;
                return Ok(ChargeOutcome::NoData);
            }
        };

        let now = self.clock.now();
        let balance = snapshot.balance_w();

        if !self.plug.is_on().await? {
            if balance > self.control.surplus_on_watt {
                info!(balance, "surplus, turning smart plug on");
                self.plug.set(true).await?;
                self.off.reset();
            } else if self.is_evening(now) {
                return Ok(self.sleep_outcome(now));
            } else {
                self.park().await?;
                return Ok(ChargeOutcome::Idle);
            }
        }

        let charger_draw = self.plug.power_watt().await?;
        let available = balance - self.control.reserved_watt + charger_draw;

        if charger_draw > self.control.load_idle_watt
            && charger_draw < self.control.fully_charged_watt
        {
            if self.off.trigger() {
                info!(charger_draw, "fully charged, turning smart plug off");
                self.plug.set(false).await?;
                return Ok(self.sleep_outcome(now));
            }
            info!(charger_draw, "fully charged, waiting");
        }

        let (level_watt, volt, plug_on) = self.set_output(available).await?;
        let report = ChargeReport {
            balance_w: balance,
            charger_draw_w: charger_draw,
            available_power_w: available,
            level_watt,
            volt,
            plug_on,
        };
        self.publish(now, &report);
        Ok(ChargeOutcome::Charging(report))
    }

    /// Writes the volt for the level matching `watt`; switches the plug off
    /// and parks the lowest level when nothing matches.
    async fn set_output(&self, watt: f64) -> Result<(f64, f64, bool), ActuatorError> {
        let (level, plug_on) = match select_level(&self.charger.levels, watt) {
            Some(level) => (level, true),
            None => {
                info!(watt, "below lowest charger level, turning smart plug off");
                self.plug.set(false).await?;
                let lowest = self
                    .charger
                    .levels
                    .first()
                    .copied()
                    .unwrap_or((0.0, self.charger.idle_volt));
                (lowest, false)
            }
        };
        let (level_watt, volt) = level;

        let current = self.pwm.volt().await?;
        if (current - volt).abs() < f64::EPSILON {
            debug!(volt, "charger volt unchanged");
        } else {
            info!(volt, was = current, level_watt, "setting charger volt");
            self.pwm.set_volt(volt).await?;
        }
        Ok((level_watt, volt, plug_on))
    }

    async fn park(&self) -> Result<(), ActuatorError> {
        self.pwm.set_volt(self.charger.idle_volt).await
    }

    fn is_evening(&self, now: DateTime<Utc>) -> bool {
        let hour = local_hour(now, self.control.timezone);
        self.control
            .evening_cutoff_hour
            .is_some_and(|cutoff| hour >= cutoff)
    }

    fn sleep_outcome(&self, now: DateTime<Utc>) -> ChargeOutcome {
        ChargeOutcome::Sleep {
            until: next_local_hour(now, self.control.timezone, self.control.wake_hour),
        }
    }

    async fn shutdown(&mut self) {
        info!("charge controller stopping");
        self.liveness.stopping();
        self.meter.stop();
        if let Err(err) = self.park().await {
            warn!(error = %err, "failed to park charger on shutdown");
        }
        info!("charge controller stopped");
    }

    fn publish(&self, now: DateTime<Utc>, report: &ChargeReport) {
        metrics::gauge!("charger_volt").set(report.volt);

        let Some(sender) = &self.telemetry else {
            return;
        };
        let point = TelemetryPoint::new("ChargeController", now)
            .field("power_limit", report.level_watt)
            .field("power_real", report.charger_draw_w)
            .field("volt", report.volt);
        if let Err(err) = sender.try_send(point) {
            debug!(error = %err, "telemetry point dropped");
        }
    }
}
