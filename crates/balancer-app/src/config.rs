use std::env;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;

use device_worker::WorkerConfig;
use meter_codec::DecodeOptions;
use telemetry_sink::InfluxConfig;
use transport::{MulticastConfig, SerialConfig};

use crate::actuators::{EdimaxConfig, PWM_MAX_VOLT};

const CONFIG_ENV: &str = "BALANCER_CONFIG";
const DEFAULT_METER_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_BATCH_SIZE: usize = 50;

/// Watt threshold to charger control voltage, ascending by watt.
pub const DEFAULT_CHARGER_LEVELS: [(f64, f64); 14] = [
    (310.0, 0.4),
    (370.0, 1.0),
    (440.0, 1.2),
    (510.0, 1.4),
    (610.0, 1.6),
    (660.0, 1.8),
    (740.0, 2.0),
    (810.0, 2.2),
    (890.0, 2.4),
    (980.0, 2.6),
    (1_060.0, 2.8),
    (1_170.0, 3.0),
    (1_270.0, 3.2),
    // Below 0.4V the charger runs at full power.
    (1_750.0, 0.1),
];

#[derive(Clone, Debug)]
pub struct InverterConfig {
    pub serial: SerialConfig,
    pub inverter_id: u16,
    pub relay_pin: u32,
    pub gpio_base: String,
    /// Step applied to the limit while the battery voltage is too low.
    pub limit_step_watt: f64,
    pub max_increase_watt: f64,
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            inverter_id: 10_000,
            relay_pin: 17,
            gpio_base: "/sys/class/gpio".to_string(),
            limit_step_watt: 20.0,
            max_increase_watt: 50.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MeterConfig {
    pub multicast: MulticastConfig,
    pub serial_number: Option<u32>,
    pub options: DecodeOptions,
    pub poll_interval: Duration,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            multicast: MulticastConfig::default(),
            serial_number: None,
            options: DecodeOptions::default(),
            poll_interval: Duration::from_millis(DEFAULT_METER_POLL_INTERVAL_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BatteryConfig {
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub max_discharge_watt: f64,
    /// Below this level the discharge ceiling is halved.
    pub low_level_percent: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            min_voltage: 46.0,
            max_voltage: 54.0,
            max_discharge_watt: 400.0,
            low_level_percent: 20.0,
        }
    }
}

impl BatteryConfig {
    /// Linear charge level between the voltage bounds, in percent.
    pub fn level_percent(&self, volts: f64) -> f64 {
        100.0 / (self.max_voltage - self.min_voltage) * (volts - self.min_voltage)
    }
}

#[derive(Clone, Debug)]
pub struct ControlConfig {
    pub tick_interval: Duration,
    /// Surplus that switches the load on.
    pub surplus_on_watt: f64,
    /// Draw at or below which the load counts as idle.
    pub load_idle_watt: f64,
    /// Draw below which a running load counts as fully charged.
    pub fully_charged_watt: f64,
    pub reserved_watt: f64,
    pub activation_level_percent: f64,
    pub activation_import_watt: f64,
    pub activation_hysteresis: Duration,
    /// Local hours `[start, end)` reserved for charging the battery.
    pub charging_window: (u32, u32),
    /// Local hour from which an idle load sends the loop to sleep.
    pub evening_cutoff_hour: Option<u32>,
    pub wake_hour: u32,
    pub watt_tolerance: f64,
    pub set_limit_interval: Duration,
    /// Re-request energy after this long even when balanced.
    pub limit_refresh_interval: Duration,
    pub relay_settle: Duration,
    pub initial_limit_watt: f64,
    pub load_off_hysteresis: Duration,
    pub timezone: Tz,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            surplus_on_watt: 500.0,
            load_idle_watt: 50.0,
            fully_charged_watt: 260.0,
            reserved_watt: 50.0,
            activation_level_percent: 25.0,
            activation_import_watt: 100.0,
            activation_hysteresis: Duration::from_secs(50),
            charging_window: (12, 16),
            evening_cutoff_hour: Some(19),
            wake_hour: 4,
            watt_tolerance: 20.0,
            set_limit_interval: Duration::from_secs(120),
            limit_refresh_interval: Duration::from_secs(240),
            relay_settle: Duration::from_secs(10),
            initial_limit_watt: 100.0,
            load_off_hysteresis: Duration::from_secs(300),
            timezone: Tz::UTC,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChargerConfig {
    pub pwm_chip: String,
    pub pwm_channel: u32,
    /// Voltage parked on the output while idle or stopped.
    pub idle_volt: f64,
    pub levels: Vec<(f64, f64)>,
}

impl Default for ChargerConfig {
    fn default() -> Self {
        Self {
            pwm_chip: "/sys/class/pwm/pwmchip1".to_string(),
            pwm_channel: 0,
            idle_volt: 1.0,
            levels: DEFAULT_CHARGER_LEVELS.to_vec(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub influx: Option<InfluxConfig>,
    pub prometheus_listen: Option<SocketAddr>,
    pub channel_capacity: usize,
    pub batch_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            influx: None,
            prometheus_listen: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BalancerConfig {
    pub inverter: InverterConfig,
    pub meter: MeterConfig,
    pub battery: BatteryConfig,
    pub control: ControlConfig,
    pub charger: ChargerConfig,
    pub load: EdimaxConfig,
    pub telemetry: TelemetryConfig,
    pub worker: WorkerConfig,
}

impl BalancerConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config)?;
        }

        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.inverter.serial.device.trim().is_empty() {
            anyhow::bail!("inverter.device must be non-empty");
        }
        if self.inverter.serial.baud_rate == 0 {
            anyhow::bail!("inverter.baud_rate must be >= 1");
        }
        if self.inverter.serial.read_timeout_ms == 0 {
            anyhow::bail!("inverter.read_timeout_ms must be >= 1");
        }
        if self.inverter.limit_step_watt <= 0.0 {
            anyhow::bail!("inverter.limit_step_watt must be > 0");
        }
        if self.inverter.max_increase_watt <= 0.0 {
            anyhow::bail!("inverter.max_increase_watt must be > 0");
        }
        if !self.meter.multicast.group.is_multicast() {
            anyhow::bail!("meter.group must be an IPv4 multicast address");
        }
        if self.meter.multicast.port == 0 {
            anyhow::bail!("meter.port must be between 1 and 65535");
        }
        if self.meter.multicast.recv_timeout_ms == 0 {
            anyhow::bail!("meter.recv_timeout_ms must be >= 1");
        }
        if self.meter.poll_interval.is_zero() {
            anyhow::bail!("meter.poll_interval_ms must be >= 1");
        }
        if self.battery.max_voltage <= self.battery.min_voltage {
            anyhow::bail!("battery.max_voltage must be greater than battery.min_voltage");
        }
        if self.battery.max_discharge_watt <= 0.0 {
            anyhow::bail!("battery.max_discharge_watt must be > 0");
        }
        if !(0.0..=100.0).contains(&self.battery.low_level_percent) {
            anyhow::bail!("battery.low_level_percent must be between 0 and 100");
        }

        let control = &self.control;
        if control.tick_interval.is_zero() {
            anyhow::bail!("control.tick_interval_secs must be >= 1");
        }
        if control.fully_charged_watt <= control.load_idle_watt {
            anyhow::bail!("control.fully_charged_watt must be greater than control.load_idle_watt");
        }
        if control.watt_tolerance <= 0.0 {
            anyhow::bail!("control.watt_tolerance must be > 0");
        }
        let (start, end) = control.charging_window;
        if start > 24 || end > 24 || start > end {
            anyhow::bail!("control.charging_window must be two hours with start <= end <= 24");
        }
        if let Some(hour) = control.evening_cutoff_hour {
            if hour > 23 {
                anyhow::bail!("control.evening_cutoff_hour must be between 0 and 23");
            }
        }
        if control.wake_hour > 23 {
            anyhow::bail!("control.wake_hour must be between 0 and 23");
        }
        if control.initial_limit_watt < types::LIMIT_FLOOR_WATT {
            anyhow::bail!("control.initial_limit_watt must be >= {}", types::LIMIT_FLOOR_WATT);
        }

        if !(0.0..=PWM_MAX_VOLT).contains(&self.charger.idle_volt) {
            anyhow::bail!("charger.idle_volt must be between 0 and {PWM_MAX_VOLT}");
        }
        if self.charger.levels.is_empty() {
            anyhow::bail!("charger.levels must not be empty");
        }
        if self
            .charger
            .levels
            .windows(2)
            .any(|pair| pair[0].0 >= pair[1].0)
        {
            anyhow::bail!("charger.levels must be sorted by ascending watt");
        }

        if self.load.host.trim().is_empty() {
            anyhow::bail!("load.host must be non-empty");
        }
        if let Some(influx) = &self.telemetry.influx {
            if influx.url.trim().is_empty() || influx.database.trim().is_empty() {
                anyhow::bail!("telemetry.influx_url and telemetry.influx_database must be non-empty");
            }
        }
        if self.telemetry.channel_capacity == 0 {
            anyhow::bail!("telemetry.channel_capacity must be >= 1");
        }

        let worker = &self.worker;
        if worker.poll_interval.is_zero() {
            anyhow::bail!("worker.poll_interval_secs must be >= 1");
        }
        if worker.stale_soft >= worker.stale_hard {
            anyhow::bail!("worker.stale_soft_secs must be below worker.stale_hard_secs");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    inverter: Option<FileInverterConfig>,
    meter: Option<FileMeterConfig>,
    battery: Option<FileBatteryConfig>,
    control: Option<FileControlConfig>,
    charger: Option<FileChargerConfig>,
    load: Option<FileLoadConfig>,
    telemetry: Option<FileTelemetryConfig>,
    worker: Option<FileWorkerConfig>,
}

#[derive(Debug, Deserialize)]
struct FileInverterConfig {
    device: Option<String>,
    inverter_id: Option<u16>,
    baud_rate: Option<u32>,
    read_timeout_ms: Option<u64>,
    retry_count: Option<usize>,
    retry_backoff_ms: Option<u64>,
    relay_pin: Option<u32>,
    gpio_base: Option<String>,
    limit_step_watt: Option<f64>,
    max_increase_watt: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FileMeterConfig {
    group: Option<Ipv4Addr>,
    port: Option<u16>,
    interface: Option<Ipv4Addr>,
    recv_timeout_ms: Option<u64>,
    serial_number: Option<u32>,
    phases: Option<bool>,
    counters: Option<bool>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileBatteryConfig {
    min_voltage: Option<f64>,
    max_voltage: Option<f64>,
    max_discharge_watt: Option<f64>,
    low_level_percent: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FileControlConfig {
    tick_interval_secs: Option<u64>,
    surplus_on_watt: Option<f64>,
    load_idle_watt: Option<f64>,
    fully_charged_watt: Option<f64>,
    reserved_watt: Option<f64>,
    activation_level_percent: Option<f64>,
    activation_import_watt: Option<f64>,
    activation_hysteresis_secs: Option<u64>,
    charging_window: Option<[u32; 2]>,
    evening_cutoff_hour: Option<u32>,
    disable_evening_sleep: Option<bool>,
    wake_hour: Option<u32>,
    watt_tolerance: Option<f64>,
    set_limit_interval_secs: Option<u64>,
    limit_refresh_interval_secs: Option<u64>,
    relay_settle_secs: Option<u64>,
    initial_limit_watt: Option<f64>,
    load_off_hysteresis_secs: Option<u64>,
    timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileChargerConfig {
    pwm_chip: Option<String>,
    pwm_channel: Option<u32>,
    idle_volt: Option<f64>,
    levels: Option<Vec<FileChargerLevel>>,
}

#[derive(Debug, Deserialize)]
struct FileChargerLevel {
    watt: f64,
    volt: f64,
}

#[derive(Debug, Deserialize)]
struct FileLoadConfig {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileTelemetryConfig {
    influx_url: Option<String>,
    influx_database: Option<String>,
    prometheus_listen: Option<SocketAddr>,
    channel_capacity: Option<usize>,
    batch_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FileWorkerConfig {
    poll_interval_secs: Option<u64>,
    connect_backoff_secs: Option<u64>,
    stale_soft_secs: Option<u64>,
    stale_hard_secs: Option<u64>,
    reconnect_pause_secs: Option<u64>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var(CONFIG_ENV) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path).with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|err| anyhow::anyhow!("control.timezone {name:?} is unknown: {err}"))
}

fn apply_file_config(config: &mut BalancerConfig, file: FileConfig) -> Result<()> {
    if let Some(inverter) = file.inverter {
        let target = &mut config.inverter;
        if let Some(device) = inverter.device {
            target.serial.device = device;
        }
        if let Some(id) = inverter.inverter_id {
            target.inverter_id = id;
        }
        if let Some(baud) = inverter.baud_rate {
            target.serial.baud_rate = baud;
        }
        if let Some(timeout) = inverter.read_timeout_ms {
            target.serial.read_timeout_ms = timeout;
            target.serial.write_timeout_ms = timeout;
        }
        if let Some(retry_count) = inverter.retry_count {
            target.serial.retry_count = retry_count;
        }
        if let Some(backoff) = inverter.retry_backoff_ms {
            target.serial.retry_backoff_ms = backoff;
        }
        if let Some(pin) = inverter.relay_pin {
            target.relay_pin = pin;
        }
        if let Some(base) = inverter.gpio_base {
            target.gpio_base = base;
        }
        if let Some(step) = inverter.limit_step_watt {
            target.limit_step_watt = step;
        }
        if let Some(increase) = inverter.max_increase_watt {
            target.max_increase_watt = increase;
        }
    }

    if let Some(meter) = file.meter {
        let target = &mut config.meter;
        if let Some(group) = meter.group {
            target.multicast.group = group;
        }
        if let Some(port) = meter.port {
            target.multicast.port = port;
        }
        if let Some(interface) = meter.interface {
            target.multicast.interface = interface;
        }
        if let Some(timeout) = meter.recv_timeout_ms {
            target.multicast.recv_timeout_ms = timeout;
        }
        if let Some(serial) = meter.serial_number {
            target.serial_number = Some(serial);
        }
        if let Some(phases) = meter.phases {
            target.options.phases = phases;
        }
        if let Some(counters) = meter.counters {
            target.options.counters = counters;
        }
        if let Some(interval) = meter.poll_interval_ms {
            target.poll_interval = Duration::from_millis(interval);
        }
    }

    if let Some(battery) = file.battery {
        let target = &mut config.battery;
        if let Some(value) = battery.min_voltage {
            target.min_voltage = value;
        }
        if let Some(value) = battery.max_voltage {
            target.max_voltage = value;
        }
        if let Some(value) = battery.max_discharge_watt {
            target.max_discharge_watt = value;
        }
        if let Some(value) = battery.low_level_percent {
            target.low_level_percent = value;
        }
    }

    if let Some(control) = file.control {
        let target = &mut config.control;
        if let Some(secs) = control.tick_interval_secs {
            target.tick_interval = Duration::from_secs(secs);
        }
        if let Some(value) = control.surplus_on_watt {
            target.surplus_on_watt = value;
        }
        if let Some(value) = control.load_idle_watt {
            target.load_idle_watt = value;
        }
        if let Some(value) = control.fully_charged_watt {
            target.fully_charged_watt = value;
        }
        if let Some(value) = control.reserved_watt {
            target.reserved_watt = value;
        }
        if let Some(value) = control.activation_level_percent {
            target.activation_level_percent = value;
        }
        if let Some(value) = control.activation_import_watt {
            target.activation_import_watt = value;
        }
        if let Some(secs) = control.activation_hysteresis_secs {
            target.activation_hysteresis = Duration::from_secs(secs);
        }
        if let Some([start, end]) = control.charging_window {
            target.charging_window = (start, end);
        }
        if let Some(hour) = control.evening_cutoff_hour {
            target.evening_cutoff_hour = Some(hour);
        }
        if control.disable_evening_sleep == Some(true) {
            target.evening_cutoff_hour = None;
        }
        if let Some(hour) = control.wake_hour {
            target.wake_hour = hour;
        }
        if let Some(value) = control.watt_tolerance {
            target.watt_tolerance = value;
        }
        if let Some(secs) = control.set_limit_interval_secs {
            target.set_limit_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = control.limit_refresh_interval_secs {
            target.limit_refresh_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = control.relay_settle_secs {
            target.relay_settle = Duration::from_secs(secs);
        }
        if let Some(value) = control.initial_limit_watt {
            target.initial_limit_watt = value;
        }
        if let Some(secs) = control.load_off_hysteresis_secs {
            target.load_off_hysteresis = Duration::from_secs(secs);
        }
        if let Some(name) = control.timezone {
            target.timezone = parse_timezone(&name)?;
        }
    }

    if let Some(charger) = file.charger {
        let target = &mut config.charger;
        if let Some(chip) = charger.pwm_chip {
            target.pwm_chip = chip;
        }
        if let Some(channel) = charger.pwm_channel {
            target.pwm_channel = channel;
        }
        if let Some(volt) = charger.idle_volt {
            target.idle_volt = volt;
        }
        if let Some(levels) = charger.levels {
            target.levels = levels
                .into_iter()
                .map(|level| (level.watt, level.volt))
                .collect();
        }
    }

    if let Some(load) = file.load {
        let target = &mut config.load;
        if let Some(host) = load.host {
            target.host = host;
        }
        if let Some(port) = load.port {
            target.port = port;
        }
        if let Some(username) = load.username {
            target.username = username;
        }
        if let Some(password) = load.password {
            target.password = password;
        }
        if let Some(timeout) = load.timeout_ms {
            target.timeout_ms = timeout;
        }
    }

    if let Some(telemetry) = file.telemetry {
        let target = &mut config.telemetry;
        if let Some(url) = telemetry.influx_url {
            target.influx.get_or_insert_with(InfluxConfig::default).url = url;
        }
        if let Some(database) = telemetry.influx_database {
            target.influx.get_or_insert_with(InfluxConfig::default).database = database;
        }
        if let Some(listen) = telemetry.prometheus_listen {
            target.prometheus_listen = Some(listen);
        }
        if let Some(capacity) = telemetry.channel_capacity {
            target.channel_capacity = capacity;
        }
        if let Some(batch) = telemetry.batch_size {
            target.batch_size = batch.max(1);
        }
    }

    if let Some(worker) = file.worker {
        let target = &mut config.worker;
        if let Some(secs) = worker.poll_interval_secs {
            target.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = worker.connect_backoff_secs {
            target.connect_backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = worker.stale_soft_secs {
            target.stale_soft = Duration::from_secs(secs);
        }
        if let Some(secs) = worker.stale_hard_secs {
            target.stale_hard = Duration::from_secs(secs);
        }
        if let Some(secs) = worker.reconnect_pause_secs {
            target.reconnect_pause = Duration::from_secs(secs);
        }
    }

    Ok(())
}

fn apply_env_overrides(config: &mut BalancerConfig) -> Result<()> {
    if let Ok(value) = env::var("BALANCER_INVERTER_DEVICE") {
        config.inverter.serial.device = value;
    }
    if let Some(id) = parse_env("BALANCER_INVERTER_ID") {
        config.inverter.inverter_id = id;
    }
    if let Some(pin) = parse_env("BALANCER_RELAY_PIN") {
        config.inverter.relay_pin = pin;
    }
    if let Some(serial) = parse_env("BALANCER_METER_SERIAL") {
        config.meter.serial_number = Some(serial);
    }
    if let Some(interface) = parse_env("BALANCER_METER_INTERFACE") {
        config.meter.multicast.interface = interface;
    }
    if let Some(volts) = parse_env("BALANCER_BATTERY_MIN_VOLTAGE") {
        config.battery.min_voltage = volts;
    }
    if let Some(volts) = parse_env("BALANCER_BATTERY_MAX_VOLTAGE") {
        config.battery.max_voltage = volts;
    }
    if let Some(watt) = parse_env("BALANCER_MAX_DISCHARGE_WATT") {
        config.battery.max_discharge_watt = watt;
    }
    if let Some(secs) = parse_env("BALANCER_TICK_SECS") {
        config.control.tick_interval = Duration::from_secs(secs);
    }
    if let Ok(name) = env::var("BALANCER_TIMEZONE") {
        config.control.timezone = parse_timezone(&name)?;
    }
    if let Ok(host) = env::var("BALANCER_LOAD_HOST") {
        config.load.host = host;
    }
    if let Ok(password) = env::var("BALANCER_LOAD_PASSWORD") {
        config.load.password = password;
    }
    if let Ok(url) = env::var("BALANCER_INFLUX_URL") {
        config.telemetry.influx.get_or_insert_with(InfluxConfig::default).url = url;
    }
    if let Ok(database) = env::var("BALANCER_INFLUX_DATABASE") {
        config.telemetry.influx.get_or_insert_with(InfluxConfig::default).database = database;
    }
    if let Some(listen) = parse_env("BALANCER_PROMETHEUS_LISTEN") {
        config.telemetry.prometheus_listen = Some(listen);
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
