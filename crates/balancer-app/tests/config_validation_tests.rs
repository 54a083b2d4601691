use std::env;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use balancer_app::BalancerConfig;
use chrono_tz::Tz;

static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn defaults_validate() {
    let config = BalancerConfig::default();
    config.validate().expect("validate defaults");
    assert_eq!(config.control.tick_interval, Duration::from_secs(30));
    assert_eq!(config.charger.levels.len(), 14);
}

#[test]
fn toml_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("BALANCER_CONFIG", fixture_path("config-valid.toml"));

    let config = BalancerConfig::load().expect("load config");
    config.validate().expect("validate config");

    assert_eq!(config.inverter.serial.device, "/dev/ttyUSB0");
    assert_eq!(config.meter.serial_number, Some(1_900_123_456));
    assert_eq!(config.control.timezone, Tz::Europe__Berlin);
    assert_eq!(config.control.evening_cutoff_hour, Some(19));
    assert_eq!(config.charger.levels, vec![(310.0, 0.4), (370.0, 1.0), (1_750.0, 0.1)]);
    let influx = config.telemetry.influx.as_ref().expect("influx configured");
    assert_eq!(influx.database, "solar");
    assert_eq!(config.telemetry.batch_size, 20);

    env::remove_var("BALANCER_CONFIG");
}

#[test]
fn json_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("BALANCER_CONFIG", fixture_path("config-valid.json"));

    let config = BalancerConfig::load().expect("load config");
    config.validate().expect("validate config");

    assert_eq!(config.inverter.inverter_id, 10_001);
    assert_eq!(config.meter.poll_interval, Duration::from_millis(500));
    assert_eq!(config.control.evening_cutoff_hour, None);
    assert!(config.telemetry.influx.is_none());
    assert!(config.telemetry.prometheus_listen.is_some());

    env::remove_var("BALANCER_CONFIG");
}

#[test]
fn invalid_config_fails_validation() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("BALANCER_CONFIG", fixture_path("config-invalid.toml"));

    let config = BalancerConfig::load().expect("load config");
    let err = config.validate().expect_err("inverted voltage bounds");
    assert!(err.to_string().contains("battery.max_voltage"));

    env::remove_var("BALANCER_CONFIG");
}

#[test]
fn unknown_timezone_fails_to_load() {
    let _guard = ENV_LOCK.lock().expect("env lock");

    let result = BalancerConfig::load_with_path(Some(fixture_path("config-bad-timezone.toml")));
    assert!(result.is_err());
}

#[test]
fn environment_overrides_file() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("BALANCER_INVERTER_DEVICE", "/dev/ttyAMA0");
    env::set_var("BALANCER_MAX_DISCHARGE_WATT", "250");

    let config = BalancerConfig::load_with_path(Some(fixture_path("config-valid.toml")))
        .expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.inverter.serial.device, "/dev/ttyAMA0");
    assert_eq!(config.battery.max_discharge_watt, 250.0);

    env::remove_var("BALANCER_INVERTER_DEVICE");
    env::remove_var("BALANCER_MAX_DISCHARGE_WATT");
}

#[test]
fn unsorted_charger_levels_fail_validation() {
    let mut config = BalancerConfig::default();
    config.charger.levels = vec![(400.0, 1.0), (300.0, 0.4)];
    assert!(config.validate().is_err());
}

#[test]
fn staleness_thresholds_must_be_ordered() {
    let mut config = BalancerConfig::default();
    config.worker.stale_soft = Duration::from_secs(120);
    config.worker.stale_hard = Duration::from_secs(60);
    assert!(config.validate().is_err());
}

fn fixture_path(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path.to_string_lossy().to_string()
}
