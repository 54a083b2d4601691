use chrono::{TimeZone, Utc};
use telemetry_sink::{serialize, sink_task, to_line, InfluxConfig, Publisher};
use tokio::sync::{mpsc, watch};
use types::TelemetryPoint;

fn inverter_point() -> TelemetryPoint {
    let time = Utc.timestamp_opt(1_700_000_000, 0).single().expect("time");
    TelemetryPoint::new("InverterData", time)
        .tag("inverter_id", "10000")
        .tag("dev", "/dev/ttyUSB0")
        .field("ac_watts", 120.5)
        .field("pv_volts", 51.0)
}

#[test]
fn point_becomes_one_line_with_sorted_tags_and_fields() {
    let line = to_line(&inverter_point()).expect("line");
    assert_eq!(
        line,
        "InverterData,dev=/dev/ttyUSB0,inverter_id=10000 ac_watts=120.5,pv_volts=51 1700000000000000000"
    );
}

#[test]
fn special_characters_are_escaped() {
    let time = Utc.timestamp_opt(0, 0).single().expect("time");
    let point = TelemetryPoint::new("Charge Controller", time)
        .tag("site", "roof,east")
        .field("power limit", 1.0);
    let line = to_line(&point).expect("line");
    assert_eq!(line, "Charge\\ Controller,site=roof\\,east power\\ limit=1 0");
}

#[test]
fn points_without_finite_fields_are_skipped() {
    let time = Utc.timestamp_opt(0, 0).single().expect("time");
    let empty = TelemetryPoint::new("Empty", time);
    let broken = TelemetryPoint::new("Broken", time).field("value", f64::NAN);

    assert!(to_line(&empty).is_none());
    assert!(to_line(&broken).is_none());
    assert_eq!(serialize(&[empty, broken, inverter_point()]).lines().count(), 1);
}

#[tokio::test]
async fn log_publisher_accepts_batches() {
    let publisher = Publisher::new_log();
    assert!(!publisher.is_remote());
    publisher
        .publish(&[inverter_point(), inverter_point()])
        .await
        .expect("publish");
}

#[tokio::test]
async fn sink_stops_when_channel_closes() {
    let (tx, rx) = mpsc::channel(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(sink_task(rx, Publisher::new_log(), shutdown_rx, 8));

    for _ in 0..20 {
        tx.send(inverter_point()).await.expect("send");
    }
    drop(tx);
    task.await.expect("sink task");
}

#[tokio::test]
async fn sink_flushes_and_stops_on_shutdown() {
    let (tx, rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tx.send(inverter_point()).await.expect("send");

    let task = tokio::spawn(sink_task(rx, Publisher::new_log(), shutdown_rx, 8));
    shutdown_tx.send(true).expect("shutdown");
    task.await.expect("sink task");
    assert!(tx.is_closed());
}

#[tokio::test]
async fn influx_accepts_written_points() {
    let url = match std::env::var("INFLUX_TEST_URL") {
        Ok(value) => value,
        Err(_) => return,
    };
    let config = InfluxConfig {
        url,
        database: std::env::var("INFLUX_TEST_DB").unwrap_or_else(|_| "test".to_string()),
        ..InfluxConfig::default()
    };
    let publisher = Publisher::new_influx(config).expect("client");
    publisher.publish(&[inverter_point()]).await.expect("write");
}
