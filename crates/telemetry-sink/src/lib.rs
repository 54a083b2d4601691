use std::fmt::Write as _;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use types::TelemetryPoint;

/// InfluxDB 1.x write endpoint.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub database: String,
    pub timeout_ms: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            database: "solar".to_string(),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("influx rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone)]
struct InfluxTarget {
    client: reqwest::Client,
    write_url: String,
    database: String,
}

/// Writes telemetry points. Without a target points are only logged.
#[derive(Debug, Clone)]
pub struct Publisher {
    target: Option<InfluxTarget>,
}

impl Publisher {
    pub fn new_log() -> Self {
        Self { target: None }
    }

    pub fn new_influx(config: InfluxConfig) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        let write_url = format!("{}/write", config.url.trim_end_matches('/'));
        Ok(Self {
            target: Some(InfluxTarget {
                client,
                write_url,
                database: config.database,
            }),
        })
    }

    pub fn is_remote(&self) -> bool {
        self.target.is_some()
    }

    pub async fn publish(&self, points: &[TelemetryPoint]) -> Result<(), PublishError> {
        let body = serialize(points);
        if body.is_empty() {
            return Ok(());
        }

        match &self.target {
            Some(target) => {
                let response = target
                    .client
                    .post(&target.write_url)
                    .query(&[("db", target.database.as_str()), ("precision", "ns")])
                    .body(body)
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(PublishError::Rejected {
                        status: status.as_u16(),
                        body,
                    });
                }
                debug!(points = points.len(), "telemetry written");
                Ok(())
            }
            None => {
                for line in body.lines() {
                    info!(target: "telemetry", "{line}");
                }
                Ok(())
            }
        }
    }
}

/// Encodes points as InfluxDB line protocol, one line per point.
///
/// Points without a finite field value are skipped.
pub fn serialize(points: &[TelemetryPoint]) -> String {
    let mut out = String::new();
    for point in points {
        if let Some(line) = to_line(point) {
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

pub fn to_line(point: &TelemetryPoint) -> Option<String> {
    let fields: Vec<String> = point
        .fields
        .iter()
        .filter(|(_, value)| value.is_finite())
        .map(|(key, value)| format!("{}={}", escape_key(key), value))
        .collect();
    if fields.is_empty() {
        return None;
    }

    let mut line = escape_measurement(&point.measurement);
    for (key, value) in &point.tags {
        if value.is_empty() {
            continue;
        }
        let _ = write!(line, ",{}={}", escape_key(key), escape_key(value));
    }
    line.push(' ');
    line.push_str(&fields.join(","));
    if let Some(nanos) = point.time.timestamp_nanos_opt() {
        let _ = write!(line, " {nanos}");
    }
    Some(line)
}

fn escape_measurement(value: &str) -> String {
    value.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Drains the telemetry channel into `publisher` in batches of at most
/// `batch_size` points until the channel closes or shutdown is signalled.
pub async fn sink_task(
    mut rx: mpsc::Receiver<TelemetryPoint>,
    publisher: Publisher,
    mut shutdown: watch::Receiver<bool>,
    batch_size: usize,
) {
    let batch_size = batch_size.max(1);
    loop {
        tokio::select! {
            maybe_point = rx.recv() => {
                match maybe_point {
                    Some(point) => {
                        let mut batch = vec![point];
                        while batch.len() < batch_size {
                            match rx.try_recv() {
                                Ok(point) => batch.push(point),
                                Err(_) => break,
                            }
                        }
                        flush(&publisher, &batch).await;
                    }
                    None => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let mut batch = Vec::new();
                    while let Ok(point) = rx.try_recv() {
                        batch.push(point);
                    }
                    flush(&publisher, &batch).await;
                    break;
                }
            }
        }
    }
    info!("telemetry sink stopped");
}

async fn flush(publisher: &Publisher, batch: &[TelemetryPoint]) {
    if batch.is_empty() {
        return;
    }
    if let Err(err) = publisher.publish(batch).await {
        warn!(error = %err, points = batch.len(), "telemetry write failed");
    }
}
