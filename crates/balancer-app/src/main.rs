use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use balancer_app::actuators::{EdimaxPlug, SysfsGpio, SysfsPwm};
use balancer_app::liveness::SystemdNotifier;
use balancer_app::{BalancerConfig, ChargeController, ControlLoop};
use device_worker::{InverterDevice, InverterDeviceConfig, MeterDevice, MeterDeviceConfig};
use telemetry_sink::{sink_task, Publisher};
use transport::{MulticastReceiver, SerialTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Inverter,
    Charger,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mode = parse_mode_arg()?;
    let config_path = parse_config_arg();
    let config = BalancerConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(listen) = config.telemetry.prometheus_listen {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(listen)
            .install()
            .context("prometheus exporter init failed")?;
        info!(%listen, "prometheus exporter listening");
    }

    let publisher = match config.telemetry.influx.clone() {
        Some(influx) => Publisher::new_influx(influx).context("influx publisher init failed")?,
        None => Publisher::new_log(),
    };
    let (telemetry_tx, telemetry_rx) = mpsc::channel(config.telemetry.channel_capacity);
    let sink_handle = tokio::spawn(sink_task(
        telemetry_rx,
        publisher,
        shutdown_rx.clone(),
        config.telemetry.batch_size,
    ));

    let mut worker_handles = Vec::new();
    let mut meter_worker_config = config.worker.clone();
    meter_worker_config.poll_interval = config.meter.poll_interval;
    let meter_device = MeterDevice::new(
        MulticastReceiver::new(config.meter.multicast.clone()),
        MeterDeviceConfig {
            serial_number: config.meter.serial_number,
            options: config.meter.options,
        },
    );
    let (meter, meter_join) = device_worker::spawn(meter_device, meter_worker_config, None);
    worker_handles.push(meter_join);

    let loop_handle = match mode {
        Mode::Inverter => {
            let (inverter_device, runtime) = InverterDevice::new(
                SerialTransport::new(config.inverter.serial.clone()),
                InverterDeviceConfig {
                    inverter_id: config.inverter.inverter_id,
                    max_increase_watt: config.inverter.max_increase_watt,
                },
            );
            let (inverter, inverter_join) = device_worker::spawn(
                inverter_device,
                config.worker.clone(),
                Some(telemetry_tx.clone()),
            );
            worker_handles.push(inverter_join);

            let relay = SysfsGpio::open(&config.inverter.gpio_base, config.inverter.relay_pin)
                .await
                .context("relay gpio init failed")?;
            let load = EdimaxPlug::new(config.load.clone()).context("smart plug init failed")?;

            let control = ControlLoop::new(
                &config,
                meter,
                inverter,
                runtime,
                Arc::new(relay),
                Arc::new(load),
            )
            .with_liveness(Arc::new(SystemdNotifier))
            .with_telemetry(telemetry_tx.clone());
            tokio::spawn(control.run(shutdown_rx.clone()))
        }
        Mode::Charger => {
            let pwm = SysfsPwm::open(&config.charger.pwm_chip, config.charger.pwm_channel)
                .await
                .context("pwm init failed")?;
            let plug = EdimaxPlug::new(config.load.clone()).context("smart plug init failed")?;

            let controller = ChargeController::new(&config, meter, Arc::new(plug), Arc::new(pwm))
                .with_liveness(Arc::new(SystemdNotifier))
                .with_telemetry(telemetry_tx.clone());
            tokio::spawn(controller.run(shutdown_rx.clone()))
        }
    };
    drop(telemetry_tx);
    info!(?mode, "balancer running");

    wait_for_shutdown().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    join_logged("control loop", loop_handle).await;
    for handle in worker_handles {
        join_logged("device worker", handle).await;
    }
    join_logged("telemetry sink", sink_handle).await;
    Ok(())
}

async fn join_logged(task: &'static str, handle: JoinHandle<()>) {
    if let Err(err) = handle.await {
        warn!(task, error = %err, "task join failed");
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "SIGTERM handler install failed");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

fn parse_config_arg() -> Option<String> {
    parse_arg("--config")
}

fn parse_mode_arg() -> Result<Mode> {
    match parse_arg("--mode").as_deref() {
        None | Some("inverter") => Ok(Mode::Inverter),
        Some("charger") => Ok(Mode::Charger),
        Some(other) => anyhow::bail!("unknown --mode {other:?}, expected inverter or charger"),
    }
}

fn parse_arg(name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == name {
            return args.next();
        }
        if let Some(value) = arg.strip_prefix(prefix.as_str()) {
            return Some(value.to_string());
        }
    }
    None
}
