use async_trait::async_trait;
use chrono::Utc;
use meter_codec::{decode_datagram, serial_number, DecodeOptions};
use tracing::{debug, info};
use transport::DatagramSource;
use types::{MeterCommand, MeterSnapshot};

use crate::{Device, DeviceError};

#[derive(Debug, Clone, Default)]
pub struct MeterDeviceConfig {
    /// Only datagrams from this meter are accepted when set.
    pub serial_number: Option<u32>,
    pub options: DecodeOptions,
}

/// The grid energy meter listening on its multicast group.
pub struct MeterDevice<S> {
    source: S,
    config: MeterDeviceConfig,
}

impl<S: DatagramSource> MeterDevice<S> {
    pub fn new(source: S, config: MeterDeviceConfig) -> Self {
        Self { source, config }
    }
}

#[async_trait]
impl<S: DatagramSource + 'static> Device for MeterDevice<S> {
    type Snapshot = MeterSnapshot;
    type Command = MeterCommand;

    fn name(&self) -> String {
        match self.config.serial_number {
            Some(serial) => format!("meter-{serial}"),
            None => "meter".to_string(),
        }
    }

    async fn connect(&mut self) -> Result<(), DeviceError> {
        self.source.open().await?;
        info!(serial_number = ?self.config.serial_number, "listening for meter datagrams");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.source.close().await;
    }

    async fn execute(&mut self, command: &MeterCommand) -> Result<(), DeviceError> {
        match *command {}
    }

    /// Waits for one datagram, then drains whatever else is already queued
    /// and returns the newest reading from the configured meter.
    async fn read(&mut self) -> Result<Option<MeterSnapshot>, DeviceError> {
        let first = self.source.recv().await?;
        let mut newest = self.accept(&first);

        let mut drained = 0usize;
        while let Some(datagram) = self.source.try_recv()? {
            drained += 1;
            if let Some(snapshot) = self.accept(&datagram) {
                newest = Some(snapshot);
            }
        }
        if drained > 0 {
            debug!(drained, "skipped backlogged datagrams");
        }

        Ok(newest)
    }
}

impl<S> MeterDevice<S> {
    fn accept(&self, datagram: &[u8]) -> Option<MeterSnapshot> {
        if let Some(expected) = self.config.serial_number {
            let actual = serial_number(datagram);
            if actual != Some(expected) {
                debug!(expected, ?actual, "datagram from another meter");
                return None;
            }
        }
        decode_datagram(datagram, self.config.options, Utc::now())
    }
}
