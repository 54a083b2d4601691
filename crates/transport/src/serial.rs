use std::time::Duration;

use async_trait::async_trait;
use inverter_codec::ResponseAccumulator;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialStream, StopBits};
use tracing::{debug, warn};

use crate::{retry_delay_ms, FrameTransport, TransportError};

const MAX_RESPONSE_LEN: usize = 256;

/// Connection settings for the inverter's RS485 line.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    /// Longest silence tolerated between two response bytes.
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Number of retries per exchange after the initial attempt.
    pub retry_count: usize,
    pub retry_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 9_600,
            read_timeout_ms: 2_000,
            write_timeout_ms: 2_000,
            retry_count: 0,
            retry_backoff_ms: 200,
            retry_max_backoff_ms: 2_000,
        }
    }
}

pub struct SerialTransport {
    config: SerialConfig,
    port: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self { config, port: None }
    }

    async fn exchange_once(
        &mut self,
        request: &[u8],
        min_response_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let read_timeout_ms = self.config.read_timeout_ms;
        let write_timeout_ms = self.config.write_timeout_ms;
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;

        port.clear(tokio_serial::ClearBuffer::All)?;
        timeout(Duration::from_millis(write_timeout_ms), port.write_all(request))
            .await
            .map_err(|_| TransportError::Timeout {
                timeout_ms: write_timeout_ms,
            })??;

        let mut acc = ResponseAccumulator::new(min_response_len);
        let mut byte = [0u8; 1];
        loop {
            let read = timeout(Duration::from_millis(read_timeout_ms), port.read(&mut byte))
                .await
                .map_err(|_| TransportError::Timeout {
                    timeout_ms: read_timeout_ms,
                })??;
            if read == 0 {
                return Err(TransportError::Incomplete);
            }
            if let Some(response) = acc.push(byte[0]) {
                return Ok(response);
            }
            if acc.len() > MAX_RESPONSE_LEN {
                return Err(TransportError::Overflow(MAX_RESPONSE_LEN));
            }
        }
    }
}

#[async_trait]
impl FrameTransport for SerialTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let builder = tokio_serial::new(&self.config.device, self.config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(self.config.read_timeout_ms));
        let port = SerialStream::open(&builder)?;
        debug!(device = %self.config.device, baud = self.config.baud_rate, "serial port open");
        self.port = Some(port);
        Ok(())
    }

    async fn exchange(
        &mut self,
        request: &[u8],
        min_response_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut attempts = 0usize;

        loop {
            match self.exchange_once(request, min_response_len).await {
                Ok(response) => return Ok(response),
                Err(TransportError::NotOpen) => return Err(TransportError::NotOpen),
                Err(err) => {
                    warn!(device = %self.config.device, attempt = attempts, error = %err, "serial exchange failed");
                    if attempts >= self.config.retry_count {
                        return Err(err);
                    }
                }
            }

            let delay_ms = retry_delay_ms(
                self.config.retry_backoff_ms,
                self.config.retry_max_backoff_ms,
                attempts,
            );
            attempts += 1;
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(device = %self.config.device, "serial port closed");
        }
    }

    fn endpoint(&self) -> String {
        self.config.device.clone()
    }
}
