use std::cmp::min;

use async_trait::async_trait;
use thiserror::Error;

mod multicast;
mod serial;

pub use multicast::{MulticastConfig, MulticastReceiver};
pub use serial::{SerialConfig, SerialTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("transport is not open")]
    NotOpen,
    #[error("device stopped sending before the response was complete")]
    Incomplete,
    #[error("response exceeded {0} bytes without a terminator")]
    Overflow(usize),
}

/// A request/response byte channel with one exchange in flight at a time.
#[async_trait]
pub trait FrameTransport: Send {
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Writes `request` and reads the terminated response, terminator excluded.
    async fn exchange(
        &mut self,
        request: &[u8],
        min_response_len: usize,
    ) -> Result<Vec<u8>, TransportError>;

    async fn close(&mut self);

    /// Human readable endpoint, used as a telemetry tag.
    fn endpoint(&self) -> String;
}

/// A receive-only datagram channel.
#[async_trait]
pub trait DatagramSource: Send {
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Waits for the next datagram.
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Returns an already queued datagram without waiting.
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    async fn close(&mut self);
}

/// Exponential backoff capped at `max_ms`.
pub fn retry_delay_ms(base_ms: u64, max_ms: u64, attempt: usize) -> u64 {
    let base = base_ms.max(1);
    let shift = u32::try_from(attempt).unwrap_or(u32::MAX);
    let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let delay = base.saturating_mul(factor);
    min(delay, max_ms.max(base))
}
