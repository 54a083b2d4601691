//! Decoder for the energy meter's multicast datagrams.
//!
//! The meter broadcasts one datagram per second. Each carries a sum block and
//! three per-phase blocks of big-endian counters. Datagrams that are too short
//! are foreign or truncated and decode to `None`.

use std::ops::Range;

use chrono::{DateTime, Utc};
use tracing::debug;
use types::{EnergyCounters, MeterSnapshot, PowerBlock};

/// Shortest datagram that carries sum and phase data.
pub const MIN_DATAGRAM_LEN: usize = 558;
pub const MAX_DATAGRAM_LEN: usize = 600;

const SERIAL_NUMBER: Range<usize> = 20..24;
const SUM_BLOCK: Range<usize> = 32..156;
const PHASE_BLOCKS: [Range<usize>; 3] = [160..300, 304..444, 448..588];
const PHASE_BLOCK_LEN: usize = 140;

// Each power value is followed by its energy counter, 20 bytes per pair.
const POWER_STRIDE: usize = 20;
const COUNTER_OFFSET: usize = 8;
const POWER_FIELDS_LEN: usize = 116;
const QUALITY_OFFSET: usize = 120;

const POWER_SCALE: f64 = 10.0;
const COUNTER_SCALE: f64 = 3_600_000.0;
const MILLI_SCALE: f64 = 1_000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    pub phases: bool,
    pub counters: bool,
}

pub fn serial_number(datagram: &[u8]) -> Option<u32> {
    datagram.get(SERIAL_NUMBER).map(read_u32)
}

pub fn decode_datagram(
    datagram: &[u8],
    options: DecodeOptions,
    timestamp: DateTime<Utc>,
) -> Option<MeterSnapshot> {
    if datagram.len() < MIN_DATAGRAM_LEN {
        debug!(len = datagram.len(), "ignoring short datagram");
        return None;
    }

    let serial_number = serial_number(datagram)?;
    let total = decode_block(&datagram[SUM_BLOCK], options.counters)?;

    let phases = if options.phases {
        decode_phases(datagram, options.counters)
    } else {
        None
    };

    Some(MeterSnapshot {
        serial_number,
        total,
        phases,
        timestamp,
    })
}

fn decode_phases(datagram: &[u8], counters: bool) -> Option<[PowerBlock; 3]> {
    let [l1, l2, l3] = PHASE_BLOCKS;
    let phases = [
        decode_block(datagram.get(l1)?, counters)?,
        decode_block(datagram.get(l2)?, counters)?,
        decode_block(datagram.get(l3)?, counters)?,
    ];
    Some(phases)
}

/// Decodes a sum block (124 bytes) or a phase block (140 bytes).
pub fn decode_block(block: &[u8], counters: bool) -> Option<PowerBlock> {
    if block.len() < POWER_FIELDS_LEN + 8 {
        return None;
    }

    let power = |index: usize| f64::from(read_u32(&block[index * POWER_STRIDE..])) / POWER_SCALE;
    let counter = |index: usize| {
        let start = index * POWER_STRIDE + COUNTER_OFFSET;
        read_u64(&block[start..start + 8]) as f64 / COUNTER_SCALE
    };

    let mut quality_at = QUALITY_OFFSET;
    let (thd, voltage) = if block.len() == PHASE_BLOCK_LEN {
        let thd = f64::from(read_u32(&block[quality_at..])) / MILLI_SCALE;
        let voltage = f64::from(read_u32(&block[quality_at + 8..])) / MILLI_SCALE;
        quality_at += 16;
        (Some(thd), Some(voltage))
    } else {
        (None, None)
    };
    let power_factor = f64::from(read_u32(block.get(quality_at..quality_at + 4)?)) / MILLI_SCALE;

    Some(PowerBlock {
        active_import_w: power(0),
        active_export_w: power(1),
        reactive_import_var: power(2),
        reactive_export_var: power(3),
        apparent_import_va: power(4),
        apparent_export_va: power(5),
        power_factor,
        thd,
        voltage,
        counters: counters.then(|| EnergyCounters {
            active_import_kwh: counter(0),
            active_export_kwh: counter(1),
            reactive_import_kvarh: counter(2),
            reactive_export_kvarh: counter(3),
            apparent_import_kvah: counter(4),
            apparent_export_kvah: counter(5),
        }),
    })
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(raw)
}
