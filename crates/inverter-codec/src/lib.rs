use std::collections::BTreeSet;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;
use types::{DeviceParameters, InverterSnapshot, InverterStatus, InverterYield};

pub const FRAME_START: u8 = 0x21;
pub const FRAME_END: u8 = 0x0D;

/// Smallest response that can be complete; shorter runs ending in `FRAME_END`
/// are payload bytes.
pub const DEFAULT_MIN_RESPONSE_LEN: usize = 4;
pub const DATA_MIN_LEN: usize = 36;
pub const DATA_MAX_LEN: usize = 38;
pub const YIELD_LEN: usize = 12;
pub const PARAMETERS_LEN: usize = 71;

/// First three bytes of every status response.
pub const STATUS_MAGIC: [u8; 3] = [0x21, 0x27, 0x13];

/// Response the inverter sends when it accepted a new power limit.
pub const LIMIT_ACCEPTED: [u8; 5] = [0x21, 0x27, 0x10, 0x37, 0x0D];

pub const SUPPORTED_TYPES: [&str; 5] = ["250-45", "PV350W", "350-60", "350-90", "500-90"];

pub const ERROR_CODES: [&str; 27] = [
    "TEMP_SENSOR",
    "TEMP_HIGH",
    "IAC_CRITICAL",
    "UAC_HIGH",
    "UAC_HIGH_CRITICAL",
    "UAC_LOW_CRITICAL",
    "FREQUENCY_LOW",
    "FREQUENCY_HIGH",
    "EEPROM_CRC",
    "ATTINY_FREQ_LOW",
    "ATTINY_FREQ_HIGH",
    "ATTINY_UAC_LOW",
    "ATTINY_UAC_HIGH",
    "ATTINY_TIMEOUT",
    "HOST_TIMEOUT",
    "U_PV_HIGH",
    "EMERGENCY_STOP",
    "ISLAND_DETECTION",
    "RELAIS_ATTINY",
    "RELAIS_SAM7",
    "RELAIS_ATTINY",
    "AC_EMERGENCY_STOP",
    "ATTINY_IMPLAUSIBLY",
    "DC_POWER",
    "UAC_LOW",
    "RESTART_FORBIDDEN",
    "SURGE_TEST",
];

pub const STATE_CODES: [&str; 12] = [
    "READY_AC",
    "ENERGY_DC_OK",
    "MPP_INITIALIZED",
    "POWER_LIMIT_SET",
    "TRANSMIT",
    "CALIBRATE",
    "STORE_SETUP",
    "ATTINY_OK",
    "REGIONAL_LOCK",
    "ATTINY_PARAM_OK",
    "POWER_SORTAGE",
    "SYNC_AC",
];

pub const DISTURBANCE_CODES: [&str; 15] = [
    "PLL_LOW",
    "ADC_CONVERSION",
    "UDC_OVERFLOW",
    "UDC_LOW",
    "IAC_HIGH",
    "IAC_ZERO",
    "PI_HIGH",
    "PI_LOW",
    "ADC_LOW",
    "FREQU_1",
    "FREQU_2",
    "FREQU_3",
    "FREQU_4",
    "FREQU_5",
    "FREQU_6",
];

pub const POWER_LIMIT_SET: &str = "POWER_LIMIT_SET";

// Character ranges of the three bitfields in the hex-encoded status response.
const STATE_FIELD: (usize, usize) = (7, 14);
const ERROR_FIELD: (usize, usize) = (15, 22);
const DISTURBANCE_FIELD: (usize, usize) = (23, 30);

const FIXED_POINT_SCALE: f64 = 65_536.0;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("{frame} response has invalid length {actual}")]
    InvalidLength { frame: &'static str, actual: usize },
    #[error("frame does not start with 0x21")]
    MissingStart,
    #[error("frame does not end with 0x0d")]
    MissingTerminator,
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },
    #[error("unexpected status prefix {0}")]
    BadMagic(String),
    #[error("invalid hex field {0:?}")]
    InvalidHex(String),
    #[error("implausible reading: pv {pv_watts}W / ac {ac_watts}W for a {max_watt}W device")]
    ImplausibleReading {
        pv_watts: f64,
        ac_watts: f64,
        max_watt: f64,
    },
    #[error("limit {watt}W cannot be encoded")]
    InvalidLimit { watt: f64 },
    #[error("{0} field is not valid ascii")]
    InvalidText(&'static str),
}

/// Requests the controller sends to the inverter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Request {
    Data,
    Status,
    Yield,
    Parameters,
    SetLimit { watt: f64 },
}

impl Request {
    pub fn payload(&self) -> Result<Vec<u8>, CodecError> {
        match *self {
            Request::Data => Ok(vec![0x03, 0xED]),
            Request::Status => Ok(vec![0x03, 0xF0]),
            Request::Yield => Ok(vec![0x03, 0xFD]),
            Request::Parameters => Ok(vec![0x03, 0xF6]),
            Request::SetLimit { watt } => encode_set_limit(watt),
        }
    }

    /// Minimum accumulated length before a terminator ends the response.
    pub fn min_response_len(&self) -> usize {
        match self {
            Request::Data => DATA_MIN_LEN,
            _ => DEFAULT_MIN_RESPONSE_LEN,
        }
    }

    pub fn encode(&self, inverter_id: u16) -> Result<Vec<u8>, CodecError> {
        Ok(encode_frame(inverter_id, &self.payload()?))
    }
}

/// XOR over `inverter_id || payload`.
pub fn checksum(inverter_id: u16, payload: &[u8]) -> u16 {
    let seed = inverter_id.to_be_bytes().iter().fold(0u8, |acc, b| acc ^ b);
    u16::from(payload.iter().fold(seed, |acc, b| acc ^ b))
}

pub fn encode_frame(inverter_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 6);
    frame.push(FRAME_START);
    frame.extend_from_slice(&inverter_id.to_be_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&checksum(inverter_id, payload).to_be_bytes());
    frame.push(FRAME_END);
    frame
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub inverter_id: u16,
    pub payload: Vec<u8>,
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.len() < 6 {
        return Err(CodecError::InvalidLength {
            frame: "request",
            actual: bytes.len(),
        });
    }
    if bytes[0] != FRAME_START {
        return Err(CodecError::MissingStart);
    }
    if bytes[bytes.len() - 1] != FRAME_END {
        return Err(CodecError::MissingTerminator);
    }

    let inverter_id = u16::from_be_bytes([bytes[1], bytes[2]]);
    let crc_at = bytes.len() - 3;
    let payload = bytes[3..crc_at].to_vec();
    let actual = u16::from_be_bytes([bytes[crc_at], bytes[crc_at + 1]]);
    let expected = checksum(inverter_id, &payload);
    if actual != expected {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }

    Ok(Frame {
        inverter_id,
        payload,
    })
}

/// Collects response bytes until a terminator arrives at or beyond `min_len`.
#[derive(Debug, Clone)]
pub struct ResponseAccumulator {
    min_len: usize,
    buf: Vec<u8>,
}

impl ResponseAccumulator {
    pub fn new(min_len: usize) -> Self {
        Self {
            min_len,
            buf: Vec::with_capacity(min_len.max(DEFAULT_MIN_RESPONSE_LEN) + 2),
        }
    }

    /// Returns the complete response (terminator excluded) once it ends.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if byte == FRAME_END && self.buf.len() >= self.min_len {
            return Some(std::mem::take(&mut self.buf));
        }
        self.buf.push(byte);
        None
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

pub fn encode_value(value: f64) -> Option<u32> {
    let raw = (value * FIXED_POINT_SCALE).round();
    if !raw.is_finite() || raw < 0.0 || raw > f64::from(u32::MAX) {
        return None;
    }
    Some(raw as u32)
}

pub fn decode_value(raw: u32) -> f64 {
    (f64::from(raw) / FIXED_POINT_SCALE * 100.0).round() / 100.0
}

/// Empty fields decode to `None`.
pub fn decode_field(field: &[u8]) -> Option<f64> {
    let raw: [u8; 4] = field.try_into().ok()?;
    Some(decode_value(u32::from_be_bytes(raw)))
}

pub fn encode_set_limit(watt: f64) -> Result<Vec<u8>, CodecError> {
    let raw = encode_value(watt).ok_or(CodecError::InvalidLimit { watt })?;
    let mut payload = vec![0x03, 0xFE];
    payload.extend_from_slice(&raw.to_be_bytes());
    Ok(payload)
}

/// Matches the acknowledgement with or without its terminator.
pub fn is_limit_accepted(response: &[u8]) -> bool {
    response == LIMIT_ACCEPTED || response == &LIMIT_ACCEPTED[..LIMIT_ACCEPTED.len() - 1]
}

pub fn decode_data(
    bytes: &[u8],
    max_watt: f64,
    timestamp: DateTime<Utc>,
) -> Result<InverterSnapshot, CodecError> {
    if !(DATA_MIN_LEN..=DATA_MAX_LEN).contains(&bytes.len()) {
        return Err(CodecError::InvalidLength {
            frame: "data",
            actual: bytes.len(),
        });
    }

    // 3 header bytes, eight u32 registers, one pad byte.
    let register = |index: usize| {
        let start = 3 + index * 4;
        decode_field(&bytes[start..start + 4]).unwrap_or_default()
    };

    let mut snapshot = InverterSnapshot {
        pv_amps: register(2),
        pv_volts: register(3),
        ac_watts: register(4),
        pv_watts: register(5),
        temperature_c: register(6),
        timestamp,
    };

    if snapshot.pv_watts > max_watt * 2.0 || snapshot.ac_watts > max_watt * 2.0 {
        return Err(CodecError::ImplausibleReading {
            pv_watts: snapshot.pv_watts,
            ac_watts: snapshot.ac_watts,
            max_watt,
        });
    }
    if snapshot.temperature_c > 1000.0 {
        warn!(temperature = snapshot.temperature_c, "temperature sensor fault");
        snapshot.temperature_c = 0.0;
    }

    Ok(snapshot)
}

pub fn decode_status(bytes: &[u8]) -> Result<InverterStatus, CodecError> {
    let hex = to_hex(bytes);
    if !bytes.starts_with(&STATUS_MAGIC) {
        return Err(CodecError::BadMagic(hex.chars().take(6).collect()));
    }

    let field = |(start, end): (usize, usize)| hex.get(start..end).unwrap_or_default();

    let states = decode_bits(field(STATE_FIELD), &STATE_CODES)?;
    let errors = match field(ERROR_FIELD) {
        "" => BTreeSet::new(),
        value => decode_bits(value, &ERROR_CODES)?,
    };
    let disturbances = match field(DISTURBANCE_FIELD) {
        "" => BTreeSet::new(),
        value => decode_bits(value, &DISTURBANCE_CODES)?,
    };

    Ok(InverterStatus {
        states,
        errors,
        disturbances,
    })
}

/// Bit `i` (0 = least significant) set means `table[i]` is present.
pub fn decode_bits(
    hex: &str,
    table: &[&'static str],
) -> Result<BTreeSet<&'static str>, CodecError> {
    let value =
        u64::from_str_radix(hex, 16).map_err(|_| CodecError::InvalidHex(hex.to_string()))?;

    let codes = table
        .iter()
        .enumerate()
        .filter(|(bit, _)| value >> bit & 1 == 1)
        .map(|(_, code)| *code)
        .collect();

    if table.len() < 64 && value >> table.len() != 0 {
        warn!(field = hex, "status bits beyond the code table");
    }

    Ok(codes)
}

pub fn decode_yield(bytes: &[u8]) -> Result<InverterYield, CodecError> {
    if bytes.len() != YIELD_LEN {
        return Err(CodecError::InvalidLength {
            frame: "yield",
            actual: bytes.len(),
        });
    }

    Ok(InverterYield {
        watt: decode_field(&bytes[3..7]).unwrap_or_default(),
        watt_hours: decode_field(&bytes[7..11]).unwrap_or_default(),
    })
}

pub fn decode_device_parameters(bytes: &[u8]) -> Result<DeviceParameters, CodecError> {
    if bytes.len() < PARAMETERS_LEN {
        return Err(CodecError::InvalidLength {
            frame: "device parameters",
            actual: bytes.len(),
        });
    }

    // 7 header bytes, 6 byte type, 38 byte gap, 16 byte version, u32 max watt.
    let device_type = ascii_field(&bytes[7..13], "type")?;
    let firmware_version = ascii_field(&bytes[51..67], "version")?;
    let max_watt = decode_field(&bytes[67..71]).unwrap_or_default();

    Ok(DeviceParameters {
        device_type,
        max_watt,
        firmware_version,
    })
}

pub fn is_supported_type(device_type: &str) -> bool {
    SUPPORTED_TYPES.contains(&device_type)
}

fn ascii_field(bytes: &[u8], name: &'static str) -> Result<String, CodecError> {
    if !bytes.is_ascii() {
        return Err(CodecError::InvalidText(name));
    }
    let text = String::from_utf8_lossy(bytes);
    Ok(text.trim_end_matches(['\0', ' ']).to_string())
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
