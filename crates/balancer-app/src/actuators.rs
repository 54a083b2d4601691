//! Thin adapters for the hardware the control loops switch.
//!
//! The loops only see the [`Relay`], [`SwitchedLoad`] and [`PwmOutput`]
//! traits; the sysfs and HTTP implementations live here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected value {value:?} in {path}")]
    Parse { path: PathBuf, value: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("smart plug answered without {0}")]
    MissingField(&'static str),
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
}

/// Binary output with read-back, e.g. the inverter's AC relay.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn set(&self, on: bool) -> Result<(), ActuatorError>;

    async fn is_on(&self) -> Result<bool, ActuatorError>;
}

/// A switchable consumer that reports its present draw.
#[async_trait]
pub trait SwitchedLoad: Send + Sync {
    async fn set(&self, on: bool) -> Result<(), ActuatorError>;

    async fn is_on(&self) -> Result<bool, ActuatorError>;

    async fn power_watt(&self) -> Result<f64, ActuatorError>;
}

/// Continuous control voltage for the charger.
#[async_trait]
pub trait PwmOutput: Send + Sync {
    async fn set_volt(&self, volt: f64) -> Result<(), ActuatorError>;

    async fn volt(&self) -> Result<f64, ActuatorError>;
}

async fn write_file(path: &Path, value: &str) -> Result<(), ActuatorError> {
    tokio::fs::write(path, value)
        .await
        .map_err(|source| ActuatorError::Io {
            path: path.to_path_buf(),
            source,
        })
}

async fn read_file(path: &Path) -> Result<String, ActuatorError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ActuatorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(content.trim().to_string())
}

/// A GPIO pin driven through `/sys/class/gpio`.
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    pin_dir: PathBuf,
}

impl SysfsGpio {
    /// Exports the pin if needed and configures it as an output.
    pub async fn open(base_dir: impl AsRef<Path>, pin: u32) -> Result<Self, ActuatorError> {
        let base_dir = base_dir.as_ref();
        let pin_dir = base_dir.join(format!("gpio{pin}"));
        if !tokio::fs::metadata(&pin_dir).await.is_ok_and(|meta| meta.is_dir()) {
            write_file(&base_dir.join("export"), &format!("{pin}\n")).await?;
        }
        write_file(&pin_dir.join("direction"), "out\n").await?;
        debug!(pin, "gpio configured as output");
        Ok(Self { pin_dir })
    }
}

#[async_trait]
impl Relay for SysfsGpio {
    async fn set(&self, on: bool) -> Result<(), ActuatorError> {
        write_file(&self.pin_dir.join("value"), if on { "1\n" } else { "0\n" }).await
    }

    async fn is_on(&self) -> Result<bool, ActuatorError> {
        let path = self.pin_dir.join("value");
        match read_file(&path).await?.as_str() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(ActuatorError::Parse {
                path,
                value: other.to_string(),
            }),
        }
    }
}

pub const PWM_PERIOD_NS: u32 = 100_000;
pub const PWM_MAX_VOLT: f64 = 3.33;
const PWM_FULL_SCALE_DUTY: f64 = 98_140.0;

/// A PWM channel under `/sys/class/pwm/pwmchipN`.
#[derive(Debug, Clone)]
pub struct SysfsPwm {
    channel_dir: PathBuf,
}

impl SysfsPwm {
    /// Exports `channel` on `chip_dir`, sets the period and enables it.
    pub async fn open(chip_dir: impl AsRef<Path>, channel: u32) -> Result<Self, ActuatorError> {
        let chip_dir = chip_dir.as_ref();
        let channel_dir = chip_dir.join(format!("pwm{channel}"));
        if !tokio::fs::metadata(&channel_dir).await.is_ok_and(|meta| meta.is_dir()) {
            write_file(&chip_dir.join("export"), &format!("{channel}\n")).await?;
        }
        write_file(&channel_dir.join("period"), &format!("{PWM_PERIOD_NS}\n")).await?;
        write_file(&channel_dir.join("enable"), "1\n").await?;
        write_file(&channel_dir.join("polarity"), "normal\n").await?;
        Ok(Self { channel_dir })
    }
}

pub fn volt_to_duty(volt: f64) -> u32 {
    let volt = volt.clamp(0.0, PWM_MAX_VOLT);
    (PWM_FULL_SCALE_DUTY / PWM_MAX_VOLT * volt) as u32
}

pub fn duty_to_volt(duty: u32) -> f64 {
    let volt = PWM_MAX_VOLT / PWM_FULL_SCALE_DUTY * f64::from(duty);
    (volt * 100.0).round() / 100.0
}

#[async_trait]
impl PwmOutput for SysfsPwm {
    async fn set_volt(&self, volt: f64) -> Result<(), ActuatorError> {
        if volt > PWM_MAX_VOLT {
            warn!(volt, max = PWM_MAX_VOLT, "pwm voltage above maximum, clamping");
        }
        let duty = volt_to_duty(volt);
        debug!(volt, duty, "pwm duty cycle");
        write_file(&self.channel_dir.join("duty_cycle"), &format!("{duty}\n")).await
    }

    async fn volt(&self) -> Result<f64, ActuatorError> {
        let path = self.channel_dir.join("duty_cycle");
        let value = read_file(&path).await?;
        let duty = value
            .parse::<u32>()
            .map_err(|_| ActuatorError::Parse { path, value })?;
        Ok(duty_to_volt(duty))
    }
}

#[derive(Debug, Clone)]
pub struct EdimaxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout_ms: u64,
}

impl Default for EdimaxConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.50".to_string(),
            port: 10_000,
            username: "admin".to_string(),
            password: "1234".to_string(),
            timeout_ms: 5_000,
        }
    }
}

const STATE_TAG: &str = "Device.System.Power.State";
const POWER_TAG: &str = "Device.System.Power.NowPower";

/// Smart plug speaking the Edimax XML command protocol.
#[derive(Debug, Clone)]
pub struct EdimaxPlug {
    client: reqwest::Client,
    url: String,
    username: String,
    password: String,
}

impl EdimaxPlug {
    pub fn new(config: EdimaxConfig) -> Result<Self, ActuatorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: format!("http://{}:{}/smartplug.cgi", config.host, config.port),
            username: config.username,
            password: config.password,
        })
    }

    async fn command(&self, body: String) -> Result<String, ActuatorError> {
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

pub fn edimax_request(command: &str, inner: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF8\"?>\
         <SMARTPLUG id=\"edimax\"><CMD id=\"{command}\">{inner}</CMD></SMARTPLUG>"
    )
}

/// Text content of the first `tag` element in an Edimax response.
pub fn edimax_field(xml: &str, tag: &'static str) -> Result<String, ActuatorError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut inside = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref event) if event.name().as_ref() == tag.as_bytes() => inside = true,
            Event::Text(ref text) if inside => {
                return Ok(text.unescape()?.into_owned());
            }
            Event::End(_) if inside => return Err(ActuatorError::MissingField(tag)),
            Event::Eof => return Err(ActuatorError::MissingField(tag)),
            _ => {}
        }
        buf.clear();
    }
}

#[async_trait]
impl SwitchedLoad for EdimaxPlug {
    async fn set(&self, on: bool) -> Result<(), ActuatorError> {
        let state = if on { "ON" } else { "OFF" };
        let inner = format!("<{STATE_TAG}>{state}</{STATE_TAG}>");
        self.command(edimax_request("setup", &inner)).await?;
        Ok(())
    }

    async fn is_on(&self) -> Result<bool, ActuatorError> {
        let inner = format!("<{STATE_TAG}></{STATE_TAG}>");
        let response = self.command(edimax_request("get", &inner)).await?;
        Ok(edimax_field(&response, STATE_TAG)? == "ON")
    }

    async fn power_watt(&self) -> Result<f64, ActuatorError> {
        let inner = format!("<NOW_POWER><{POWER_TAG}></{POWER_TAG}></NOW_POWER>");
        let response = self.command(edimax_request("get", &inner)).await?;
        let value = edimax_field(&response, POWER_TAG)?;
        value.trim().parse::<f64>().map_err(|_| ActuatorError::Parse {
            path: PathBuf::from(POWER_TAG),
            value,
        })
    }
}
