//! Microcontroller telemetry link.
//!
//! The jet microcontroller streams one comma-separated ASCII record per line:
//! 15 numeric fields followed by a decimal CRC-8/SMBUS checksum of everything
//! before the last comma. The same serial port accepts setpoint commands, so
//! [`SerialTelemetry`] implements both [`TelemetrySource`] and [`Actuator`].
//!
//! Reading a valid record is bounded by a [`TelemetryPolicy`]: every bad
//! checksum, malformed line or transport error consumes one attempt, and the
//! whole read is cut off once the time budget is spent. Exhaustion is reported
//! as [`DaqError::TelemetryExhausted`], which the facade turns into an
//! unavailable reading.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use crc::{Crc, CRC_8_SMBUS};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AppResult, DaqError, DriverError, DriverErrorKind};
use crate::hardware::capabilities::{Actuator, TelemetrySource};
use crate::hardware::readings::{EmbeddedReading, Position, Setpoints};

/// Numeric fields in a telemetry record, excluding the checksum.
pub const FIELD_COUNT: usize = 15;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

const DRIVER: &str = "serial_telemetry";

/// Bounds on a single telemetry read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryPolicy {
    /// Lines to try before giving up.
    pub max_attempts: u32,
    /// Wall-clock budget for the whole read.
    pub time_budget: Duration,
}

impl Default for TelemetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            time_budget: Duration::from_millis(500),
        }
    }
}

// =============================================================================
// Line format
// =============================================================================

/// CRC-8/SMBUS of a record payload.
pub fn checksum(payload: &[u8]) -> u8 {
    CRC8.checksum(payload)
}

/// True if the line's trailing checksum matches its payload.
pub fn is_line_valid(line: &str) -> bool {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some((payload, crc)) = line.rsplit_once(',') else {
        return false;
    };
    match crc.trim().parse::<u8>() {
        Ok(expected) => checksum(payload.as_bytes()) == expected,
        Err(_) => false,
    }
}

/// Render a record with its checksum, as the microcontroller does.
pub fn encode_line(fields: &[f64; FIELD_COUNT]) -> String {
    let payload = fields
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let crc = checksum(payload.as_bytes());
    format!("{payload},{crc}")
}

/// Validate and decode one record.
pub fn decode_line(line: &str) -> Result<EmbeddedReading> {
    if !is_line_valid(line) {
        bail!("checksum mismatch");
    }
    let line = line.trim_end_matches(['\r', '\n']);
    let payload = line
        .rsplit_once(',')
        .map(|(payload, _)| payload)
        .unwrap_or_default();

    let fields = payload
        .split(',')
        .map(|f| f.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .context("non-numeric telemetry field")?;
    if fields.len() < FIELD_COUNT {
        bail!(
            "telemetry record has {} fields, expected {}",
            fields.len(),
            FIELD_COUNT
        );
    }

    // field 12 is the secondary gas flow, which is not recorded
    Ok(EmbeddedReading {
        timestamp_ms: fields[0],
        setpoints: Setpoints {
            voltage: fields[1],
            frequency: fields[2],
            flow: fields[3],
        },
        position: Position {
            x: fields[10],
            y: fields[11],
            z: fields[4],
        },
        duty_cycle: fields[5],
        intensity: fields[6],
        voltage: fields[7],
        temperature: fields[8],
        current: fields[9],
        power_setpoint: fields[13],
        power: fields[14],
    })
}

/// Setpoint command sent to the microcontroller.
pub fn actuation_command(power: f64, flow: f64, duty_cycle: f64) -> String {
    format!("P{power:.2};Q{flow:.2};D{duty_cycle:.2}\n")
}

/// Read lines until one decodes, within `policy`.
pub async fn read_embedded(
    source: &dyn TelemetrySource,
    policy: &TelemetryPolicy,
) -> AppResult<EmbeddedReading> {
    let started = Instant::now();
    let deadline = started + policy.time_budget;
    let mut attempts = 0;

    while attempts < policy.max_attempts {
        attempts += 1;
        let line = match tokio::time::timeout_at(deadline, source.read_line()).await {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                warn!(attempt = attempts, error = %e, "Telemetry read failed");
                continue;
            }
            Err(_) => break,
        };
        match decode_line(&line) {
            Ok(reading) => {
                debug!(attempt = attempts, "Telemetry line accepted");
                return Ok(reading);
            }
            Err(e) => warn!(attempt = attempts, error = %e, line = %line.trim_end(), "Invalid telemetry line"),
        }
    }

    Err(DaqError::TelemetryExhausted {
        attempts,
        elapsed: started.elapsed(),
    })
}

// =============================================================================
// Serial transport
// =============================================================================

/// Byte stream usable as the microcontroller port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}
type DynSerial = Box<dyn SerialPortIO>;
// `Lines::next_line` keeps a partial line across a cancelled read.
type SharedPort = Arc<Mutex<Lines<BufReader<DynSerial>>>>;

/// Telemetry and actuation over one serial link.
#[derive(Clone)]
pub struct SerialTelemetry {
    port: SharedPort,
}

impl SerialTelemetry {
    /// Wrap an already-open byte stream.
    pub fn new(io: impl SerialPortIO + 'static) -> Self {
        let io: DynSerial = Box::new(io);
        Self {
            port: Arc::new(Mutex::new(BufReader::new(io).lines())),
        }
    }

    /// Open a serial port with 8N1 framing.
    #[cfg(feature = "tokio_serial")]
    pub async fn open(port_path: &str, baud_rate: u32) -> Result<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let port_path_owned = port_path.to_string();
        let port = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&port_path_owned, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .context(format!(
                    "Failed to open telemetry serial port: {}",
                    port_path_owned
                ))
        })
        .await
        .context("spawn_blocking for telemetry port opening failed")??;

        tracing::info!(port = port_path, baud_rate, "Opened telemetry serial port");
        Ok(Self::new(port))
    }
}

#[async_trait]
impl TelemetrySource for SerialTelemetry {
    async fn read_line(&self) -> Result<String> {
        let line = self
            .port
            .lock()
            .await
            .next_line()
            .await
            .context("Failed to read telemetry line")?
            .ok_or_else(|| anyhow!("Unexpected EOF from telemetry port"))?;
        Ok(line.trim_end().to_string())
    }
}

#[async_trait]
impl Actuator for SerialTelemetry {
    async fn actuate(&self, power: f64, flow: f64, duty_cycle: f64) -> Result<(), DriverError> {
        let cmd = actuation_command(power, flow, duty_cycle);
        let comm = |e: std::io::Error| {
            DriverError::new(DRIVER, DriverErrorKind::Communication, e.to_string())
        };

        let mut guard = self.port.lock().await;
        let port = guard.get_mut().get_mut();
        port.write_all(cmd.as_bytes()).await.map_err(comm)?;
        port.flush().await.map_err(comm)?;
        debug!(power, flow, duty_cycle, "Setpoints written");
        Ok(())
    }
}
