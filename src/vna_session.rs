//! One serial transport handle per analyzer, driven one scan command at a time.

use crate::measurement::DataPoint;
use crate::protocol::{self, FrameError, ScanHeader};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Frequency range and shape of one scan command cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSetup {
    pub start_hz: u32,
    pub stop_hz: u32,
    pub point_count: u16,
    pub mask: u16,
}

impl SweepSetup {
    fn expected_header(&self) -> ScanHeader {
        ScanHeader {
            mask: self.mask,
            point_count: self.point_count,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("serial port error: {0}")]
    Transport(#[from] serialport::Error),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session is closed")]
    Closed,
}

/// An open connection to one analyzer.
///
/// The session owns the transport exclusively and speaks exactly one command
/// cycle at a time: write a command, consume the full response. Interleaving
/// commands on one handle would desynchronize the binary stream.
pub struct VnaSession {
    serial: Option<Box<dyn SerialPort>>,
    device_id: u32,
    port_name: String,
    epoch: Instant,
}

impl std::fmt::Debug for VnaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VnaSession")
            .field("device_id", &self.device_id)
            .field("port_name", &self.port_name)
            .field("open", &self.serial.is_some())
            .finish()
    }
}

impl VnaSession {
    pub const BAUD_RATE: u32 = 115_200;
    pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

    /// Open the transport for one analyzer.
    pub fn open(port: &str, device_id: u32) -> Result<Self, SessionError> {
        Self::open_with_epoch(port, device_id, Instant::now())
    }

    /// Open with a caller-provided epoch so timestamps from several sessions
    /// share one time base.
    pub fn open_with_epoch(
        port: &str,
        device_id: u32,
        epoch: Instant,
    ) -> Result<Self, SessionError> {
        let serial = serialport::new(port, Self::BAUD_RATE)
            .timeout(Self::READ_TIMEOUT)
            .open()?;
        log::debug!("opened {port} as device {device_id}");
        Ok(Self {
            serial: Some(serial),
            device_id,
            port_name: port.to_string(),
            epoch,
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Query the device identification text.
    pub fn info(&mut self) -> Result<String, SessionError> {
        self.exec_text(protocol::encode_info())
    }

    /// Query the firmware version string.
    pub fn version(&mut self) -> Result<String, SessionError> {
        self.exec_text(protocol::encode_version())
    }

    fn exec_text(&mut self, command: &[u8]) -> Result<String, SessionError> {
        let serial = self.serial.as_mut().ok_or(SessionError::Closed)?;
        serial.clear(serialport::ClearBuffer::Input)?;
        serial.write_all(command)?;
        Ok(protocol::read_until_prompt(serial)?)
    }

    /// Run one scan command cycle, emitting one [`DataPoint`] per record.
    ///
    /// Returns `Ok(true)` when all `point_count` records were consumed,
    /// `Ok(false)` when the cancellation flag stopped the cycle early. The
    /// flag is checked at record boundaries only, so no partial record is
    /// ever emitted.
    pub fn run_sweep(
        &mut self,
        setup: SweepSetup,
        sweep_number: u32,
        cancel: &AtomicBool,
        emit: &mut dyn FnMut(DataPoint),
    ) -> Result<bool, SessionError> {
        let device_id = self.device_id;
        let epoch = self.epoch;
        let serial = self.serial.as_mut().ok_or(SessionError::Closed)?;

        let time_sent = epoch.elapsed().as_secs_f64();
        serial.write_all(&protocol::encode_scan(
            setup.start_hz,
            setup.stop_hz,
            setup.point_count,
            setup.mask,
        ))?;

        protocol::seek_header(serial, setup.expected_header())?;

        let completed = read_sweep_records(
            serial,
            setup.point_count,
            device_id,
            sweep_number,
            time_sent,
            epoch,
            cancel,
            emit,
        )?;

        if !completed {
            // The device keeps streaming the rest of the sweep; drop it.
            let _ = serial.clear(serialport::ClearBuffer::Input);
            log::debug!("device {device_id}: sweep {sweep_number} cancelled mid-cycle");
        }
        Ok(completed)
    }

    /// Release the transport. Safe to call more than once.
    pub fn close(&mut self) {
        if self.serial.take().is_some() {
            log::debug!("closed {} (device {})", self.port_name, self.device_id);
        }
    }
}

impl Drop for VnaSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consume exactly `point_count` records, checking the cancellation flag at
/// each record boundary.
fn read_sweep_records<R: Read>(
    reader: &mut R,
    point_count: u16,
    device_id: u32,
    sweep_number: u32,
    time_sent: f64,
    epoch: Instant,
    cancel: &AtomicBool,
    emit: &mut dyn FnMut(DataPoint),
) -> Result<bool, FrameError> {
    for _ in 0..point_count {
        if cancel.load(Ordering::Relaxed) {
            return Ok(false);
        }
        let record = protocol::read_record(reader)?;
        emit(DataPoint {
            device_id,
            frequency_hz: record.frequency_hz,
            s11: record.s11,
            s21: record.s21,
            sweep_number,
            time_sent,
            time_received: epoch.elapsed().as_secs_f64(),
        });
    }
    Ok(true)
}
