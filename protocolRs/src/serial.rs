//! This module opens instruments that are connected via a serial port.
//!
//! It uses the `serialport` crate and is only available with the `serial` feature.

use std::time::Duration;

use serialport::{SerialPort, SerialPortBuilder};

use crate::{InstrumentError, IoInterface};

/// Shortcuts to connect a protocol to a serial port.
///
/// # Example
///
/// ```no_run
/// use protocolrs::{SerialInterface, spawn_reader};
///
/// let (sink, reader) = SerialInterface::simple("/dev/ttyUSB0", 9600).unwrap();
/// spawn_reader(reader, |bytes| println!("{}", String::from_utf8_lossy(bytes))).unwrap();
/// ```
#[derive(Debug)]
pub struct SerialInterface {}

impl SerialInterface {
    /// Open a serial port with 8N1 framing and a read timeout of 100 ms.
    ///
    /// Returns the byte sink to write to and a second handle to the port to read from.
    ///
    /// # Arguments
    /// * `port` - The name of the port, e.g., `/dev/ttyUSB0` or `COM3`.
    /// * `baud` - The baud rate.
    pub fn simple(
        port: &str,
        baud: u32,
    ) -> Result<(IoInterface<Box<dyn SerialPort>>, Box<dyn SerialPort>), InstrumentError> {
        Self::try_new(serialport::new(port, baud).timeout(Duration::from_millis(100)))
    }

    /// Open the serial port configured by `spb`.
    ///
    /// See [`serialport::SerialPortBuilder`] and the [`serialport::new`] function for the
    /// details of the configuration. Returns the byte sink to write to and a second handle to the
    /// port to read from.
    pub fn try_new(
        spb: SerialPortBuilder,
    ) -> Result<(IoInterface<Box<dyn SerialPort>>, Box<dyn SerialPort>), InstrumentError> {
        let port = spb.open()?;
        let reader = port.try_clone()?;
        Ok((IoInterface::new(port), reader))
    }
}
