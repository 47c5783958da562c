//! This module connects the protocol engine to anything that implements [`std::io::Read`] and
//! [`std::io::Write`], such as [`std::net::TcpStream`] or a serial port.
//!
//! The write half becomes a [`ByteSink`] with [`IoInterface`], the read half is pumped into the
//! protocol's receive callback by [`spawn_reader`].

use std::{
    io::{ErrorKind, Read, Write},
    thread::{self, JoinHandle},
};

use tracing::{debug, error, trace};

use crate::{ByteSink, InstrumentError};

/// Size of the buffer [`spawn_reader`] reads into.
const READ_BUFFER_SIZE: usize = 1024;

/// A byte sink that writes to any [`std::io::Write`].
///
/// # Example
///
/// ```no_run
/// use std::net::TcpStream;
///
/// use protocolrs::{ByteSink, IoInterface};
///
/// let stream = TcpStream::connect("192.168.10.1:4001").unwrap();
/// let mut sink = IoInterface::new(stream);
/// sink.send("ds\r\n").unwrap();
/// ```
#[derive(Debug)]
pub struct IoInterface<W: Write + Send> {
    port: W,
}

impl<W: Write + Send> IoInterface<W> {
    /// Create a new byte sink that writes to `port`.
    pub fn new(port: W) -> Self {
        Self { port }
    }

    /// Get the underlying port back.
    pub fn into_inner(self) -> W {
        self.port
    }
}

impl<W: Write + Send> ByteSink for IoInterface<W> {
    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        trace!(len = data.len(), "writing");
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }
}

/// Read from `reader` on a new thread and hand everything read to `on_data`.
///
/// The thread ends when the reader reaches its end or fails with an error other than a timeout
/// or an interruption. Read timeouts are expected for serial ports and sockets with a read
/// timeout set and are simply retried.
///
/// Fails with [`InstrumentError::Io`] if the thread cannot be spawned.
pub fn spawn_reader<R, F>(mut reader: R, mut on_data: F) -> Result<JoinHandle<()>, InstrumentError>
where
    R: Read + Send + 'static,
    F: FnMut(&[u8]) + Send + 'static,
{
    let handle = thread::Builder::new()
        .name("instrument-reader".to_string())
        .spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!("reader reached the end of the stream");
                        break;
                    }
                    Ok(len) => {
                        trace!(len, "received");
                        on_data(&buf[..len]);
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                        ) => {}
                    Err(e) => {
                        error!(%e, "reading from the instrument failed");
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}
