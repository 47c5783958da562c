//! ProtocolRs: the protocol engine behind command/response and streaming instrument drivers
//!
//! Oceanographic sensors, pumps, tiltmeters and similar instruments are usually driven over a
//! serial line (or a serial-to-ethernet bridge) with a textual command/response or menu driven
//! protocol, sometimes interleaved with binary telemetry. Every driver for such an instrument
//! needs the same machinery, which this crate provides:
//!
//! - [`ThreadSafeFsm`]: a finite state machine with synchronous ([`ThreadSafeFsm::on_event`]) and
//!   fire-and-forget ([`ThreadSafeFsm::on_event_async`]) event dispatch.
//! - [`StringChunker`]: reassembles complete frames out of fragmented, possibly noisy bytes using
//!   a pluggable [`Sieve`].
//! - [`CommandSession`]: wakes the instrument, transmits a command and blocks until a prompt or a
//!   response pattern shows up. Together with a [`MenuTree`] it also navigates on-device menus.
//! - [`DriverScheduler`]: absolute, cron, interval and polled job triggers.
//!
//! [`InstrumentProtocol`] composes these parts into the protocol object a driver builds on. The
//! actual transport is not part of this crate: bytes are sent through a [`ByteSink`] and received
//! bytes are handed to [`InstrumentProtocol::got_data`].
//!
//! # Example
//!
//! ```no_run
//! use std::net::TcpStream;
//!
//! use protocolrs::{
//!     Capabilities, InstrumentProtocol, IoInterface, ProtocolEvent, ProtocolState, SessionConfig,
//!     Transition,
//! };
//!
//! let port = TcpStream::connect("192.168.10.1:4001").unwrap();
//! let sink = IoInterface::new(port.try_clone().unwrap());
//!
//! let protocol: InstrumentProtocol<ProtocolState, ProtocolEvent> = InstrumentProtocol::new(
//!     Box::new(sink),
//!     SessionConfig::default(),
//!     Capabilities::default(),
//!     vec!["S>".to_string()],
//! );
//! protocol
//!     .add_handler(ProtocolState::Unknown, ProtocolEvent::Discover, |_| {
//!         Ok(Transition::next(ProtocolState::Command, None))
//!     })
//!     .unwrap();
//! protocol.start(ProtocolState::Unknown).unwrap();
//!
//! let receiver = protocol.receiver();
//! protocolrs::spawn_reader(port, move |bytes| receiver(bytes)).unwrap();
//! protocol.on_event(ProtocolEvent::Discover, ()).unwrap();
//! ```
//!
//! # Logging
//!
//! The crate reports what it does through [`tracing`]. It never installs a subscriber, this is
//! left to the application.
//!
//! # License
//!
//!
//! Licensed under either of
//!
//! - Apache License, Version 2.0 ([LICENSE-APACHE](http://www.apache.org/licenses/LICENSE-2.0))
//! - MIT license ([LICENSE-MIT](http://opensource.org/licenses/MIT))
//!
//! at your option.
//!
//! # Contribution
//!
//! Unless you explicitly state otherwise, any contribution intentionally submitted
//! for inclusion in the work by you, as defined in the Apache-2.0 license, shall be
//! dual licensed as above, without any additional terms or conditions.

#![warn(missing_docs)]

use std::time::Duration;

use thiserror::Error;

mod callback;
mod chunker;
mod common;
mod fsm;
mod interface;
mod loopback;
mod menu;
mod protocol;
pub mod scheduler;
#[cfg(feature = "serial")]
mod serial;
mod session;

pub use callback::{Callback, RaiseEvent};
pub use chunker::{RawSpan, RegexSieve, Sieve, SpanKind, StringChunker};
pub use common::{ProtocolEvent, ProtocolState};
pub use fsm::{EventId, StateId, ThreadSafeFsm, Transition};
pub use interface::{IoInterface, spawn_reader};
pub use loopback::{LoopbackInterface, LoopbackReceiver};
pub use menu::{Direction, MenuTree, Step};
pub use protocol::{Capabilities, FrameHandler, InstrumentProtocol, ProtocolConfig};
pub use scheduler::{DriverScheduler, JobConfig, TriggerConfig, TriggerSpec};
#[cfg(feature = "serial")]
pub use serial::SerialInterface;
pub use session::{CommandOptions, CommandSession, SessionConfig};

/// The error enum for the protocol engine.
///
/// All operations of this crate return either their result or an `InstrumentError`. Handlers that
/// drivers register with the state machine or the command session return it as well, such that
/// errors raised deep inside a command exchange propagate with the `?` operator up to whoever
/// raised the event.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstrumentError {
    /// Invalid configuration: duplicate handlers, malformed job triggers or menu trees. These
    /// errors are always detected before any state is changed.
    #[error("Configuration error: {0}")]
    Config(String),
    /// The protocol was asked to do something it cannot do, e.g., send a command for which no
    /// builder is registered or match a response against a prompt and a pattern at once.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The instrument did not answer in time. The error contains what was being waited for and
    /// the timeout that was exceeded.
    #[error("Timeout occured while waiting for {operation}. Timeout was set to {timeout:?}.")]
    Timeout {
        /// What we were waiting for.
        operation: String,
        /// The timeout that was set.
        timeout: Duration,
    },
    /// The event is not handled in the current state of the state machine.
    #[error("Event {event} is not handled in state {state}")]
    UnknownTransition {
        /// The state the machine was in.
        state: String,
        /// The event that was raised.
        event: String,
    },
    /// A polled job with the given name does not exist.
    #[error("No polled job named '{0}' is known to the scheduler")]
    JobLookup(String),
    /// Raised by driver handlers when an event or command is called with arguments the
    /// instrument does not accept, e.g., a sample interval out of range.
    #[error("{0}")]
    InvalidArgument(String),
    /// Raised by driver response handlers when the instrument answered with an error message.
    /// The message is displayed as is.
    #[error("{0}")]
    InstrumentStatus(String),
    /// Raised by driver response handlers when a response does not have the expected format. The
    /// error contains the response as received.
    #[error("Response from instrument could not be parsed. Response was: {0}")]
    ResponseParseError(String),
    /// Error when reading from/writing to an interface. See [`std::io::Error`] for more details.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A configuration file could not be parsed.
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[cfg(feature = "serial")]
    /// Serial port errors can occur when opening a serial interface. See the [`serialport::Error`]
    /// documentation for more information.
    #[error(transparent)]
    Serialport(#[from] serialport::Error),
}

/// The `ByteSink` trait is the transmit side of the transport an instrument is connected with.
///
/// The protocol engine never opens ports or sockets itself. It writes through a `ByteSink` and
/// gets received bytes handed in by whoever owns the transport.
pub trait ByteSink: Send {
    /// Write the given bytes to the instrument and flush them out.
    ///
    /// # Arguments:
    /// - `data` - The bytes to transmit.
    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError>;

    /// Write a string to the instrument, as is, without appending any terminator.
    fn send(&mut self, data: &str) -> Result<(), InstrumentError> {
        self.write_raw(data.as_bytes())
    }
}

impl<T: ByteSink + ?Sized> ByteSink for Box<T> {
    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        (**self).write_raw(data)
    }
}
