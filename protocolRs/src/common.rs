//! States and events shared by most instrument protocols.
//!
//! Drivers with protocol specific states, e.g., the flush/fill/clear cycle of a pump, define their
//! own enums and implement [`EventId`] for their events.

use std::fmt::Display;

use crate::EventId;

/// Common protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    /// The state of the instrument is not known yet, e.g., right after connecting.
    Unknown,
    /// The instrument waits for commands.
    Command,
    /// The instrument streams samples on its own.
    Autosample,
    /// Bytes are passed between the user and the instrument without interpretation.
    DirectAccess,
}

impl Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolState::Unknown => write!(f, "UNKNOWN"),
            ProtocolState::Command => write!(f, "COMMAND"),
            ProtocolState::Autosample => write!(f, "AUTOSAMPLE"),
            ProtocolState::DirectAccess => write!(f, "DIRECT_ACCESS"),
        }
    }
}

/// Common protocol events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolEvent {
    /// Reserved, fired when a state is entered.
    Enter,
    /// Reserved, fired when a state is left.
    Exit,
    /// Find out which state the instrument is in.
    Discover,
    /// Read parameters.
    Get,
    /// Write parameters.
    Set,
    /// Take a single sample.
    AcquireSample,
    /// Start streaming samples.
    StartAutosample,
    /// Stop streaming samples.
    StopAutosample,
    /// Enter direct access.
    StartDirect,
    /// Leave direct access.
    StopDirect,
    /// Pass data through to the instrument while in direct access.
    ExecuteDirect,
    /// Synchronize the instrument clock with the host.
    ClockSync,
    /// Read the instrument status.
    AcquireStatus,
}

impl EventId for ProtocolEvent {
    const ENTER: Self = ProtocolEvent::Enter;
    const EXIT: Self = ProtocolEvent::Exit;
}

impl Display for ProtocolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProtocolEvent::Enter => "ENTER",
            ProtocolEvent::Exit => "EXIT",
            ProtocolEvent::Discover => "DISCOVER",
            ProtocolEvent::Get => "GET",
            ProtocolEvent::Set => "SET",
            ProtocolEvent::AcquireSample => "ACQUIRE_SAMPLE",
            ProtocolEvent::StartAutosample => "START_AUTOSAMPLE",
            ProtocolEvent::StopAutosample => "STOP_AUTOSAMPLE",
            ProtocolEvent::StartDirect => "START_DIRECT",
            ProtocolEvent::StopDirect => "STOP_DIRECT",
            ProtocolEvent::ExecuteDirect => "EXECUTE_DIRECT",
            ProtocolEvent::ClockSync => "CLOCK_SYNC",
            ProtocolEvent::AcquireStatus => "ACQUIRE_STATUS",
        };
        write!(f, "{name}")
    }
}
