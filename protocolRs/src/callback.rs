//! Callbacks the scheduler invokes when a job fires.

use std::sync::{Arc, Weak};

use crate::{EventId, InstrumentError, StateId, ThreadSafeFsm};

/// Something that can be invoked when a scheduled job fires.
///
/// Any `Fn() -> Result<(), InstrumentError>` closure is a callback. [`RaiseEvent`] is the other
/// common one: it raises an event on a state machine.
pub trait Callback: Send + Sync {
    /// Run the callback.
    fn invoke(&self) -> Result<(), InstrumentError>;
}

impl<F> Callback for F
where
    F: Fn() -> Result<(), InstrumentError> + Send + Sync,
{
    fn invoke(&self) -> Result<(), InstrumentError> {
        self()
    }
}

/// A callback that raises an event on a state machine.
///
/// The event is raised with [`ThreadSafeFsm::on_event_async`], such that the scheduler never
/// waits for a transition. Only a weak reference to the state machine is kept: once it is
/// dropped, invoking the callback fails.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use protocolrs::{Callback, ProtocolEvent, ProtocolState, RaiseEvent, ThreadSafeFsm};
///
/// let fsm: Arc<ThreadSafeFsm<ProtocolState, ProtocolEvent>> = Arc::new(ThreadSafeFsm::new());
/// let callback = RaiseEvent::new(&fsm, ProtocolEvent::AcquireStatus);
/// assert_eq!(callback.event(), ProtocolEvent::AcquireStatus);
/// ```
pub struct RaiseEvent<S, E, A = (), R = ()>
where
    S: StateId,
    E: EventId,
{
    fsm: Weak<ThreadSafeFsm<S, E, A, R>>,
    event: E,
    args: A,
}

impl<S, E, A, R> RaiseEvent<S, E, A, R>
where
    S: StateId,
    E: EventId,
    A: Clone + Default + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Raise `event` with default arguments.
    pub fn new(fsm: &Arc<ThreadSafeFsm<S, E, A, R>>, event: E) -> Self {
        Self::with_args(fsm, event, A::default())
    }

    /// Raise `event` with a copy of `args` every time the callback is invoked.
    pub fn with_args(fsm: &Arc<ThreadSafeFsm<S, E, A, R>>, event: E, args: A) -> Self {
        RaiseEvent {
            fsm: Arc::downgrade(fsm),
            event,
            args,
        }
    }

    /// The event that is raised.
    pub fn event(&self) -> E {
        self.event
    }
}

impl<S, E, A, R> Callback for RaiseEvent<S, E, A, R>
where
    S: StateId,
    E: EventId,
    A: Clone + Default + Send + Sync + 'static,
    R: Send + 'static,
{
    fn invoke(&self) -> Result<(), InstrumentError> {
        let fsm = self.fsm.upgrade().ok_or_else(|| {
            InstrumentError::Protocol(format!(
                "Cannot raise {:?}, the state machine is gone",
                self.event
            ))
        })?;
        fsm.on_event_async(self.event, self.args.clone())
    }
}
