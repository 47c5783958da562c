//! A thread safe finite state machine that drives instrument protocols.
//!
//! States and events are small `Copy` symbols, usually field-less enums. A handler is bound to
//! exactly one `(state, event)` pair. It receives the arguments the event was raised with and
//! returns a [`Transition`]: an optional next state and an optional result for the caller.
//!
//! All transitions are serialized by one guard. Events raised from a context that must not block,
//! e.g., the callback that receives bytes from the instrument, are submitted with
//! [`ThreadSafeFsm::on_event_async`] and executed by a small pool of worker threads.

use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use tracing::{debug, warn};

use crate::InstrumentError;

mod event_pool;

use event_pool::EventPool;

/// Marker trait for the state symbols of a state machine.
///
/// It is implemented for every type that fulfills its bounds, so a plain
/// `#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]` enum is a valid state.
pub trait StateId: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> StateId for T {}

/// Event symbols of a state machine.
///
/// Two events are reserved: `ENTER` is fired on the new state and `EXIT` on the old state
/// whenever a handler moves the machine to a different state.
pub trait EventId: StateId {
    /// Fired on a state when the machine enters it.
    const ENTER: Self;
    /// Fired on a state when the machine leaves it.
    const EXIT: Self;
}

/// The outcome of an event handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S, R> {
    /// The state to move to. `None` or the current state keeps the machine where it is and does
    /// not fire `EXIT`/`ENTER`.
    pub next_state: Option<S>,
    /// Result handed back to whoever raised the event.
    pub result: Option<R>,
}

impl<S, R> Transition<S, R> {
    /// Stay in the current state.
    pub fn stay(result: Option<R>) -> Self {
        Transition {
            next_state: None,
            result,
        }
    }

    /// Move to `state`.
    pub fn next(state: S, result: Option<R>) -> Self {
        Transition {
            next_state: Some(state),
            result,
        }
    }
}

type Handler<S, A, R> = Arc<dyn Fn(A) -> Result<Transition<S, R>, InstrumentError> + Send + Sync>;

/// A finite state machine that can safely be driven from several threads.
///
/// # Type parameters
/// - `S` - The states.
/// - `E` - The events, including the reserved `ENTER` and `EXIT`.
/// - `A` - Arguments events are raised with. `ENTER`/`EXIT` handlers receive `A::default()`.
/// - `R` - Results handlers return to the caller.
///
/// # Example
///
/// ```
/// use protocolrs::{ProtocolEvent, ProtocolState, ThreadSafeFsm, Transition};
///
/// let fsm: ThreadSafeFsm<ProtocolState, ProtocolEvent, (), String> = ThreadSafeFsm::new();
/// fsm.add_handler(ProtocolState::Unknown, ProtocolEvent::Discover, |_| {
///     Ok(Transition::next(ProtocolState::Command, Some("found it".to_string())))
/// })
/// .unwrap();
/// fsm.start(ProtocolState::Unknown).unwrap();
///
/// let result = fsm.on_event(ProtocolEvent::Discover, ()).unwrap();
/// assert_eq!(result.as_deref(), Some("found it"));
/// assert_eq!(fsm.get_current_state(), Some(ProtocolState::Command));
/// ```
pub struct ThreadSafeFsm<S, E, A = (), R = ()>
where
    S: StateId,
    E: EventId,
{
    handlers: RwLock<HashMap<(S, E), Handler<S, A, R>>>,
    registration_order: RwLock<Vec<(S, E)>>,
    current_state: RwLock<Option<S>>,
    previous_state: RwLock<Option<S>>,
    guard: Mutex<()>,
    pool: EventPool,
    async_failures: AtomicUsize,
}

impl<S, E, A, R> ThreadSafeFsm<S, E, A, R>
where
    S: StateId,
    E: EventId,
    A: Default + Send + 'static,
    R: Send + 'static,
{
    /// Create a new state machine whose asynchronous events are executed by a single worker.
    pub fn new() -> Self {
        Self::with_async_workers(1)
    }

    /// Create a new state machine with `workers` threads executing asynchronous events.
    ///
    /// With more than one worker, asynchronous events are no longer executed in submission order.
    /// They are still serialized by the state machine's guard. At least one worker is used.
    pub fn with_async_workers(workers: usize) -> Self {
        ThreadSafeFsm {
            handlers: RwLock::new(HashMap::new()),
            registration_order: RwLock::new(Vec::new()),
            current_state: RwLock::new(None),
            previous_state: RwLock::new(None),
            guard: Mutex::new(()),
            pool: EventPool::new(workers.max(1)),
            async_failures: AtomicUsize::new(0),
        }
    }

    /// Register the handler for `event` in `state`.
    ///
    /// Fails with a [`InstrumentError::Config`] if a handler already exists for this pair.
    pub fn add_handler<F>(&self, state: S, event: E, handler: F) -> Result<(), InstrumentError>
    where
        F: Fn(A) -> Result<Transition<S, R>, InstrumentError> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().expect("Lock should not be poisoned");
        if handlers.contains_key(&(state, event)) {
            return Err(InstrumentError::Config(format!(
                "A handler for event {event:?} in state {state:?} is already registered"
            )));
        }
        handlers.insert((state, event), Arc::new(handler));
        self.registration_order
            .write()
            .expect("Lock should not be poisoned")
            .push((state, event));
        Ok(())
    }

    /// Set the initial state without firing `ENTER`. Can only be called once.
    pub fn start(&self, initial_state: S) -> Result<(), InstrumentError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut current = self.current_state.write().expect("Lock should not be poisoned");
        if let Some(state) = *current {
            return Err(InstrumentError::Config(format!(
                "State machine was already started, current state is {state:?}"
            )));
        }
        debug!(state = ?initial_state, "state machine started");
        *current = Some(initial_state);
        Ok(())
    }

    /// The state the machine is in, or `None` if it was not started yet.
    ///
    /// This does not wait for a running transition to finish, so handlers can call it as well.
    pub fn get_current_state(&self) -> Option<S> {
        *self.current_state.read().expect("Lock should not be poisoned")
    }

    /// The state the machine was in before its last transition.
    pub fn previous_state(&self) -> Option<S> {
        *self.previous_state.read().expect("Lock should not be poisoned")
    }

    /// Events that have a handler registered, in registration order and without duplicates.
    ///
    /// The reserved `ENTER` and `EXIT` events are never listed as they cannot be raised from the
    /// outside in a meaningful way.
    ///
    /// # Arguments
    /// * `restrict_to_current` - Only list events handled in the current state.
    pub fn get_events(&self, restrict_to_current: bool) -> Vec<E> {
        let current = self.get_current_state();
        let order = self
            .registration_order
            .read()
            .expect("Lock should not be poisoned");
        let mut events = Vec::new();
        for (state, event) in order.iter() {
            if *event == E::ENTER || *event == E::EXIT {
                continue;
            }
            if restrict_to_current && Some(*state) != current {
                continue;
            }
            if !events.contains(event) {
                events.push(*event);
            }
        }
        events
    }

    /// Number of asynchronously raised events whose handler failed.
    pub fn async_failures(&self) -> usize {
        self.async_failures.load(Ordering::Relaxed)
    }

    /// Raise `event` with `args` and return the handler's result.
    ///
    /// Blocks until no other transition is running. If the handler moves the machine to a new
    /// state, `EXIT` is fired on the old state and `ENTER` on the new one, both only if a handler
    /// is registered for them.
    ///
    /// Fails with [`InstrumentError::UnknownTransition`] if the event is not handled in the
    /// current state, in which case the state is left untouched. Errors of the handler are passed
    /// on as they are.
    pub fn on_event(&self, event: E, args: A) -> Result<Option<R>, InstrumentError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);

        let state = self.get_current_state().ok_or_else(|| {
            InstrumentError::Protocol(format!(
                "Event {event:?} raised before the state machine was started"
            ))
        })?;
        let handler =
            self.handler(state, event)
                .ok_or_else(|| InstrumentError::UnknownTransition {
                    state: format!("{state:?}"),
                    event: format!("{event:?}"),
                })?;

        debug!(?state, ?event, "handling event");
        let transition = handler(args)?;

        match transition.next_state {
            Some(next_state) if next_state != state => {
                self.fire_reserved(state, E::EXIT)?;
                *self.previous_state.write().expect("Lock should not be poisoned") = Some(state);
                *self.current_state.write().expect("Lock should not be poisoned") =
                    Some(next_state);
                debug!(from = ?state, to = ?next_state, "state transition");
                self.fire_reserved(next_state, E::ENTER)?;
            }
            _ => {}
        }

        Ok(transition.result)
    }

    /// Raise `event` without waiting for it to be handled.
    ///
    /// The event is queued and handled by a worker thread via [`ThreadSafeFsm::on_event`]. Its
    /// result is discarded. If the handler fails, the error is logged and counted in
    /// [`ThreadSafeFsm::async_failures`]. An error is only returned if no worker could be started.
    pub fn on_event_async(self: &Arc<Self>, event: E, args: A) -> Result<(), InstrumentError> {
        let fsm = Arc::clone(self);
        self.pool.submit(Box::new(move || {
            if let Err(err) = fsm.on_event(event, args) {
                fsm.async_failures.fetch_add(1, Ordering::Relaxed);
                warn!(?event, %err, "asynchronous event failed");
            }
        }))
    }

    fn handler(&self, state: S, event: E) -> Option<Handler<S, A, R>> {
        self.handlers
            .read()
            .expect("Lock should not be poisoned")
            .get(&(state, event))
            .cloned()
    }

    fn fire_reserved(&self, state: S, event: E) -> Result<(), InstrumentError> {
        if let Some(handler) = self.handler(state, event) {
            let _ = handler(A::default())?;
        }
        Ok(())
    }
}

impl<S, E, A, R> Default for ThreadSafeFsm<S, E, A, R>
where
    S: StateId,
    E: EventId,
    A: Default + Send + 'static,
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
