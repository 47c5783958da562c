//! The protocol object an instrument driver builds on.
//!
//! An [`InstrumentProtocol`] composes a state machine, a command session, a chunker for received
//! frames and, depending on its [`Capabilities`], a menu tree and a job scheduler. Which parts an
//! instrument needs is configured, not inherited.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    ByteSink, CommandSession, DriverScheduler, EventId, InstrumentError, JobConfig, MenuTree,
    RaiseEvent, SessionConfig, Sieve, StateId, Step, StringChunker, ThreadSafeFsm,
    TriggerConfig, Transition,
};

/// What an instrument protocol supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// The instrument is operated through on-device menus.
    pub menus: bool,
    /// The driver schedules jobs, e.g., periodic status acquisition.
    pub scheduler: bool,
    /// Number of threads handling asynchronous events.
    pub async_workers: usize,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            menus: false,
            scheduler: false,
            async_workers: 1,
        }
    }
}

/// Configuration of an [`InstrumentProtocol`], usually read from a TOML file.
///
/// # Example
///
/// ```
/// use protocolrs::ProtocolConfig;
///
/// let config = ProtocolConfig::from_toml_str(
///     r#"
///     prompts = ["S>"]
///
///     [session]
///     wake_sequence = ""
///     response_timeout = "2s"
///
///     [capabilities]
///     scheduler = true
///
///     [jobs.acquire_status]
///     type = "interval"
///     minutes = 10
///     "#,
/// )
/// .unwrap();
/// assert_eq!(config.prompts, vec!["S>"]);
/// assert!(config.jobs.contains_key("acquire_status"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Timing and framing of the command session.
    pub session: SessionConfig,
    /// What the protocol supports.
    pub capabilities: Capabilities,
    /// Prompts the instrument shows when it is ready.
    pub prompts: Vec<String>,
    /// Directions to the instrument's menus. Required if `capabilities.menus` is set.
    pub menus: Option<MenuTree>,
    /// Key press that returns to the root menu and the prompt shown there.
    pub menu_root: Option<Step>,
    /// Triggers of scheduled events by job name, see
    /// [`InstrumentProtocol::add_configured_event`].
    pub jobs: HashMap<String, TriggerConfig>,
}

impl ProtocolConfig {
    /// Parse a configuration from TOML.
    pub fn from_toml_str(toml: &str) -> Result<Self, InstrumentError> {
        Ok(toml::from_str(toml)?)
    }
}

/// The per-driver step that turns recognized frames into samples or events.
///
/// Any `FnMut(f64, &[u8])` closure taking the timestamp and the frame is a frame handler. It is
/// called on the thread that receives the bytes, so it should not block: events should be raised
/// with [`ThreadSafeFsm::on_event_async`].
pub trait FrameHandler: Send {
    /// Handle a complete frame that was received at `timestamp`.
    fn handle_frame(&mut self, timestamp: f64, frame: &[u8]);
}

impl<F> FrameHandler for F
where
    F: FnMut(f64, &[u8]) + Send,
{
    fn handle_frame(&mut self, timestamp: f64, frame: &[u8]) {
        self(timestamp, frame)
    }
}

/// The receive path, shared with the closure returned by [`InstrumentProtocol::receiver`].
struct Reception<S: StateId> {
    session: Arc<CommandSession<S>>,
    chunker: Mutex<Option<StringChunker>>,
    frame_handler: Mutex<Option<Box<dyn FrameHandler>>>,
}

impl<S: StateId> Reception<S> {
    fn got_data(&self, bytes: &[u8], timestamp: f64) {
        self.session.got_data(bytes);

        let frames: Vec<(f64, Vec<u8>)> = {
            let mut chunker = self.chunker.lock().expect("Mutex should not be poisoned");
            let Some(chunker) = chunker.as_mut() else {
                return;
            };
            chunker.add_chunk(bytes, timestamp);
            std::iter::from_fn(|| chunker.get_next_data(true)).collect()
        };
        if frames.is_empty() {
            return;
        }

        let mut handler = self
            .frame_handler
            .lock()
            .expect("Mutex should not be poisoned");
        for (timestamp, frame) in frames {
            match handler.as_mut() {
                Some(handler) => handler.handle_frame(timestamp, &frame),
                None => debug!(len = frame.len(), "dropping frame, no frame handler set"),
            }
        }
    }
}

/// A state machine driven instrument protocol.
///
/// Handlers registered with [`InstrumentProtocol::add_handler`] usually talk to the instrument
/// through [`InstrumentProtocol::session`]. Received bytes must be handed to
/// [`InstrumentProtocol::got_data`], e.g., through the closure returned by
/// [`InstrumentProtocol::receiver`].
pub struct InstrumentProtocol<S, E, A = (), R = ()>
where
    S: StateId,
    E: EventId,
{
    fsm: Arc<ThreadSafeFsm<S, E, A, R>>,
    reception: Arc<Reception<S>>,
    capabilities: Capabilities,
    menus: Option<MenuTree>,
    menu_root: Option<Step>,
    scheduler: Option<DriverScheduler>,
    jobs: HashMap<String, TriggerConfig>,
}

impl<S, E, A, R> InstrumentProtocol<S, E, A, R>
where
    S: StateId,
    E: EventId,
    A: Default + Send + 'static,
    R: Send + 'static,
{
    /// Create a protocol without menus.
    ///
    /// # Arguments
    /// * `sink` - Where commands are written to.
    /// * `config` - Timing and framing of the command session.
    /// * `capabilities` - What the protocol supports. `menus` is ignored, see
    ///   [`InstrumentProtocol::with_menus`].
    /// * `prompts` - The prompts the instrument shows when it is ready.
    pub fn new(
        sink: Box<dyn ByteSink>,
        config: SessionConfig,
        capabilities: Capabilities,
        prompts: Vec<String>,
    ) -> Self {
        let fsm: Arc<ThreadSafeFsm<S, E, A, R>> =
            Arc::new(ThreadSafeFsm::with_async_workers(capabilities.async_workers));
        let weak = Arc::downgrade(&fsm);
        let session = Arc::new(CommandSession::new(
            sink,
            config,
            prompts,
            Arc::new(move || weak.upgrade().and_then(|fsm| fsm.get_current_state())),
        ));

        InstrumentProtocol {
            fsm,
            reception: Arc::new(Reception {
                session,
                chunker: Mutex::new(None),
                frame_handler: Mutex::new(None),
            }),
            capabilities: Capabilities {
                menus: false,
                ..capabilities
            },
            menus: None,
            menu_root: None,
            scheduler: capabilities.scheduler.then(DriverScheduler::new),
            jobs: HashMap::new(),
        }
    }

    /// Create a protocol from a configuration.
    ///
    /// Fails with [`InstrumentError::Config`] if menus are enabled without a menu tree and root,
    /// or if a menu tree is given without enabling menus.
    pub fn from_config(
        sink: Box<dyn ByteSink>,
        config: ProtocolConfig,
    ) -> Result<Self, InstrumentError> {
        let ProtocolConfig {
            session,
            capabilities,
            prompts,
            menus,
            menu_root,
            jobs,
        } = config;

        let mut protocol = Self::new(sink, session, capabilities, prompts);
        match (capabilities.menus, menus, menu_root) {
            (true, Some(menus), Some(root)) => protocol = protocol.with_menus(menus, root),
            (true, _, _) => {
                return Err(InstrumentError::Config(
                    "The menus capability needs a menu tree and a menu root".to_string(),
                ));
            }
            (false, Some(_), _) | (false, _, Some(_)) => {
                return Err(InstrumentError::Config(
                    "A menu tree is configured, but the menus capability is off".to_string(),
                ));
            }
            (false, None, None) => {}
        }
        if !jobs.is_empty() && protocol.scheduler.is_none() {
            return Err(InstrumentError::Config(
                "Jobs are configured, but the scheduler capability is off".to_string(),
            ));
        }
        protocol.jobs = jobs;
        Ok(protocol)
    }

    /// Enable menu navigation with the given tree. `root` is the key press that returns to the
    /// root menu and the prompt that shows up there.
    ///
    /// The keys of all steps and the root are registered as keypress commands with the session.
    pub fn with_menus(mut self, menus: MenuTree, root: Step) -> Self {
        let session = &self.reception.session;
        session.add_keypress_command(&root.command);
        for step in menus.steps() {
            session.add_keypress_command(&step.command);
        }
        self.capabilities.menus = true;
        self.menus = Some(menus);
        self.menu_root = Some(root);
        self
    }

    /// What this protocol supports.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// The state machine.
    pub fn fsm(&self) -> &Arc<ThreadSafeFsm<S, E, A, R>> {
        &self.fsm
    }

    /// The command session.
    pub fn session(&self) -> &Arc<CommandSession<S>> {
        &self.reception.session
    }

    /// Register a state machine handler, see [`ThreadSafeFsm::add_handler`].
    pub fn add_handler<F>(&self, state: S, event: E, handler: F) -> Result<(), InstrumentError>
    where
        F: Fn(A) -> Result<Transition<S, R>, InstrumentError> + Send + Sync + 'static,
    {
        self.fsm.add_handler(state, event, handler)
    }

    /// Start the state machine, see [`ThreadSafeFsm::start`].
    pub fn start(&self, initial_state: S) -> Result<(), InstrumentError> {
        self.fsm.start(initial_state)
    }

    /// Raise an event and wait for it to be handled, see [`ThreadSafeFsm::on_event`].
    pub fn on_event(&self, event: E, args: A) -> Result<Option<R>, InstrumentError> {
        self.fsm.on_event(event, args)
    }

    /// Raise an event without waiting, see [`ThreadSafeFsm::on_event_async`].
    pub fn on_event_async(&self, event: E, args: A) -> Result<(), InstrumentError> {
        self.fsm.on_event_async(event, args)
    }

    /// The current state, or `None` before the protocol is started.
    pub fn get_current_state(&self) -> Option<S> {
        self.fsm.get_current_state()
    }

    /// The events handled by the protocol, see [`ThreadSafeFsm::get_events`].
    pub fn get_events(&self, restrict_to_current: bool) -> Vec<E> {
        self.fsm.get_events(restrict_to_current)
    }

    /// Recognize frames in received bytes with `sieve`. Bytes received before are not searched.
    pub fn set_sieve<T: Sieve + 'static>(&self, sieve: T) {
        *self
            .reception
            .chunker
            .lock()
            .expect("Mutex should not be poisoned") = Some(StringChunker::new(sieve));
    }

    /// Hand recognized frames to `handler`.
    pub fn set_frame_handler<H: FrameHandler + 'static>(&self, handler: H) {
        *self
            .reception
            .frame_handler
            .lock()
            .expect("Mutex should not be poisoned") = Some(Box::new(handler));
    }

    /// Hand bytes received from the instrument to the protocol.
    ///
    /// The bytes are appended to the session's response buffers. If a sieve is set, they are
    /// fed to the chunker as well and every complete frame is passed to the frame handler. Bytes
    /// between frames are dropped.
    pub fn got_data(&self, bytes: &[u8], timestamp: f64) {
        self.reception.got_data(bytes, timestamp);
    }

    /// A receive callback for the transport that timestamps the bytes with the current time, in
    /// seconds since the unix epoch, and passes them to [`InstrumentProtocol::got_data`].
    ///
    /// The callback keeps the receive path alive, but not the state machine.
    pub fn receiver(&self) -> impl Fn(&[u8]) + Send + Sync + 'static + use<S, E, A, R> {
        let reception = Arc::clone(&self.reception);
        move |bytes: &[u8]| {
            let timestamp = Utc::now().timestamp_micros() as f64 / 1e6;
            reception.got_data(bytes, timestamp);
        }
    }

    /// Move the instrument's menu cursor to `menu_id`, see [`CommandSession::navigate`].
    ///
    /// Fails with [`InstrumentError::Protocol`] if the protocol has no menus.
    pub fn navigate(&self, menu_id: &str) -> Result<Option<String>, InstrumentError> {
        let menus = self.menus.as_ref().ok_or_else(no_menus)?;
        self.session().navigate(menus, menu_id)
    }

    /// Return to the root menu and return the response.
    ///
    /// Fails with [`InstrumentError::Protocol`] if the protocol has no menus.
    pub fn go_to_root(&self) -> Result<String, InstrumentError> {
        let root = self.menu_root.as_ref().ok_or_else(no_menus)?;
        self.session().send_step(root)
    }

    /// Raise `event` whenever `trigger` fires. The job is named `name`.
    ///
    /// Fails with [`InstrumentError::Protocol`] if the protocol has no scheduler, and with
    /// [`InstrumentError::Config`] if the trigger is invalid.
    pub fn add_scheduled_event(
        &self,
        name: &str,
        trigger: TriggerConfig,
        event: E,
    ) -> Result<(), InstrumentError>
    where
        A: Clone + Sync,
    {
        let scheduler = self.scheduler()?;
        info!(job = %name, ?event, "scheduling event");
        let callback = Arc::new(RaiseEvent::new(&self.fsm, event));
        scheduler.add_config(HashMap::from([(
            name.to_string(),
            JobConfig::new(trigger, callback),
        )]))
    }

    /// Raise `event` whenever the trigger configured for job `name` fires.
    ///
    /// Fails with [`InstrumentError::Config`] if no trigger is configured for `name`.
    pub fn add_configured_event(&self, name: &str, event: E) -> Result<(), InstrumentError>
    where
        A: Clone + Sync,
    {
        let trigger = self.jobs.get(name).cloned().ok_or_else(|| {
            InstrumentError::Config(format!("No trigger configured for job '{name}'"))
        })?;
        self.add_scheduled_event(name, trigger, event)
    }

    /// Run a polled job, see [`DriverScheduler::run_job`].
    pub fn run_job(&self, name: &str) -> Result<bool, InstrumentError> {
        self.scheduler()?.run_job(name)
    }

    /// Remove a scheduled job, see [`DriverScheduler::remove_job`].
    pub fn remove_job(&self, name: &str) -> Result<(), InstrumentError> {
        self.scheduler()?.remove_job(name);
        Ok(())
    }

    /// The job scheduler, if the protocol has one.
    pub fn scheduler(&self) -> Result<&DriverScheduler, InstrumentError> {
        self.scheduler.as_ref().ok_or_else(|| {
            InstrumentError::Protocol("This protocol has no scheduler".to_string())
        })
    }
}

fn no_menus() -> InstrumentError {
    InstrumentError::Protocol("This protocol has no menus".to_string())
}
