//! Command/response exchanges with an instrument.
//!
//! A [`CommandSession`] wakes the instrument up, transmits a command line and then polls the
//! received bytes until the instrument shows one of its prompts or until the response matches a
//! pattern. Received bytes are handed to the session with [`CommandSession::got_data`], usually
//! from the thread that reads from the transport.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, RwLock},
    thread,
    time::{Duration, Instant},
};

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::{ByteSink, InstrumentError, MenuTree, StateId, Step};

/// Timing and framing of a command session.
///
/// All durations are given in human readable form when deserialized, e.g., `"500ms"` or `"3s"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Appended to commands built with [`CommandSession::add_simple_command`].
    pub newline: String,
    /// Sent to rouse the instrument before every command. Leave empty for instruments that never
    /// sleep, which skips the wakeup entirely.
    pub wake_sequence: String,
    /// Give up waking the instrument after this long.
    #[serde(with = "humantime_serde")]
    pub wakeup_timeout: Duration,
    /// Time between sending the wake sequence and looking for a prompt.
    #[serde(with = "humantime_serde")]
    pub wakeup_delay: Duration,
    /// Default time to wait for a response.
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// How often the received bytes are checked for a response.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Default delay between characters sent. Zero sends commands in one write.
    #[serde(with = "humantime_serde")]
    pub write_delay: Duration,
    /// Received bytes kept for matching responses. Older bytes are dropped once a buffer grows
    /// past this size, e.g., while the instrument streams samples.
    pub max_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            newline: "\r\n".to_string(),
            wake_sequence: "\r\n".to_string(),
            wakeup_timeout: Duration::from_secs(3),
            wakeup_delay: Duration::from_secs(1),
            response_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            write_delay: Duration::ZERO,
            max_buffer_size: 65536,
        }
    }
}

/// Options for a single command.
///
/// By default, the session waits for any of its prompts for [`SessionConfig::response_timeout`].
/// Either explicit prompts or a response pattern can be given instead, but not both.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use protocolrs::CommandOptions;
///
/// let options = CommandOptions::new()
///     .timeout(Duration::from_secs(30))
///     .expected_prompt("Main Menu>");
/// ```
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    timeout: Option<Duration>,
    write_delay: Option<Duration>,
    expected_prompts: Option<Vec<String>>,
    response_regex: Option<Regex>,
}

impl CommandOptions {
    /// Options that use the session defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait at most `timeout` for the response.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send the command one character at a time, `delay` apart.
    pub fn write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Wait for this prompt instead of the session's prompts.
    pub fn expected_prompt(self, prompt: &str) -> Self {
        self.expected_prompts(vec![prompt.to_string()])
    }

    /// Wait for any of these prompts instead of the session's prompts.
    pub fn expected_prompts(mut self, prompts: Vec<String>) -> Self {
        self.expected_prompts = Some(prompts);
        self
    }

    /// Wait until the received lines match `regex`.
    pub fn response_regex(mut self, regex: Regex) -> Self {
        self.response_regex = Some(regex);
        self
    }
}

type BuildHandler = Arc<dyn Fn(&str, &[String]) -> Result<String, InstrumentError> + Send + Sync>;
type ResponseHandler = Arc<dyn Fn(&str, &str) -> Result<String, InstrumentError> + Send + Sync>;
type StateQuery<S> = Arc<dyn Fn() -> Option<S> + Send + Sync>;

/// Everything received since the buffers were last cleaned.
#[derive(Debug, Default)]
struct ResponseBuffers {
    /// Matched against response patterns.
    line: String,
    /// Searched for prompts. Also cleared by every wakeup attempt.
    prompt: String,
    /// Start of a UTF-8 character whose remaining bytes were not received yet.
    partial: Vec<u8>,
}

impl ResponseBuffers {
    fn push(&mut self, bytes: &[u8], max_size: usize) {
        self.partial.extend_from_slice(bytes);
        let complete = complete_utf8_len(&self.partial);
        let text = String::from_utf8_lossy(&self.partial[..complete]).into_owned();
        self.partial.drain(..complete);

        self.line.push_str(&text);
        self.prompt.push_str(&text);
        keep_tail(&mut self.line, max_size);
        keep_tail(&mut self.prompt, max_size);
    }
}

/// Length of the prefix of `bytes` that does not end in an incomplete UTF-8 character. Invalid
/// sequences count as complete, they are replaced when decoding.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    let mut pos = 0;
    loop {
        match std::str::from_utf8(&bytes[pos..]) {
            Ok(_) => return bytes.len(),
            Err(err) => match err.error_len() {
                Some(len) => pos += err.valid_up_to() + len,
                None => return pos + err.valid_up_to(),
            },
        }
    }
}

/// Drop the front of `buffer` such that at most `max_size` bytes remain.
fn keep_tail(buffer: &mut String, max_size: usize) {
    if buffer.len() <= max_size {
        return;
    }
    let mut cut = buffer.len() - max_size;
    while !buffer.is_char_boundary(cut) {
        cut += 1;
    }
    buffer.drain(..cut);
}

/// Send commands to an instrument and wait for its responses.
///
/// Only one command should be in flight per session at a time. Commands are usually sent from
/// within state machine handlers, which serializes them.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use protocolrs::{CommandOptions, CommandSession, LoopbackInterface, ProtocolState, SessionConfig};
///
/// let config = SessionConfig {
///     wake_sequence: String::new(),
///     ..SessionConfig::default()
/// };
/// let loopback = LoopbackInterface::new(vec!["ds\r\n"], vec!["SBE 16plus V 2.5\r\nS>"]);
/// let receiver = loopback.receiver();
///
/// let session: Arc<CommandSession<ProtocolState>> = Arc::new(CommandSession::new(
///     Box::new(loopback),
///     config,
///     vec!["S>".to_string()],
///     Arc::new(|| None::<ProtocolState>),
/// ));
/// let weak = Arc::downgrade(&session);
/// receiver.connect(move |bytes| {
///     if let Some(session) = weak.upgrade() {
///         session.got_data(bytes);
///     }
/// });
///
/// session.add_simple_command("ds");
/// let response = session.send_command("ds", &[], &CommandOptions::new()).unwrap();
/// assert_eq!(response, "SBE 16plus V 2.5\r\nS>");
/// ```
pub struct CommandSession<S: StateId> {
    config: SessionConfig,
    /// Sorted longest first, such that `S>` wins over `>`.
    prompts: Vec<String>,
    sink: Mutex<Box<dyn ByteSink>>,
    buffers: Mutex<ResponseBuffers>,
    build_handlers: RwLock<HashMap<String, BuildHandler>>,
    response_handlers: RwLock<HashMap<(Option<S>, String), ResponseHandler>>,
    current_state: StateQuery<S>,
}

impl<S: StateId> fmt::Debug for CommandSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSession")
            .field("config", &self.config)
            .field("prompts", &self.prompts)
            .finish_non_exhaustive()
    }
}

impl<S: StateId> CommandSession<S> {
    /// Create a new command session.
    ///
    /// # Arguments
    /// * `sink` - Where commands are written to.
    /// * `config` - Timing and framing of the session.
    /// * `prompts` - The prompts the instrument shows when it is ready for a command.
    /// * `current_state` - Query for the protocol state, used to pick state specific response
    ///   handlers. Must not block while a transition is running.
    pub fn new(
        sink: Box<dyn ByteSink>,
        config: SessionConfig,
        prompts: Vec<String>,
        current_state: StateQuery<S>,
    ) -> Self {
        CommandSession {
            config,
            prompts: sort_prompts(prompts),
            sink: Mutex::new(sink),
            buffers: Mutex::new(ResponseBuffers::default()),
            build_handlers: RwLock::new(HashMap::new()),
            response_handlers: RwLock::new(HashMap::new()),
            current_state,
        }
    }

    /// The configuration of this session.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The prompts of this session, longest first.
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    /// Register how the command line for `cmd` is built from its arguments.
    ///
    /// The builder gets the command name and the arguments `send_command` was called with and
    /// returns the exact text to transmit, including any terminator.
    pub fn add_build_handler<F>(&self, cmd: &str, builder: F)
    where
        F: Fn(&str, &[String]) -> Result<String, InstrumentError> + Send + Sync + 'static,
    {
        self.build_handlers
            .write()
            .expect("Lock should not be poisoned")
            .insert(cmd.to_string(), Arc::new(builder));
    }

    /// Register `cmd` as a command that is sent as is, followed by the newline.
    pub fn add_simple_command(&self, cmd: &str) {
        let newline = self.config.newline.clone();
        self.add_build_handler(cmd, move |cmd, _| Ok(format!("{cmd}{newline}")));
    }

    /// Register `cmd` as a single key press: it is sent as is, without a newline.
    pub fn add_keypress_command(&self, cmd: &str) {
        self.add_build_handler(cmd, |cmd, _| Ok(cmd.to_string()));
    }

    /// Register a handler that interprets the response to `cmd`.
    ///
    /// The handler gets the response and the prompt (or the complete pattern match) that ended
    /// it. Its result is what `send_command` returns. If `state` is given, the handler is only
    /// used while the protocol is in that state and takes precedence over a handler without
    /// state.
    pub fn add_response_handler<F>(&self, cmd: &str, state: Option<S>, handler: F)
    where
        F: Fn(&str, &str) -> Result<String, InstrumentError> + Send + Sync + 'static,
    {
        self.response_handlers
            .write()
            .expect("Lock should not be poisoned")
            .insert((state, cmd.to_string()), Arc::new(handler));
    }

    /// Hand bytes received from the instrument to the session.
    ///
    /// A character split over two calls is decoded once it is complete. Each buffer keeps at
    /// most [`SessionConfig::max_buffer_size`] bytes, the newest ones.
    pub fn got_data(&self, bytes: &[u8]) {
        self.buffers
            .lock()
            .expect("Mutex should not be poisoned")
            .push(bytes, self.config.max_buffer_size);
    }

    /// Forget everything received so far.
    pub fn clean_buffers(&self) {
        let mut buffers = self.buffers.lock().expect("Mutex should not be poisoned");
        buffers.line.clear();
        buffers.prompt.clear();
        buffers.partial.clear();
    }

    /// Everything received since the buffers were last cleaned.
    pub fn line_buffer(&self) -> String {
        self.buffers
            .lock()
            .expect("Mutex should not be poisoned")
            .line
            .clone()
    }

    /// Wake the instrument up and return the prompt it answered with.
    ///
    /// Sends the wake sequence, waits [`SessionConfig::wakeup_delay`] and looks for any of the
    /// session's prompts in what came back. This is repeated until a prompt is found or the
    /// timeout elapsed, in which case an [`InstrumentError::Timeout`] is returned.
    pub fn wakeup(&self, timeout: Duration) -> Result<String, InstrumentError> {
        if self.prompts.is_empty() {
            return Err(InstrumentError::Config(
                "Cannot wake the instrument up without any prompts".to_string(),
            ));
        }

        let tic = Instant::now();
        loop {
            self.buffers
                .lock()
                .expect("Mutex should not be poisoned")
                .prompt
                .clear();
            debug!("sending wakeup");
            self.transmit(self.config.wake_sequence.as_bytes(), Duration::ZERO)?;
            thread::sleep(self.config.wakeup_delay);

            {
                let buffers = self.buffers.lock().expect("Mutex should not be poisoned");
                if let Some(prompt) = self.prompts.iter().find(|p| buffers.prompt.contains(*p)) {
                    debug!(%prompt, "instrument is awake");
                    return Ok(prompt.clone());
                }
            }

            if tic.elapsed() > timeout {
                return Err(InstrumentError::Timeout {
                    operation: "the instrument to wake up".to_string(),
                    timeout,
                });
            }
        }
    }

    /// Send `cmd` and return its (interpreted) response.
    ///
    /// The command line is built by the builder registered for `cmd`. The instrument is woken up,
    /// the receive buffers are cleaned, the command is transmitted, and the received bytes are
    /// polled until the response is complete. The response is then passed to the response
    /// handler for `cmd` in the current state, or for `cmd` in any state. Without a handler, the
    /// response is returned as is.
    ///
    /// # Errors
    /// - [`InstrumentError::Protocol`] if both expected prompts and a response pattern are given,
    ///   or if no builder is registered for `cmd`. Nothing is transmitted in this case.
    /// - [`InstrumentError::Timeout`] if the instrument does not wake up or does not respond.
    pub fn send_command(
        &self,
        cmd: &str,
        args: &[String],
        options: &CommandOptions,
    ) -> Result<String, InstrumentError> {
        validate_options(options)?;
        let line = self.build_command(cmd, args)?;
        self.prepare()?;
        self.transmit_command(&line, options)?;

        let timeout = options.timeout.unwrap_or(self.config.response_timeout);
        let (response, prompt) = self.get_response(cmd, timeout, options)?;
        debug!(%cmd, %response, "received response");

        match self.response_handler(cmd) {
            Some(handler) => handler(&response, &prompt),
            None => Ok(response),
        }
    }

    /// Send `cmd` without waiting for a response.
    ///
    /// Same as [`CommandSession::send_command`], but returns right after transmitting.
    pub fn send_command_no_response(
        &self,
        cmd: &str,
        args: &[String],
        options: &CommandOptions,
    ) -> Result<(), InstrumentError> {
        validate_options(options)?;
        let line = self.build_command(cmd, args)?;
        self.prepare()?;
        self.transmit_command(&line, options)
    }

    /// Transmit raw bytes as they are, e.g., for direct access. There is no wakeup and no
    /// response handling.
    pub fn send_direct(&self, data: &[u8]) -> Result<(), InstrumentError> {
        self.transmit(data, Duration::ZERO)
    }

    /// Move the instrument's menu cursor to `menu_id` and return the last response.
    ///
    /// Every step of the resolved menu path is sent with [`CommandSession::send_command`],
    /// waiting for the step's response prompt with the step's timeout. The step commands must
    /// have builders, usually registered with [`CommandSession::add_keypress_command`]. Returns
    /// `None` if the path has no steps.
    pub fn navigate(
        &self,
        menu: &MenuTree,
        menu_id: &str,
    ) -> Result<Option<String>, InstrumentError> {
        let mut last = None;
        for step in menu.resolve(menu_id)? {
            last = Some(self.send_step(&step)?);
        }
        Ok(last)
    }

    /// Send the command of a menu step and wait for the step's response prompt.
    pub fn send_step(&self, step: &Step) -> Result<String, InstrumentError> {
        debug!(command = %step.command, "menu step");
        let options = CommandOptions::new()
            .timeout(step.timeout)
            .expected_prompt(&step.response);
        self.send_command(&step.command, &[], &options)
    }

    fn build_command(&self, cmd: &str, args: &[String]) -> Result<String, InstrumentError> {
        let builder = self
            .build_handlers
            .read()
            .expect("Lock should not be poisoned")
            .get(cmd)
            .cloned()
            .ok_or_else(|| InstrumentError::Protocol(format!("Cannot build command: {cmd}")))?;
        builder(cmd, args)
    }

    fn response_handler(&self, cmd: &str) -> Option<ResponseHandler> {
        let state = (self.current_state)();
        let handlers = self
            .response_handlers
            .read()
            .expect("Lock should not be poisoned");
        state
            .and_then(|state| handlers.get(&(Some(state), cmd.to_string())))
            .or_else(|| handlers.get(&(None, cmd.to_string())))
            .cloned()
    }

    /// Wake the instrument up if it sleeps, then clean the buffers.
    fn prepare(&self) -> Result<(), InstrumentError> {
        if !self.config.wake_sequence.is_empty() {
            self.wakeup(self.config.wakeup_timeout)?;
        }
        self.clean_buffers();
        Ok(())
    }

    fn transmit_command(
        &self,
        line: &str,
        options: &CommandOptions,
    ) -> Result<(), InstrumentError> {
        let write_delay = options.write_delay.unwrap_or(self.config.write_delay);
        debug!(command = %line.trim_end(), "sending command");
        self.transmit(line.as_bytes(), write_delay)
    }

    fn transmit(&self, data: &[u8], write_delay: Duration) -> Result<(), InstrumentError> {
        let mut sink = self.sink.lock().expect("Mutex should not be poisoned");
        if write_delay.is_zero() {
            return sink.write_raw(data);
        }
        for byte in data {
            sink.write_raw(std::slice::from_ref(byte))?;
            thread::sleep(write_delay);
        }
        Ok(())
    }

    /// Poll the buffers until the response is complete. Returns the response and the prompt or
    /// pattern match that completed it.
    fn get_response(
        &self,
        cmd: &str,
        timeout: Duration,
        options: &CommandOptions,
    ) -> Result<(String, String), InstrumentError> {
        let prompts = match &options.expected_prompts {
            Some(prompts) => sort_prompts(prompts.clone()),
            None => self.prompts.clone(),
        };

        let tic = Instant::now();
        loop {
            {
                let buffers = self.buffers.lock().expect("Mutex should not be poisoned");
                let found = match &options.response_regex {
                    Some(regex) => match_regex(regex, &buffers.line),
                    None => prompts
                        .iter()
                        .find_map(|prompt| match_prompt(&buffers.prompt, prompt)),
                };
                if let Some(found) = found {
                    return Ok(found);
                }
            }

            if tic.elapsed() > timeout {
                return Err(InstrumentError::Timeout {
                    operation: format!("a response to command '{cmd}'"),
                    timeout,
                });
            }
            thread::sleep(self.config.poll_interval);
        }
    }
}

fn validate_options(options: &CommandOptions) -> Result<(), InstrumentError> {
    if options.expected_prompts.is_some() && options.response_regex.is_some() {
        return Err(InstrumentError::Protocol(
            "Cannot wait for an expected prompt and a response pattern at once".to_string(),
        ));
    }
    Ok(())
}

/// Longest prompts first, such that a prompt that ends with a shorter one is found first.
fn sort_prompts(mut prompts: Vec<String>) -> Vec<String> {
    prompts.sort_by(|a, b| b.len().cmp(&a.len()));
    prompts
}

/// If `buffer` ends with `prompt`, ignoring surrounding whitespace, return the trimmed response
/// and the prompt.
fn match_prompt(buffer: &str, prompt: &str) -> Option<(String, String)> {
    let trimmed_prompt = prompt.trim();
    if trimmed_prompt.is_empty() {
        // Prompts made of whitespace only, e.g., a bare newline, are matched literally.
        return (!prompt.is_empty() && buffer.ends_with(prompt))
            .then(|| (buffer.trim().to_string(), prompt.to_string()));
    }
    let tail = buffer.trim_end();
    tail.ends_with(trimmed_prompt)
        .then(|| (tail.trim_start().to_string(), prompt.to_string()))
}

/// Match `regex` against `buffer`. The response is the concatenation of all capture groups that
/// matched, or the whole match if the pattern has no groups.
fn match_regex(regex: &Regex, buffer: &str) -> Option<(String, String)> {
    let captures = regex.captures(buffer)?;
    let whole = captures.get(0).map(|m| m.as_str()).unwrap_or_default();
    let response = if captures.len() > 1 {
        captures
            .iter()
            .skip(1)
            .flatten()
            .map(|m| m.as_str())
            .collect::<String>()
    } else {
        whole.to_string()
    };
    Some((response, whole.to_string()))
}
