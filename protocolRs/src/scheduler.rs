//! Job scheduling for instrument drivers.
//!
//! Drivers use the [`DriverScheduler`] for periodic housekeeping, e.g., syncing the instrument
//! clock once a day or acquiring a status every few minutes. Jobs are added in batches with
//! [`DriverScheduler::add_config`] and fire on a background thread that the scheduler starts
//! when the first job is added.
//!
//! Polled jobs are special: they are usually run on request with [`DriverScheduler::run_job`],
//! which is refused if the job ran too recently. With a maximum interval, they also fire on their
//! own if nobody requested them for that long.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::{Callback, InstrumentError};

mod config;
mod cron;
mod trigger;

pub use config::{CronValue, JobConfig, TriggerConfig};
pub use cron::CronSpec;
pub use trigger::{IntervalSpec, TriggerSpec};

struct Job {
    trigger: TriggerSpec,
    callback: Arc<dyn Callback>,
    next_run: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, Job>,
    /// Id of the firing loop that should be running, if any.
    active_loop: Option<u64>,
    loops_started: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("Mutex should not be poisoned")
    }
}

/// Fires job callbacks according to their triggers.
///
/// # Example
///
/// ```
/// use std::{
///     collections::HashMap,
///     sync::{
///         Arc,
///         atomic::{AtomicUsize, Ordering},
///     },
/// };
///
/// use protocolrs::{
///     DriverScheduler, InstrumentError, JobConfig, TriggerConfig, scheduler::IntervalSpec,
/// };
///
/// let count = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&count);
///
/// let scheduler = DriverScheduler::new();
/// scheduler
///     .add_config(HashMap::from([(
///         "acquire_status".to_string(),
///         JobConfig::new(
///             TriggerConfig::polled(IntervalSpec::from_seconds(5), None),
///             Arc::new(move || -> Result<(), InstrumentError> {
///                 counter.fetch_add(1, Ordering::SeqCst);
///                 Ok(())
///             }),
///         ),
///     )]))
///     .unwrap();
///
/// assert!(scheduler.run_job("acquire_status").unwrap());
/// assert!(!scheduler.run_job("acquire_status").unwrap());
/// assert_eq!(count.load(Ordering::SeqCst), 1);
/// ```
pub struct DriverScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for DriverScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverScheduler")
            .field("jobs", &self.job_names())
            .finish_non_exhaustive()
    }
}

impl Default for DriverScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverScheduler {
    /// Create a scheduler without jobs. No thread is started until jobs are added.
    pub fn new() -> Self {
        DriverScheduler {
            shared: Arc::new(Shared::default()),
            worker: Mutex::new(None),
        }
    }

    /// Add a batch of jobs, keyed by their name.
    ///
    /// Either all jobs are added or none. A job replaces an existing job of the same name, unless
    /// one of the two is a polled job: polled jobs are looked up by name and must be unique.
    ///
    /// # Errors
    /// [`InstrumentError::Config`] if `jobs` is empty, if a trigger is invalid, if an absolute
    /// trigger lies in the past, if a cron trigger never fires, or if a polled job name is taken.
    pub fn add_config(&self, jobs: HashMap<String, JobConfig>) -> Result<(), InstrumentError> {
        if jobs.is_empty() {
            return Err(InstrumentError::Config(
                "No jobs given to the scheduler".to_string(),
            ));
        }

        let now = Utc::now();
        let mut validated = Vec::with_capacity(jobs.len());
        for (name, job) in jobs {
            let trigger = job.trigger.validate(&name)?;
            let next_run = trigger.first_fire_time(now);
            match &trigger {
                TriggerSpec::Absolute { at } if *at <= now => {
                    return Err(InstrumentError::Config(format!(
                        "Job '{name}': absolute trigger {at} lies in the past"
                    )));
                }
                TriggerSpec::Cron(cron) if next_run.is_none() => {
                    return Err(InstrumentError::Config(format!(
                        "Job '{name}': {cron} never fires"
                    )));
                }
                _ => {}
            }
            validated.push((
                name,
                Job {
                    trigger,
                    callback: job.callback,
                    next_run,
                    last_run: None,
                },
            ));
        }

        let mut state = self.shared.lock();
        for (name, job) in &validated {
            if let Some(existing) = state.jobs.get(name) {
                if existing.trigger.is_polled() || job.trigger.is_polled() {
                    return Err(InstrumentError::Config(format!(
                        "Job '{name}': a polled job of this name already exists"
                    )));
                }
            }
        }
        self.ensure_running(&mut state)?;

        for (name, job) in validated {
            info!(job = %name, trigger = ?job.trigger, next_run = ?job.next_run, "adding job");
            state.jobs.insert(name, job);
        }
        drop(state);
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Run the polled job `name` if it did not run within its minimum interval.
    ///
    /// Returns `true` if the job ran and `false` if it was refused. Errors of the callback are
    /// passed on, the job counts as run anyway.
    ///
    /// Fails with [`InstrumentError::JobLookup`] if there is no polled job named `name`.
    pub fn run_job(&self, name: &str) -> Result<bool, InstrumentError> {
        let callback = {
            let mut state = self.shared.lock();
            let job = state
                .jobs
                .get_mut(name)
                .filter(|job| job.trigger.is_polled())
                .ok_or_else(|| InstrumentError::JobLookup(name.to_string()))?;

            let now = Utc::now();
            let TriggerSpec::PolledInterval { min, .. } = job.trigger else {
                return Err(InstrumentError::JobLookup(name.to_string()));
            };
            if let Some(last_run) = job.last_run {
                if now < last_run + min.duration() {
                    debug!(job = %name, %last_run, "polled job ran too recently");
                    return Ok(false);
                }
            }
            job.last_run = Some(now);
            job.next_run = job.trigger.next_fire_time(now, now);
            Arc::clone(&job.callback)
        };
        self.shared.changed.notify_all();

        debug!(job = %name, "running polled job");
        callback.invoke()?;
        Ok(true)
    }

    /// Remove the job `name`.
    ///
    /// Unknown names are tolerated, e.g., an absolute job that just fired and removed itself.
    pub fn remove_job(&self, name: &str) {
        match self.shared.lock().jobs.remove(name) {
            Some(_) => info!(job = %name, "removed job"),
            None => warn!(job = %name, "cannot remove unknown job"),
        }
        self.shared.changed.notify_all();
    }

    /// Remove all jobs that invoke `callback`.
    ///
    /// Callbacks are compared by identity, i.e., it must be a clone of the `Arc` the job was
    /// created with.
    pub fn remove_callback(&self, callback: &Arc<dyn Callback>) {
        let mut state = self.shared.lock();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, job| !std::ptr::addr_eq(Arc::as_ptr(&job.callback), Arc::as_ptr(callback)));
        let removed = before - state.jobs.len();
        drop(state);

        if removed == 0 {
            warn!("cannot remove jobs of an unknown callback");
        } else {
            info!(removed, "removed jobs by callback");
        }
        self.shared.changed.notify_all();
    }

    /// Names of all scheduled jobs, sorted.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().jobs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop the firing thread and wait for it to finish. Jobs are kept and the thread is started
    /// again by the next call to [`DriverScheduler::add_config`].
    pub fn shutdown(&self) {
        self.shared.lock().active_loop = None;
        self.shared.changed.notify_all();

        let handle = self
            .worker
            .lock()
            .expect("Mutex should not be poisoned")
            .take();
        if let Some(handle) = handle {
            // A callback may drop the scheduler from its own thread.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }

    fn ensure_running(&self, state: &mut State) -> Result<(), InstrumentError> {
        let mut worker = self.worker.lock().expect("Mutex should not be poisoned");
        if worker.is_some() && state.active_loop.is_some() {
            return Ok(());
        }
        let id = state.loops_started + 1;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("driver-scheduler".to_string())
            .spawn(move || run_loop(shared, id))?;
        state.loops_started = id;
        state.active_loop = Some(id);
        debug!(id, "started scheduler thread");
        *worker = Some(handle);
        Ok(())
    }
}

impl Drop for DriverScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Fire due jobs until the scheduler shuts down or another loop took over.
fn run_loop(shared: Arc<Shared>, id: u64) {
    let mut state = shared.lock();
    while state.active_loop == Some(id) {
        let now = Utc::now();
        let due = take_due_jobs(&mut state, now);
        if !due.is_empty() {
            drop(state);
            for (name, callback) in due {
                debug!(job = %name, "firing job");
                if let Err(err) = callback.invoke() {
                    error!(job = %name, %err, "job failed");
                }
            }
            state = shared.lock();
            continue;
        }

        let next_run = state.jobs.values().filter_map(|job| job.next_run).min();
        state = match next_run {
            Some(next_run) => {
                let wait = (next_run - now).to_std().unwrap_or_default();
                shared
                    .changed
                    .wait_timeout(state, wait)
                    .expect("Mutex should not be poisoned")
                    .0
            }
            None => shared
                .changed
                .wait(state)
                .expect("Mutex should not be poisoned"),
        };
    }
    debug!(id, "scheduler thread stopped");
}

/// Collect the callbacks of all jobs due at `now` and schedule their next runs.
fn take_due_jobs(state: &mut State, now: DateTime<Utc>) -> Vec<(String, Arc<dyn Callback>)> {
    let mut due = Vec::new();
    let mut finished = Vec::new();
    for (name, job) in state.jobs.iter_mut() {
        let Some(scheduled) = job.next_run.filter(|next_run| *next_run <= now) else {
            continue;
        };
        due.push((name.clone(), Arc::clone(&job.callback)));
        if job.trigger.is_polled() {
            job.last_run = Some(now);
        }
        job.next_run = job.trigger.next_fire_time(scheduled, now);
        if job.next_run.is_none() && !job.trigger.is_polled() {
            finished.push(name.clone());
        }
    }
    for name in finished {
        debug!(job = %name, "job will not fire again, removing it");
        state.jobs.remove(&name);
    }
    due
}
