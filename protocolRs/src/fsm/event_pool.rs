//! Worker threads that execute asynchronously raised events.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        mpsc::{self, Receiver, Sender},
    },
    thread,
};

use tracing::debug;

use crate::InstrumentError;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed number of worker threads draining one queue of jobs.
///
/// Workers are spawned on the first submission. Submitting never blocks. The workers exit once
/// the pool is dropped and the queue is drained.
pub(crate) struct EventPool {
    workers: usize,
    sender: Mutex<Option<Sender<Job>>>,
}

impl EventPool {
    pub(crate) fn new(workers: usize) -> Self {
        EventPool {
            workers,
            sender: Mutex::new(None),
        }
    }

    pub(crate) fn submit(&self, job: Job) -> Result<(), InstrumentError> {
        let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.is_none() {
            *sender = Some(self.spawn_workers()?);
        }
        match sender.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| {
                InstrumentError::Protocol("Asynchronous event workers are gone".to_string())
            }),
            None => Err(InstrumentError::Protocol(
                "Asynchronous event workers could not be started".to_string(),
            )),
        }
    }

    fn spawn_workers(&self) -> Result<Sender<Job>, InstrumentError> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for idx in 0..self.workers {
            let rx = Arc::clone(&rx);
            thread::Builder::new()
                .name(format!("fsm-event-{idx}"))
                .spawn(move || work(&rx))?;
        }
        debug!(workers = self.workers, "asynchronous event workers started");
        Ok(tx)
    }
}

fn work(rx: &Mutex<Receiver<Job>>) {
    loop {
        // The lock is released before the job runs, such that other workers can pick up jobs.
        let job = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}
