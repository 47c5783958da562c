//! The loopback module provides an instrument simulator for testing purposes.
//!
//! The [`LoopbackInterface`] is a [`ByteSink`] that knows which commands the host will send, in
//! order, and what the instrument answers to each of them. Answers are delivered to whatever
//! receive callback was connected through [`LoopbackInterface::receiver`], right when the command
//! is complete, just like a real transport's reader thread would.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use crate::{ByteSink, InstrumentError};

/// A self-incrementing index structure that by default starts at 0 and increments whenever `next`
/// is called.
#[derive(Debug, Default)]
struct IncrIndex {
    index: usize,
}

impl IncrIndex {
    fn next(&mut self) -> usize {
        let current = self.index;
        self.index += 1;
        current
    }

    fn current(&self) -> usize {
        self.index
    }
}

type ReceiveFn = Box<dyn FnMut(&[u8]) + Send>;

/// The receive side of a [`LoopbackInterface`].
///
/// Cloning gives another handle to the same receive path.
#[derive(Clone, Default)]
pub struct LoopbackReceiver {
    callback: Arc<Mutex<Option<ReceiveFn>>>,
}

impl fmt::Debug for LoopbackReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackReceiver").finish_non_exhaustive()
    }
}

impl LoopbackReceiver {
    /// Deliver everything the simulated instrument sends to `callback`.
    pub fn connect<F>(&self, callback: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        *self.callback.lock().expect("Mutex should not be poisoned") = Some(Box::new(callback));
    }

    fn deliver(&self, bytes: &[u8]) {
        let mut callback = self.callback.lock().expect("Mutex should not be poisoned");
        let callback = callback
            .as_mut()
            .expect("The instrument answered, but no receiver is connected.");
        callback(bytes);
    }
}

/// An interface that allows you to simply write tests for your instrument protocol.
///
/// # Example
///
/// ```
/// use std::sync::{Arc, Mutex};
///
/// use protocolrs::{ByteSink, LoopbackInterface};
///
/// let mut loopback = LoopbackInterface::new(vec!["*IDN?\r\n", "RST\r\n"], vec!["PUMP v1\r\n>", ""]);
/// let received = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&received);
/// loopback
///     .receiver()
///     .connect(move |bytes| sink.lock().unwrap().extend_from_slice(bytes));
///
/// loopback.send("*IDN?\r\n").unwrap();
/// assert_eq!(received.lock().unwrap().as_slice(), b"PUMP v1\r\n>");
///
/// // Commands may be written in pieces, e.g., one character at a time.
/// loopback.send("RS").unwrap();
/// loopback.send("T\r\n").unwrap();
/// loopback.finalize();
/// ```
pub struct LoopbackInterface {
    from_host: Vec<Vec<u8>>,
    from_inst: Vec<Vec<u8>>,
    index: IncrIndex,
    curr_cmd: Vec<u8>,
    receiver: LoopbackReceiver,
}

impl fmt::Debug for LoopbackInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackInterface")
            .field("index", &self.index)
            .field("curr_cmd", &String::from_utf8_lossy(&self.curr_cmd))
            .finish_non_exhaustive()
    }
}

impl LoopbackInterface {
    /// Create a new loopback instrument with given commands to and from the instrument.
    ///
    /// The main purpose of this interface is to provide a simple loopback interface for testing
    /// of protocols. Every entry in `from_host` is a command that the host is expected to send,
    /// the entry with the same index in `from_inst` is what the instrument answers once the
    /// command is complete. Use an empty answer for commands the instrument does not answer.
    ///
    /// Whenever something is sent to the instrument that is not expected, the
    /// [`LoopbackInterface`] panics. When it is dropped, [`LoopbackInterface::finalize`] checks
    /// that all commands were sent. This way, your tests can ensure easily that exactly the
    /// commands you provided are sent, in the correct order.
    ///
    /// # Arguments:
    /// * `from_host` - Commands from host to instrument.
    /// * `from_inst` - Answers from instrument to host.
    ///
    /// # Panics
    /// If `from_host` and `from_inst` differ in length.
    pub fn new<T: AsRef<[u8]>>(from_host: Vec<T>, from_inst: Vec<T>) -> Self {
        assert_eq!(
            from_host.len(),
            from_inst.len(),
            "Every command from the host needs an answer from the instrument (which may be empty)."
        );
        LoopbackInterface {
            from_host: from_host.iter().map(|c| c.as_ref().to_vec()).collect(),
            from_inst: from_inst.iter().map(|c| c.as_ref().to_vec()).collect(),
            index: IncrIndex::default(),
            curr_cmd: Vec::new(),
            receiver: LoopbackReceiver::default(),
        }
    }

    /// A handle to connect the receive path to.
    pub fn receiver(&self) -> LoopbackReceiver {
        self.receiver.clone()
    }

    /// This command panics if not all commands in the [`LoopbackInterface`] have been used.
    ///
    /// It is automatically called when the [`LoopbackInterface`] is dropped, but you can also call
    /// it manually to ensure that all commands have been used.
    pub fn finalize(&mut self) {
        if !self.curr_cmd.is_empty() {
            panic!(
                "Incomplete command from host to instrument: {:?}",
                String::from_utf8_lossy(&self.curr_cmd)
            );
        }
        if let Some(leftover) = self.from_host.get(self.index.current()) {
            panic!(
                "Leftover expected commands found from host to instrument: {:?}",
                String::from_utf8_lossy(leftover)
            );
        }
    }
}

impl ByteSink for LoopbackInterface {
    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        let idx = self.index.current();
        let expected = self.from_host.get(idx).unwrap_or_else(|| {
            panic!(
                "No more commands were expected from host to instrument, got {:?}",
                String::from_utf8_lossy(data)
            )
        });

        self.curr_cmd.extend_from_slice(data);
        assert!(
            expected.starts_with(&self.curr_cmd),
            "Expected sendcmd {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&self.curr_cmd)
        );

        if self.curr_cmd.len() == expected.len() {
            self.curr_cmd.clear();
            let idx = self.index.next();
            if !self.from_inst[idx].is_empty() {
                self.receiver.deliver(&self.from_inst[idx]);
            }
        }
        Ok(())
    }
}

impl Drop for LoopbackInterface {
    fn drop(&mut self) {
        // Do not turn a failing test into an abort.
        if !std::thread::panicking() {
            self.finalize();
        }
    }
}

// Tests of internal functionality
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incrementing_index() {
        let mut idx = IncrIndex::default();
        assert_eq!(0, idx.next());
        assert_eq!(1, idx.next());
        assert_eq!(2, idx.current());
    }
}
