//! Thread-safe invocation log.
//!
//! A byte buffer plus a mutex plus a write-listener callback. Writers
//! (the command runner's stdio pump, and the action runner itself for
//! synthetic lines) append through [`InvocationLog::write`], which also
//! tees the bytes to standard error on a best-effort basis and then
//! invokes the installed listener *outside* the buffer lock, so the
//! listener is free to call back into the log (e.g. to `consume` it)
//! without deadlocking.

use std::io::Write as _;
use std::sync::{Arc, Mutex, RwLock};

use runner_types::OutputSink;

type Listener = Arc<dyn Fn() + Send + Sync>;

/// A byte sink that tees to stderr and notifies a listener on every write.
pub struct InvocationLog {
    buffer: Mutex<Vec<u8>>,
    listener: RwLock<Option<Listener>>,
}

impl Default for InvocationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InvocationLog {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            listener: RwLock::new(None),
        }
    }

    /// Install the write listener. There is exactly one listener,
    /// installed by the owning action runner after construction and
    /// before the command loop starts.
    pub fn set_write_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.listener.write().expect("listener lock poisoned") = Some(Arc::new(listener));
    }

    /// Current buffered byte count, for the flush-threshold check.
    pub fn len(&self) -> usize {
        self.buffer.lock().expect("log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically swap out the accumulated bytes, emptying the buffer.
    ///
    /// No byte appears twice across successive calls; no byte written
    /// before this call is lost.
    pub fn consume(&self) -> Vec<u8> {
        let mut buffer = self.buffer.lock().expect("log lock poisoned");
        std::mem::take(&mut *buffer)
    }

    /// Convenience emitter for a formatted line (newline appended).
    pub fn writeln(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.write(&bytes);
    }
}

impl OutputSink for InvocationLog {
    fn write(&self, bytes: &[u8]) {
        {
            let mut buffer = self.buffer.lock().expect("log lock poisoned");
            buffer.extend_from_slice(bytes);
        }

        // Best-effort: a closed or broken stderr must never fail a write.
        let _ = std::io::stderr().write_all(bytes);

        let listener = self.listener.read().expect("listener lock poisoned").clone();
        if let Some(listener) = listener {
            listener();
        }
    }
}
