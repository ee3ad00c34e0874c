//! Invocation log plumbing.
//!
//! Each invocation owns a [`LogOutput`] that collects harness-side output for
//! the duration of the run. The engine registers it with the process-wide
//! [`LogRegistry`] on entry and is responsible for unregistering it on every
//! exit path; unregistering twice is safe. [`StreamSource`]s are the handles
//! log data travels through on its way to listeners, and must be cancelled
//! once all listeners have consumed them.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::warn;
use uuid::Uuid;

/// A re-openable source of log data.
pub trait StreamSource: Send + Sync {
    /// Opens a fresh reader over the underlying data.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Releases the source. Must be called once all consumers are done with
    /// it; reads after cancellation fail.
    fn cancel(&self);
}

/// An in-memory [`StreamSource`] over a byte buffer.
pub struct ByteStreamSource {
    data: Vec<u8>,
    cancelled: AtomicBool,
}

impl ByteStreamSource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl StreamSource for ByteStreamSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        if self.is_cancelled() {
            return Err(io::Error::other("stream source has been cancelled"));
        }
        Ok(Box::new(io::Cursor::new(self.data.clone())))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Destination for one invocation's harness-side log output.
pub trait LogOutput: Send + Sync {
    /// Prepares the output for writing.
    fn init(&self) -> io::Result<()>;

    /// Appends one line of log output.
    fn append(&self, line: &str);

    /// A source over everything logged so far.
    fn get_log(&self) -> io::Result<Box<dyn StreamSource>>;

    /// Closes the output; appends after closing are dropped.
    fn close_log(&self);

    /// Creates an independent output with the same settings.
    ///
    /// This is the value copy used when cloning a configuration: the new
    /// output starts empty and is released by whichever invocation owns it.
    fn clone_output(&self) -> Arc<dyn LogOutput>;
}

/// An in-memory [`LogOutput`].
pub struct BufferLogOutput {
    buffer: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl BufferLogOutput {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for BufferLogOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl LogOutput for BufferLogOutput {
    fn init(&self) -> io::Result<()> {
        Ok(())
    }

    fn append(&self, line: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut buffer = self.buffer.lock().unwrap();
        buffer.extend_from_slice(line.as_bytes());
        buffer.push(b'\n');
    }

    fn get_log(&self) -> io::Result<Box<dyn StreamSource>> {
        let buffer = self.buffer.lock().unwrap();
        Ok(Box::new(ByteStreamSource::new(buffer.clone())))
    }

    fn close_log(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn clone_output(&self) -> Arc<dyn LogOutput> {
        Arc::new(BufferLogOutput::new())
    }
}

/// Handle returned by [`LogRegistry::register_logger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerHandle(Uuid);

/// Process-wide registry of active invocation loggers.
///
/// Every engine running in the process registers its logger here at start.
/// Unregistering is idempotent: the happy path unregisters while reporting
/// logs, and the engine's cleanup path unregisters again.
pub struct LogRegistry {
    loggers: Mutex<HashMap<Uuid, Arc<dyn LogOutput>>>,
    global_log: Mutex<Vec<u8>>,
}

impl LogRegistry {
    pub fn new() -> Self {
        Self {
            loggers: Mutex::new(HashMap::new()),
            global_log: Mutex::new(Vec::new()),
        }
    }

    /// The shared registry for this process.
    pub fn global() -> Arc<LogRegistry> {
        static GLOBAL: OnceLock<Arc<LogRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(LogRegistry::new())))
    }

    pub fn register_logger(&self, logger: Arc<dyn LogOutput>) -> LoggerHandle {
        let handle = LoggerHandle(Uuid::new_v4());
        self.loggers.lock().unwrap().insert(handle.0, logger);
        handle
    }

    /// Removes a registration. Safe to call more than once.
    pub fn unregister_logger(&self, handle: LoggerHandle) {
        self.loggers.lock().unwrap().remove(&handle.0);
    }

    pub fn is_registered(&self, handle: LoggerHandle) -> bool {
        self.loggers.lock().unwrap().contains_key(&handle.0)
    }

    /// Number of loggers currently registered.
    pub fn active_logger_count(&self) -> usize {
        self.loggers.lock().unwrap().len()
    }

    /// Copies the contents of the given logger into the process-wide log.
    ///
    /// Failures are logged and swallowed; a broken invocation log must not
    /// take the surrounding engine down with it.
    pub fn dump_to_global_log(&self, logger: &dyn LogOutput) {
        let source = match logger.get_log() {
            Ok(source) => source,
            Err(e) => {
                warn!("could not fetch invocation log for global dump: {e}");
                return;
            }
        };
        match source.open() {
            Ok(mut reader) => {
                let mut contents = Vec::new();
                if let Err(e) = reader.read_to_end(&mut contents) {
                    warn!("could not read invocation log for global dump: {e}");
                } else {
                    self.global_log.lock().unwrap().extend_from_slice(&contents);
                }
            }
            Err(e) => warn!("could not open invocation log for global dump: {e}"),
        }
        source.cancel();
    }

    /// Everything dumped into the process-wide log so far.
    pub fn global_log_contents(&self) -> Vec<u8> {
        self.global_log.lock().unwrap().clone()
    }
}

impl Default for LogRegistry {
    fn default() -> Self {
        Self::new()
    }
}
