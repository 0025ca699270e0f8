// Log routing
//
// Every diagnostic the core produces on behalf of the client (backend
// validation output, shadow-model violations) goes through one callback
// supplied at renderer creation. Lifecycle chatter uses the `log` facade
// directly.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Severity tag attached to every routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Info,
    Warn,
    Debug,
    Error,
}

impl LogLevel {
    fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Error => log::Level::Error,
        }
    }
}

type LogFnInner = dyn Fn(LogLevel, &str, &str) + Send + Sync;

/// Client-supplied log sink: `(level, component, message)`
#[derive(Clone)]
pub struct LogCallback(Arc<LogFnInner>);

impl LogCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(LogLevel, &str, &str) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Forwards to the `log` facade
    pub fn forward_to_log() -> Self {
        Self::new(|level, component, message| {
            log::log!(target: "tiny_renderer", level.as_log_level(), "[{}] {}", component, message);
        })
    }

    pub fn call(&self, level: LogLevel, component: &str, message: &str) {
        (self.0)(level, component, message)
    }
}

impl Default for LogCallback {
    fn default() -> Self {
        Self::forward_to_log()
    }
}

impl fmt::Debug for LogCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogCallback(..)")
    }
}

/// Shared sink used by the core and the backends.
///
/// Counts errors and warnings so a caller (or a test) can tell whether any
/// validation path fired without scraping log output.
#[derive(Clone, Debug)]
pub struct Messenger {
    callback: LogCallback,
    errors: Arc<AtomicUsize>,
    warnings: Arc<AtomicUsize>,
}

impl Messenger {
    pub fn new(callback: LogCallback) -> Self {
        Self {
            callback,
            errors: Arc::new(AtomicUsize::new(0)),
            warnings: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn log(&self, level: LogLevel, component: &str, message: &str) {
        match level {
            LogLevel::Error => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
            LogLevel::Warn => {
                self.warnings.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        self.callback.call(level, component, message);
    }

    pub fn info(&self, component: &str, message: &str) {
        self.log(LogLevel::Info, component, message);
    }

    pub fn warn(&self, component: &str, message: &str) {
        self.log(LogLevel::Warn, component, message);
    }

    pub fn debug(&self, component: &str, message: &str) {
        self.log(LogLevel::Debug, component, message);
    }

    pub fn error(&self, component: &str, message: &str) {
        self.log(LogLevel::Error, component, message);
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }
}

impl Default for Messenger {
    fn default() -> Self {
        Self::new(LogCallback::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn messenger_counts_by_level() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let messenger = Messenger::new(LogCallback::new(move |level, component, message| {
            sink.lock().push((level, component.to_string(), message.to_string()));
        }));

        messenger.info("test", "hello");
        messenger.error("test", "bad");
        messenger.warn("test", "careful");
        messenger.error("test", "worse");

        assert_eq!(messenger.error_count(), 2);
        assert_eq!(messenger.warning_count(), 1);
        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[1], (LogLevel::Error, "test".to_string(), "bad".to_string()));
    }

    #[test]
    fn clones_share_counters() {
        let messenger = Messenger::new(LogCallback::new(|_, _, _| {}));
        let clone = messenger.clone();
        clone.error("x", "y");
        assert_eq!(messenger.error_count(), 1);
    }
}
