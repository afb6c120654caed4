//! The service-owned logger slot.
//!
//! Embedders register a single log callback while the service is still
//! configured; the runtime forwards its semantic log lines there, filtered
//! by the `log_level` option. Internal diagnostics additionally flow
//! through `tracing` regardless of the slot.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;

use brypt_types::{Error, LogLevel, Result};

use crate::sync::lock;

/// The registered log sink.
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// A set-once logger slot with a dynamic level filter.
pub struct LoggerSlot {
    callback: StdMutex<Option<LogCallback>>,
    minimum: AtomicU8,
}

impl Default for LoggerSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggerSlot {
    pub fn new() -> Self {
        Self {
            callback: StdMutex::new(None),
            minimum: AtomicU8::new(level_rank(LogLevel::Info)),
        }
    }

    /// Install the callback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] when a logger is already registered.
    pub fn register(&self, callback: LogCallback) -> Result<()> {
        let mut slot = lock(&self.callback);
        if slot.is_some() {
            return Err(Error::Conflict);
        }
        *slot = Some(callback);
        Ok(())
    }

    /// Adjust the minimum forwarded level.
    pub fn set_level(&self, level: LogLevel) {
        self.minimum.store(level_rank(level), Ordering::SeqCst);
    }

    /// Forward one line to the registered callback and to `tracing`.
    pub fn emit(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!("{message}"),
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
            LogLevel::Off => {}
        }
        if level_rank(level) < self.minimum.load(Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = lock(&self.callback).as_ref() {
            callback(level, message);
        }
    }
}

fn level_rank(level: LogLevel) -> u8 {
    match level {
        LogLevel::Trace => 0,
        LogLevel::Debug => 1,
        LogLevel::Info => 2,
        LogLevel::Warn => 3,
        LogLevel::Error => 4,
        LogLevel::Off => 5,
    }
}
