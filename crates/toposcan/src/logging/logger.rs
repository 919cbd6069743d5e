// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global logger instance.
//!
//! Unlike a conventional init-once logger, outputs here are replaceable at
//! runtime: the hook starts logging to a scratch file before any
//! configuration exists, then re-targets to the configured log directory and
//! additionally attaches the control-channel tee once the controller is
//! connected. `swap_file_output` and `attach_tee` exist for exactly those
//! two moments; nothing else mutates the output set.

use super::output::{LogLevel, Output};
use std::io;
use std::sync::{Arc, Mutex, OnceLock};

static LOGGER: OnceLock<Arc<Mutex<GlobalLogger>>> = OnceLock::new();

/// Global logger state.
///
/// Holds one primary output (console or file) and one optional tee output
/// (the control channel). All operations are thread-safe via the outer mutex.
pub struct GlobalLogger {
    primary: Option<Arc<dyn Output>>,
    tee: Option<Arc<dyn Output>>,
    level_filter: LogLevel,
}

impl GlobalLogger {
    fn new() -> Self {
        Self {
            primary: None,
            tee: None,
            level_filter: LogLevel::Info,
        }
    }

    fn log(&self, level: LogLevel, message: &str) -> io::Result<()> {
        if level < self.level_filter {
            return Ok(());
        }
        if let Some(ref primary) = self.primary {
            primary.write(level, message)?;
        }
        if let Some(ref tee) = self.tee {
            // Tee failures are swallowed: a dead channel must not stop
            // file logging, and disconnect handling lives in the transport.
            let _ = tee.write(level, message);
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        if let Some(ref primary) = self.primary {
            primary.flush()?;
        }
        if let Some(ref tee) = self.tee {
            let _ = tee.flush();
        }
        Ok(())
    }
}

fn logger() -> &'static Arc<Mutex<GlobalLogger>> {
    LOGGER.get_or_init(|| Arc::new(Mutex::new(GlobalLogger::new())))
}

/// Initialize the global logger with a primary output and level filter.
///
/// May be called again to replace the primary output (the hook does this
/// once the configured log directory is known).
pub fn init_logger(output: Arc<dyn Output>, level: LogLevel) {
    if let Ok(mut guard) = logger().lock() {
        guard.primary = Some(output);
        guard.level_filter = level;
    }
}

/// Replace the primary output, keeping the current level filter and tee.
pub fn swap_file_output(output: Arc<dyn Output>) {
    if let Ok(mut guard) = logger().lock() {
        guard.primary = Some(output);
    }
}

/// Attach (or detach, with `None`) the secondary tee output.
pub fn attach_tee(output: Option<Arc<dyn Output>>) {
    if let Ok(mut guard) = logger().lock() {
        guard.tee = output;
    }
}

/// Internal: write one message through the global logger.
///
/// No-op if the logger was never initialized. Called by the logging macros.
#[inline]
pub fn log_message(level: LogLevel, message: &str) -> io::Result<()> {
    let guard = logger()
        .lock()
        .map_err(|_| io::Error::other("global logger mutex poisoned"))?;
    guard.log(level, message)
}

/// Flush the global logger's outputs.
pub fn flush_logger() -> io::Result<()> {
    let guard = logger()
        .lock()
        .map_err(|_| io::Error::other("global logger mutex poisoned"))?;
    guard.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOutput {
        written: AtomicUsize,
    }

    impl Output for CountingOutput {
        fn write(&self, _level: LogLevel, _message: &str) -> io::Result<()> {
            self.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn flush(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_log_message_no_panic_uninitialized() {
        assert!(log_message(LogLevel::Info, "test message").is_ok());
        assert!(flush_logger().is_ok());
    }

    #[test]
    fn test_tee_receives_messages() {
        let primary = Arc::new(CountingOutput {
            written: AtomicUsize::new(0),
        });
        let tee = Arc::new(CountingOutput {
            written: AtomicUsize::new(0),
        });

        init_logger(primary.clone(), LogLevel::Debug);
        attach_tee(Some(tee.clone()));

        log_message(LogLevel::Info, "hello").unwrap();
        assert!(primary.written.load(Ordering::SeqCst) >= 1);
        assert!(tee.written.load(Ordering::SeqCst) >= 1);

        attach_tee(None);
        let before = tee.written.load(Ordering::SeqCst);
        log_message(LogLevel::Info, "after detach").unwrap();
        assert_eq!(tee.written.load(Ordering::SeqCst), before);
    }
}
