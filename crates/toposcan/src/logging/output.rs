// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logging output backends (console and file).
//!
//! The hook narrates every strategy it attempts, so log output is a product
//! surface here, not a debugging aid: the controller reads the same lines
//! over the control channel (see `channel::transport::ChannelOutput`).

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

/// Log level enumeration for filtering and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Debug: detailed development information
    Debug = 0,
    /// Info: general information about normal operation
    Info = 1,
    /// Warning: potentially harmful situations
    Warning = 2,
    /// Error: error conditions
    Error = 3,
}

impl LogLevel {
    /// Returns the string representation of the log level.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO ",
            Self::Warning => "WARN ",
            Self::Error => "ERROR",
        }
    }
}

/// Output destination trait for log messages.
///
/// Implementations must be thread-safe and handle errors gracefully; a
/// failing output must never take the hook down with it.
pub trait Output: Send + Sync {
    /// Write a formatted log message to the output.
    fn write(&self, level: LogLevel, message: &str) -> io::Result<()>;

    /// Flush any buffered output.
    fn flush(&self) -> io::Result<()>;
}

/// Console output implementation.
///
/// Writes to stderr with a level prefix. Mostly useful for the controller
/// tool and tests; inside the host process stderr usually goes nowhere.
pub struct ConsoleOutput {
    level_filter: LogLevel,
}

impl ConsoleOutput {
    /// Create a new console output with the specified minimum level.
    pub fn new(level_filter: LogLevel) -> Self {
        Self { level_filter }
    }
}

impl Output for ConsoleOutput {
    fn write(&self, level: LogLevel, message: &str) -> io::Result<()> {
        if level < self.level_filter {
            return Ok(());
        }
        eprint!("[{}] {}\n", level.as_str(), message);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// File output implementation.
///
/// Truncates the file on creation (each hook run starts a fresh log) and
/// appends level-prefixed lines. Thread-safe via internal mutex.
pub struct FileOutput {
    file: Mutex<std::fs::File>,
    level_filter: LogLevel,
}

impl FileOutput {
    /// Create a new file output, creating/truncating the file at the given path.
    pub fn new(path: &Path, level_filter: LogLevel) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(file),
            level_filter,
        })
    }
}

impl Output for FileOutput {
    fn write(&self, level: LogLevel, message: &str) -> io::Result<()> {
        if level < self.level_filter {
            return Ok(());
        }
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("file output mutex poisoned"))?;

        let output = format!("[{}] {}\n", level.as_str(), message);
        file.write_all(output.as_bytes())?;
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("file output mutex poisoned"))?
            .flush()
    }
}
