// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel transport: the duplex byte stream to the controller.
//!
//! One named local endpoint, one client at a time, line protocol both ways
//! (see [`super::protocol`]). The hook is the connecting side; the
//! controller (or a test harness) listens. A read or write failure marks
//! the channel disconnected, and the orchestrator treats that as an
//! implicit stop signal - a controller that goes away takes the run with
//! it.

use super::protocol::LineBuffer;
use crate::logging::{LogLevel, Output};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Transport-level failures.
#[derive(Debug)]
pub enum ChannelError {
    /// Could not reach the controller endpoint.
    ConnectFailed(io::Error),
    /// The peer went away (EOF or a failed read/write).
    Disconnected,
    /// Other I/O failure.
    Io(io::Error),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            Self::Disconnected => write!(f, "channel disconnected"),
            Self::Io(e) => write!(f, "channel I/O error: {}", e),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

struct RxState {
    buffer: LineBuffer,
    queued: VecDeque<String>,
}

/// One end of the control channel.
pub struct ChannelTransport {
    stream: Mutex<TcpStream>,
    rx: Mutex<RxState>,
    connected: AtomicBool,
}

impl ChannelTransport {
    /// Connect to a listening controller at `addr` (e.g. `127.0.0.1:7643`).
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, ChannelError> {
        let parsed: std::net::SocketAddr = addr
            .parse()
            .map_err(|e| ChannelError::ConnectFailed(io::Error::other(e)))?;
        let stream =
            TcpStream::connect_timeout(&parsed, timeout).map_err(ChannelError::ConnectFailed)?;
        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        Self {
            stream: Mutex::new(stream),
            rx: Mutex::new(RxState {
                buffer: LineBuffer::new(),
                queued: VecDeque::new(),
            }),
            connected: AtomicBool::new(true),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Send one raw, already-newline-terminated chunk.
    pub fn send_raw(&self, data: &str) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }
        let mut stream = self.stream.lock();
        let result = stream
            .write_all(data.as_bytes())
            .and_then(|_| stream.flush());
        if result.is_err() {
            self.connected.store(false, Ordering::Relaxed);
            return Err(ChannelError::Disconnected);
        }
        Ok(())
    }

    /// Send one line (newline appended).
    pub fn send_line(&self, line: &str) -> Result<(), ChannelError> {
        self.send_raw(&format!("{}\n", line))
    }

    /// Send a status frame.
    pub fn send_status(&self, total: u32, identified: u32, events: u64) -> Result<(), ChannelError> {
        self.send_raw(&super::protocol::encode_status(total, identified, events))
    }

    /// Send a snapshot document framed by `X|BEGIN` / `X|END`.
    ///
    /// The document's own lines travel raw; the framing lines are the only
    /// protocol overhead.
    pub fn send_snapshot(&self, document: &str) -> Result<(), ChannelError> {
        let mut framed = String::with_capacity(document.len() + 16);
        framed.push_str("X|BEGIN\n");
        framed.push_str(document);
        if !document.ends_with('\n') {
            framed.push('\n');
        }
        framed.push_str("X|END\n");
        self.send_raw(&framed)
    }

    /// Send the terminal completion marker.
    pub fn send_done(&self) -> Result<(), ChannelError> {
        self.send_raw(&super::protocol::encode_done())
    }

    /// Read one line, waiting up to `timeout`.
    ///
    /// `Ok(None)` means nothing arrived in time. `Err(Disconnected)` means
    /// the peer is gone - callers treat that as a stop signal.
    pub fn read_line(&self, timeout: Duration) -> Result<Option<String>, ChannelError> {
        {
            let mut rx = self.rx.lock();
            if let Some(line) = rx.queued.pop_front() {
                return Ok(Some(line));
            }
        }
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }

        let mut chunk = [0u8; 4096];
        let read = {
            let stream = self.stream.lock();
            stream.set_read_timeout(Some(timeout)).ok();
            let mut stream_ref = &*stream;
            stream_ref.read(&mut chunk)
        };

        match read {
            Ok(0) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(ChannelError::Disconnected)
            }
            Ok(n) => {
                let mut rx = self.rx.lock();
                for line in rx.buffer.push(&chunk[..n]) {
                    rx.queued.push_back(line);
                }
                Ok(rx.queued.pop_front())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(_) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(ChannelError::Disconnected)
            }
        }
    }

    /// Non-blocking check for a stop condition: an explicit `STOP` line or
    /// a dead channel.
    pub fn check_stop(&self) -> bool {
        loop {
            match self.read_line(Duration::from_millis(1)) {
                Ok(Some(line)) if line == "STOP" => return true,
                Ok(Some(_)) => continue,
                Ok(None) => return false,
                Err(_) => return true,
            }
        }
    }

    /// Drop the connection.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let stream = self.stream.lock();
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Listening side of the channel (controller tool and test harnesses).
pub struct ChannelListener {
    listener: TcpListener,
}

impl ChannelListener {
    /// Bind the named local endpoint. `addr` like `127.0.0.1:0` picks a
    /// free port, reported by [`local_addr`](Self::local_addr).
    pub fn bind(addr: &str) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(addr).map_err(ChannelError::ConnectFailed)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ChannelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the single client.
    pub fn accept(&self) -> Result<ChannelTransport, ChannelError> {
        let (stream, _) = self.listener.accept().map_err(ChannelError::Io)?;
        Ok(ChannelTransport::from_stream(stream))
    }
}

/// Logging output that forwards every line as `L|` over the channel.
pub struct ChannelOutput {
    transport: Arc<ChannelTransport>,
    level_filter: LogLevel,
}

impl ChannelOutput {
    pub fn new(transport: Arc<ChannelTransport>, level_filter: LogLevel) -> Self {
        Self {
            transport,
            level_filter,
        }
    }
}

impl Output for ChannelOutput {
    fn write(&self, level: LogLevel, message: &str) -> io::Result<()> {
        if level < self.level_filter {
            return Ok(());
        }
        // Failures are deliberately dropped: the logger must not error out
        // because the controller went away mid-run.
        let _ = self
            .transport
            .send_raw(&super::protocol::encode_log(message));
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}
