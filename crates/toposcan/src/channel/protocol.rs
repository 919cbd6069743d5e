// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control protocol: newline-terminated tagged text lines.
//!
//! Controller to hook:
//!
//! ```text
//! C|MODE=monitor        configuration entries, any order
//! C|LOGDIR=/tmp/scan
//! C|DRIVER=AB_ETH-1     opens a target; ADDR/NEWDRIVER attach to it
//! C|ADDR=10.0.0.5
//! C|NEWDRIVER=1
//! C|END                 configuration complete
//! STOP                  unframed, valid at any time
//! ```
//!
//! Hook to controller:
//!
//! ```text
//! L|<text>                         log line
//! S|<total>|<identified>|<events>  status
//! X|BEGIN ... X|END                snapshot document, raw lines between
//! D|                               graceful completion
//! ```
//!
//! Unknown `C|` keys are ignored - newer controllers may send keys this
//! hook has never heard of, and that must not break configuration.

use crate::config::{DriverTarget, HookConfig, HookMode};
use std::fmt;
use std::path::PathBuf;

/// One parsed controller-to-hook line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    /// `C|KEY=VALUE` (flags arrive as `KEY=1`).
    Config { key: String, value: String },
    /// `C|END`
    ConfigEnd,
    /// Unframed `STOP`.
    Stop,
    /// Anything unrecognized; logged and dropped.
    Other(String),
}

/// One parsed hook-to-controller line (controller side decodes these).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportLine {
    Log(String),
    Status {
        total: u32,
        identified: u32,
        events: u64,
    },
    SnapshotBegin,
    SnapshotEnd,
    Done,
    /// Raw snapshot content between `X|BEGIN` and `X|END`.
    Payload(String),
}

/// Protocol-level failures.
#[derive(Debug)]
pub enum ProtocolError {
    /// `C|END` arrived without a single usable target.
    NoTargets,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTargets => write!(f, "configuration complete but no driver targets supplied"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Parse one controller-to-hook line.
pub fn parse_control_line(line: &str) -> ControlLine {
    if line == "STOP" {
        return ControlLine::Stop;
    }
    if line == "C|END" {
        return ControlLine::ConfigEnd;
    }
    if let Some(body) = line.strip_prefix("C|") {
        let (key, value) = match body.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (body.to_string(), String::new()),
        };
        return ControlLine::Config { key, value };
    }
    ControlLine::Other(line.to_string())
}

/// Parse one hook-to-controller line. `in_snapshot` selects payload mode
/// between the snapshot markers.
pub fn parse_report_line(line: &str, in_snapshot: bool) -> ReportLine {
    match line {
        "X|BEGIN" => return ReportLine::SnapshotBegin,
        "X|END" => return ReportLine::SnapshotEnd,
        "D|" => return ReportLine::Done,
        _ => {}
    }
    if in_snapshot {
        return ReportLine::Payload(line.to_string());
    }
    if let Some(text) = line.strip_prefix("L|") {
        return ReportLine::Log(text.to_string());
    }
    if let Some(body) = line.strip_prefix("S|") {
        let mut fields = body.split('|');
        let total = fields.next().and_then(|f| f.parse().ok());
        let identified = fields.next().and_then(|f| f.parse().ok());
        let events = fields.next().and_then(|f| f.parse().ok());
        if let (Some(total), Some(identified), Some(events)) = (total, identified, events) {
            return ReportLine::Status {
                total,
                identified,
                events,
            };
        }
    }
    // Lines that fit no frame are treated as logs so nothing is lost.
    ReportLine::Log(line.to_string())
}

/// Encode helpers for the hook side.
pub fn encode_log(text: &str) -> String {
    format!("L|{}\n", text)
}

pub fn encode_status(total: u32, identified: u32, events: u64) -> String {
    format!("S|{}|{}|{}\n", total, identified, events)
}

pub fn encode_done() -> String {
    "D|\n".to_string()
}

/// Encode helpers for the controller side.
pub fn encode_config(key: &str, value: &str) -> String {
    format!("C|{}={}\n", key, value)
}

pub fn encode_config_end() -> String {
    "C|END\n".to_string()
}

pub fn encode_stop() -> String {
    "STOP\n".to_string()
}

/// Accumulates raw bytes and yields complete lines.
///
/// Split on `\n`, trailing `\r` trimmed. No length prefixes anywhere:
/// partial lines wait in the buffer for the next read.
#[derive(Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line completed by them.
    ///
    /// Non-UTF8 byte sequences are replaced rather than rejected; the
    /// protocol is text and a corrupt line is better logged than fatal.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(bytes));

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Assembles a [`HookConfig`] from `C|` lines.
pub struct ConfigBuilder {
    config: HookConfig,
    complete: bool,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HookConfig::default(),
            complete: false,
        }
    }

    /// `true` once `C|END` has been applied.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Apply one parsed line. Unknown keys are ignored by design.
    pub fn apply(&mut self, line: &ControlLine) {
        match line {
            ControlLine::ConfigEnd => self.complete = true,
            ControlLine::Config { key, value } => self.apply_entry(key, value),
            ControlLine::Stop | ControlLine::Other(_) => {}
        }
    }

    fn apply_entry(&mut self, key: &str, value: &str) {
        match key {
            "MODE" => {
                self.config.mode = match value {
                    "monitor" => HookMode::Monitor,
                    _ => HookMode::OneShot,
                };
            }
            "LOGDIR" => self.config.log_dir = PathBuf::from(value),
            "DRIVER" => self.config.drivers.push(DriverTarget {
                name: value.to_string(),
                addresses: Vec::new(),
                new_driver: false,
            }),
            "ADDR" => {
                if let Some(driver) = self.config.drivers.last_mut() {
                    driver.addresses.push(value.to_string());
                }
            }
            "NEWDRIVER" => {
                if value == "1" {
                    if let Some(driver) = self.config.drivers.last_mut() {
                        driver.new_driver = true;
                    }
                }
            }
            "DEBUGSNAP" => self.config.debug_snapshots = value == "1",
            "PROBE" => self.config.probe_details = value == "1",
            other => {
                crate::debug!("[config] ignoring unknown key '{}'", other);
            }
        }
    }

    /// Finish assembly. A configuration without targets is unusable.
    pub fn finish(self) -> Result<HookConfig, ProtocolError> {
        if self.config.drivers.is_empty() {
            return Err(ProtocolError::NoTargets);
        }
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_lines() {
        assert_eq!(parse_control_line("STOP"), ControlLine::Stop);
        assert_eq!(parse_control_line("C|END"), ControlLine::ConfigEnd);
        assert_eq!(
            parse_control_line("C|DRIVER=AB_ETH-1"),
            ControlLine::Config {
                key: "DRIVER".into(),
                value: "AB_ETH-1".into()
            }
        );
        assert_eq!(
            parse_control_line("garbage"),
            ControlLine::Other("garbage".into())
        );
    }

    #[test]
    fn test_parse_report_lines() {
        assert_eq!(
            parse_report_line("L|phase 2 starting", false),
            ReportLine::Log("phase 2 starting".into())
        );
        assert_eq!(
            parse_report_line("S|12|3|47", false),
            ReportLine::Status {
                total: 12,
                identified: 3,
                events: 47
            }
        );
        assert_eq!(parse_report_line("X|BEGIN", false), ReportLine::SnapshotBegin);
        assert_eq!(
            parse_report_line("<device classname=\"X\"/>", true),
            ReportLine::Payload("<device classname=\"X\"/>".into())
        );
        assert_eq!(parse_report_line("X|END", true), ReportLine::SnapshotEnd);
        assert_eq!(parse_report_line("D|", false), ReportLine::Done);
    }

    #[test]
    fn test_status_round_trip() {
        let encoded = encode_status(12, 3, 47);
        assert_eq!(
            parse_report_line(encoded.trim_end(), false),
            ReportLine::Status {
                total: 12,
                identified: 3,
                events: 47
            }
        );
    }

    #[test]
    fn test_line_buffer_reassembles_fragments() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"C|DRIV").is_empty());
        let lines = buf.push(b"ER=Test\r\nC|ADDR=10.0");
        assert_eq!(lines, vec!["C|DRIVER=Test".to_string()]);
        let lines = buf.push(b".0.5\nC|END\n");
        assert_eq!(
            lines,
            vec!["C|ADDR=10.0.0.5".to_string(), "C|END".to_string()]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_config_assembly() {
        let mut builder = ConfigBuilder::new();
        for raw in [
            "C|MODE=monitor",
            "C|LOGDIR=/tmp/scan",
            "C|DRIVER=AB_ETH-1",
            "C|ADDR=10.0.0.5",
            "C|ADDR=10.0.0.9",
            "C|NEWDRIVER=1",
            "C|DRIVER=AB_ETH-2",
            "C|ADDR=192.168.1.20",
            "C|DEBUGSNAP=1",
            "C|END",
        ] {
            builder.apply(&parse_control_line(raw));
        }
        assert!(builder.is_complete());
        let config = builder.finish().unwrap();

        assert_eq!(config.mode, HookMode::Monitor);
        assert_eq!(config.log_dir, PathBuf::from("/tmp/scan"));
        assert!(config.debug_snapshots);
        assert_eq!(config.drivers.len(), 2);
        assert_eq!(config.drivers[0].name, "AB_ETH-1");
        assert_eq!(config.drivers[0].addresses.len(), 2);
        assert!(config.drivers[0].new_driver);
        assert!(!config.drivers[1].new_driver);
    }

    #[test]
    fn test_unknown_keys_tolerated() {
        let mut builder = ConfigBuilder::new();
        for raw in [
            "C|DRIVER=Test",
            "C|ADDR=10.0.0.5",
            "C|FANCY_FUTURE_OPTION=yes",
            "C|RETRY_BUDGET=90",
            "C|END",
        ] {
            builder.apply(&parse_control_line(raw));
        }
        let config = builder.finish().unwrap();
        assert_eq!(config.drivers.len(), 1);
    }

    #[test]
    fn test_config_without_targets_rejected() {
        let mut builder = ConfigBuilder::new();
        builder.apply(&parse_control_line("C|MODE=monitor"));
        builder.apply(&parse_control_line("C|END"));
        assert!(matches!(builder.finish(), Err(ProtocolError::NoTargets)));
    }

    #[test]
    fn test_addr_before_driver_is_dropped() {
        let mut builder = ConfigBuilder::new();
        builder.apply(&parse_control_line("C|ADDR=10.0.0.5"));
        builder.apply(&parse_control_line("C|DRIVER=Test"));
        builder.apply(&parse_control_line("C|END"));
        let config = builder.finish().unwrap();
        assert!(config.drivers[0].addresses.is_empty());
    }
}
