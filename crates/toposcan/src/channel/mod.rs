// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control channel: transport and line protocol.
//!
//! Both control-plane messages (configuration in, stop signals) and
//! telemetry (log lines, status frames, snapshot documents) share one
//! duplex byte stream between the hook and the controller process.

pub mod protocol;
pub mod transport;

pub use protocol::{
    encode_config, encode_config_end, encode_done, encode_log, encode_status, encode_stop,
    parse_control_line, parse_report_line, ConfigBuilder, ControlLine, LineBuffer, ProtocolError,
    ReportLine,
};
pub use transport::{ChannelError, ChannelListener, ChannelOutput, ChannelTransport};
