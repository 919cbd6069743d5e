// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide hook configuration.
//!
//! Configuration arrives once, over the control channel, before discovery
//! starts. After [`install`] it is immutable; readers take a cheap
//! [`current`] snapshot. Teardown calls [`clear`] *before* releasing host
//! resources so that nothing running late can act on stale configuration.

use arc_swap::ArcSwapOption;
use std::path::PathBuf;
use std::sync::Arc;

/// How the orchestrator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookMode {
    /// Run the phase sequence once, report, exit.
    #[default]
    OneShot,
    /// Keep polling and reporting until a stop signal arrives.
    Monitor,
}

impl HookMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneShot => "oneshot",
            Self::Monitor => "monitor",
        }
    }
}

/// One named logical bus and the addresses to probe on it.
#[derive(Debug, Clone, Default)]
pub struct DriverTarget {
    /// Bus name as the host knows it.
    pub name: String,
    /// Target addresses to register and watch for.
    pub addresses: Vec<String>,
    /// The host has never seen this bus before (engine may need loading).
    pub new_driver: bool,
}

/// The full configuration for one hook run.
#[derive(Debug, Clone)]
pub struct HookConfig {
    pub drivers: Vec<DriverTarget>,
    pub mode: HookMode,
    pub log_dir: PathBuf,
    /// Keep a numbered snapshot file per poll instead of one scratch file.
    pub debug_snapshots: bool,
    /// Log extended per-device detail during browse phases.
    pub probe_details: bool,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            drivers: Vec::new(),
            mode: HookMode::OneShot,
            log_dir: std::env::temp_dir(),
            debug_snapshots: false,
            probe_details: false,
        }
    }
}

impl HookConfig {
    /// Every target address across all drivers, in configuration order.
    pub fn all_addresses(&self) -> Vec<String> {
        self.drivers
            .iter()
            .flat_map(|d| d.addresses.iter().cloned())
            .collect()
    }

    /// Does any driver need engine loading?
    pub fn has_new_driver(&self) -> bool {
        self.drivers.iter().any(|d| d.new_driver)
    }
}

static CONFIG: ArcSwapOption<HookConfig> = ArcSwapOption::const_empty();

/// Install the configuration for this run. Call once, at startup.
pub fn install(config: HookConfig) {
    CONFIG.store(Some(Arc::new(config)));
}

/// Snapshot of the installed configuration, if any.
pub fn current() -> Option<Arc<HookConfig>> {
    CONFIG.load_full()
}

/// Drop the installed configuration. Runs at the start of final teardown.
pub fn clear() {
    CONFIG.store(None);
}
