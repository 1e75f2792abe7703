// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the keepalive/watch subsystem.
///
/// Only the elected leader runs client-facing timers; followers carry the
/// same configuration but never arm it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// How long a parked long-poll is held open before it is completed as a
    /// bare heartbeat.
    pub keepalive_poll_ms: u64,
    /// How long a session may go without any keepalive arriving before it
    /// is presumed dead and expired.
    pub liveness_window_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            keepalive_poll_ms: 1_000,
            liveness_window_ms: 5_000,
        }
    }
}

impl CoreConfig {
    pub fn keepalive_poll(&self) -> Duration {
        Duration::from_millis(self.keepalive_poll_ms)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }
}
