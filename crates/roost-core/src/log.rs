// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Consensus collaborator interface
//!
//! The log-replication engine is an external collaborator: the core hands
//! it an opaque serialized action and gets the committed apply result back
//! once a quorum has agreed on its order. The engine invokes
//! `StateMachine::commit` on every replica, strictly in log order, never
//! concurrently with itself.

/// Result of an append attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The local replica accepted the record (it is, or was, the leader).
    pub accepted: bool,
    /// Serialized apply result, present once committed.
    pub result: Option<Vec<u8>>,
    /// Where writes should go when this replica cannot accept them.
    pub leader_hint: Option<u64>,
}

impl AppendOutcome {
    pub fn committed(result: Vec<u8>) -> Self {
        Self {
            accepted: true,
            result: Some(result),
            leader_hint: None,
        }
    }

    pub fn not_leader(hint: Option<u64>) -> Self {
        Self {
            accepted: false,
            result: None,
            leader_hint: hint,
        }
    }
}

/// Handle to the replicated log
#[cfg_attr(test, mockall::automock)]
pub trait ReplicatedLog: Send + Sync {
    /// Append one serialized action, blocking until it commits (or is
    /// rejected because this replica is not the leader).
    fn append(&self, record: &[u8]) -> AppendOutcome;

    /// Whether this replica currently accepts writes and runs client-facing
    /// timers.
    fn is_leader(&self) -> bool;

    fn leader_hint(&self) -> Option<u64>;
}
