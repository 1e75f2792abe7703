// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! roost-core — replicated coordination service core
//!
//! A hierarchical namespace of small entries with reader/writer path locks,
//! client sessions holding handles, and watch delivery over a long-poll
//! keepalive channel. Every mutation goes through an abstract replicated
//! log ([`ReplicatedLog`]) into a deterministic state machine
//! ([`StateMachine`]); the [`Coordinator`] wraps both with the leader-side
//! protocol work: admission waits for blocking lock requests and the
//! notify/acknowledge barrier that makes watch delivery synchronous.

pub mod apply;
pub mod channel;
pub mod config;
pub mod error;
pub mod lock;
pub mod log;
pub mod logging;
pub mod service;
pub mod session;
pub mod store;
pub mod testing;
pub mod types;

pub use apply::{StateMachine, StateSnapshot};
pub use channel::{Reactor, WatchChannel};
pub use config::CoreConfig;
pub use error::{CoordError, CoordResult};
pub use lock::{Acquisition, ReleaseOutcome};
pub use log::{AppendOutcome, ReplicatedLog};
pub use service::Coordinator;
pub use session::{Session, SessionTable};
pub use store::NamespaceStore;
pub use types::{EventId, HandleId, LockMode, SessionId};

#[cfg(test)]
mod test_scenarios;
