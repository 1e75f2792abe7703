// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Replicated-log record types for the roost coordination service
//!
//! Every mutating client operation is translated into one `Action`, appended
//! to the consensus log as an opaque byte string, and applied by the state
//! machine in log order. The state machine answers with one `Response`
//! record. Both unions are internally tagged so each operation kind owns its
//! serialized shape.

use serde::{Deserialize, Serialize};

/// Wire encoding/decoding error
#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Result codes shared by all responses.
///
/// `code == 0` is success, `code < 0` a typed failure. `code == 1` is the
/// one non-error non-success outcome: a non-blocking lock acquisition that
/// would have to wait.
pub mod codes {
    pub const OK: i32 = 0;
    pub const WOULD_BLOCK: i32 = 1;
    pub const NO_SUCH_SESSION: i32 = -1;
    pub const NO_SUCH_FILE: i32 = -2;
    pub const STALE_HANDLE: i32 = -3;
    pub const BAD_HANDLE: i32 = -4;
    pub const NOT_LOCK_HOLDER: i32 = -5;
    pub const DIRECTORY_NOT_EMPTY: i32 = -6;
}

/// Action union — one variant per replicated operation kind
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Action {
    StartSession,
    EndSession(EndSessionRequest),
    Open(OpenRequest),
    Close(CloseRequest),
    SetContent(SetContentRequest),
    /// Lock-queue admission. Both the blocking and non-blocking client
    /// operations commit this same record; blocking callers wait for the
    /// admission predicate before submitting and resubmit on a lost race.
    Acquire(AcquireRequest),
    Release(ReleaseRequest),
    Delete(DeleteRequest),
}

impl Action {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("action serialization cannot fail")
    }

    pub fn decode(record: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(record)?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndSessionRequest {
    pub session_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub session_id: u64,
    pub path: String,
    pub directory: bool,
    pub ephemeral: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub session_id: u64,
    pub fh: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetContentRequest {
    pub session_id: u64,
    pub fh: u32,
    pub content: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub session_id: u64,
    pub fh: u32,
    pub exclusive: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub session_id: u64,
    pub fh: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub session_id: u64,
    pub fh: u32,
}

/// Response union — operation-specific success payloads or a generic status
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Status(StatusResponse),
    StartSession(StartSessionResponse),
    EndSession(EndSessionResponse),
    Open(OpenResponse),
    Close(CloseResponse),
    Delete(DeleteResponse),
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("response serialization cannot fail")
    }

    pub fn decode(record: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(record)?)
    }

    pub fn code(&self) -> i32 {
        match self {
            Response::Status(r) => r.code,
            Response::StartSession(r) => r.code,
            Response::EndSession(r) => r.code,
            Response::Open(r) => r.code,
            Response::Close(r) => r.code,
            Response::Delete(r) => r.code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Response::Status(r) => &r.message,
            Response::StartSession(r) => &r.message,
            Response::EndSession(r) => &r.message,
            Response::Open(r) => &r.message,
            Response::Close(r) => &r.message,
            Response::Delete(r) => &r.message,
        }
    }
}

/// Generic (code, message) result
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub code: i32,
    pub message: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            code: codes::OK,
            message: String::new(),
        }
    }

    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub code: i32,
    pub message: String,
    pub session_id: u64,
}

/// EndSession reports the parent directories whose child lists changed
/// through ephemeral cleanup, plus the watchers of every path it deleted,
/// so the caller can drive notifications after the commit returns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndSessionResponse {
    pub code: i32,
    pub message: String,
    pub affected_parents: Vec<String>,
    pub watchers: Vec<Watcher>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenResponse {
    pub code: i32,
    pub message: String,
    pub fh: u32,
    /// Parent path whose child list gained a token, when the open
    /// materialized (or resurrected) the entry.
    pub affected_parent: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseResponse {
    pub code: i32,
    pub message: String,
    pub affected_parent: Option<String>,
    pub watchers: Vec<Watcher>,
}

/// Delete captures the watcher set (subscribers and lock holders) before
/// the apply step clears it; the coordinator cannot re-read it afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub code: i32,
    pub message: String,
    pub affected_parent: Option<String>,
    pub watchers: Vec<Watcher>,
}

/// A (session, handle) pair owed a notification event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watcher {
    pub session_id: u64,
    pub fh: u32,
}

/// Long-poll keepalive request, exposed to RPC adapters.
///
/// `acked_event` names the event id delivered by the previous round, if any.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session_id: u64,
    pub acked_event: Option<u64>,
}

/// Long-poll keepalive completion: one event, or a bare heartbeat
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event_id: Option<u64>,
    pub fh: Option<u32>,
}
