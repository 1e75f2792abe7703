// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Roost Protocol — replicated-log record types and validation
//!
//! This crate defines the action/response unions that travel through the
//! consensus log, the long-poll keepalive message pair exposed to RPC
//! adapters, and the schema validation applied before a decoded record is
//! acted upon.

pub mod messages;
pub mod validation;

// Re-export key types
pub use messages::{
    codes, Action, AcquireRequest, CloseRequest, CloseResponse, DeleteRequest, DeleteResponse,
    EndSessionRequest, EndSessionResponse, EventMessage, KeepAliveRequest, OpenRequest,
    OpenResponse, ReleaseRequest, Response, SetContentRequest, StartSessionResponse,
    StatusResponse, Watcher, WireError,
};
pub use validation::{validate_action, validate_path, ValidationError};
