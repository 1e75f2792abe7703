// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the roost core

use roost_proto::codes;

/// Core coordination error type
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CoordError {
    #[error("no such session")]
    NoSuchSession,
    #[error("no such file")]
    NoSuchFile,
    #[error("stale handle")]
    StaleHandle,
    #[error("bad handle")]
    BadHandle,
    #[error("not lock holder")]
    NotLockHolder,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("parent is not a directory")]
    NotADirectory,
    #[error("not leader")]
    NotLeader { hint: Option<u64> },
    #[error("log append rejected")]
    LogRejected,
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("failed: {message} ({code})")]
    Failed { code: i32, message: String },
}

pub type CoordResult<T> = Result<T, CoordError>;

impl CoordError {
    /// Map a negative wire result code back to the typed error.
    pub fn from_code(code: i32, message: &str) -> Self {
        match code {
            codes::NO_SUCH_SESSION => CoordError::NoSuchSession,
            codes::NO_SUCH_FILE => CoordError::NoSuchFile,
            codes::STALE_HANDLE => CoordError::StaleHandle,
            codes::BAD_HANDLE => CoordError::BadHandle,
            codes::NOT_LOCK_HOLDER => CoordError::NotLockHolder,
            codes::DIRECTORY_NOT_EMPTY => CoordError::DirectoryNotEmpty,
            _ => CoordError::Failed {
                code,
                message: message.to_string(),
            },
        }
    }
}

impl From<roost_proto::WireError> for CoordError {
    fn from(err: roost_proto::WireError) -> Self {
        CoordError::Protocol(err.to_string())
    }
}

impl From<roost_proto::ValidationError> for CoordError {
    fn from(err: roost_proto::ValidationError) -> Self {
        CoordError::InvalidPath(err.to_string())
    }
}
