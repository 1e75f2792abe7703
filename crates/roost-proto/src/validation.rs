// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Schema validation for roost log records
//!
//! Records are validated after decoding and before submission to the log,
//! so that every replica applies only well-formed actions.

use crate::messages::Action;
use thiserror::Error;

/// Validation error
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("path validation failed: {0}")]
    Path(String),
}

/// Validate an absolute namespace path.
///
/// Paths are `/`-separated, absolute, and normalized: no empty segments, no
/// `.`/`..` components, no trailing slash (except the root itself), and no
/// NUL bytes (NUL is the child-list separator inside directory content).
pub fn validate_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::Path("path is empty".to_string()));
    }
    if !path.starts_with('/') {
        return Err(ValidationError::Path(format!("path must be absolute: {path}")));
    }
    if path.contains('\0') {
        return Err(ValidationError::Path("path contains NUL".to_string()));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(ValidationError::Path(format!("trailing slash: {path}")));
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(ValidationError::Path(format!("empty segment in {path}"))),
            "." | ".." => {
                return Err(ValidationError::Path(format!("relative segment in {path}")))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Validate a decoded action against its logical schema
pub fn validate_action(action: &Action) -> Result<(), ValidationError> {
    match action {
        Action::Open(req) => validate_path(&req.path),
        Action::StartSession
        | Action::EndSession(_)
        | Action::Close(_)
        | Action::SetContent(_)
        | Action::Acquire(_)
        | Action::Release(_)
        | Action::Delete(_) => Ok(()),
    }
}
