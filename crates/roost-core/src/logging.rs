// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging initialization for replica processes
//!
//! `RUST_LOG` overrides the default filter when set.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable plaintext format
    #[default]
    Plaintext,
    /// Structured JSON format
    Json,
}

#[derive(thiserror::Error, Debug)]
#[error("logging already initialized: {0}")]
pub struct InitError(#[from] tracing_subscriber::util::TryInitError);

/// Initialize logging for the named component.
pub fn init(component: &str, default_level: Level, format: LogFormat) -> Result<(), InitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{default_level},{component}={default_level}"))
    });

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().json();
            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer();
            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }

    Ok(())
}

pub fn init_plaintext(component: &str, default_level: Level) -> Result<(), InitError> {
    init(component, default_level, LogFormat::Plaintext)
}
