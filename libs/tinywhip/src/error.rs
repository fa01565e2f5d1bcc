// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WhipError {
    /// Wrong endpoint or method not allowed (HTTP 405). Never retried.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Negotiation failed (HTTP {status}): {body}")]
    Negotiation { status: u16, body: String },

    #[error("Trickle ICE not supported by endpoint: {0}")]
    TrickleUnsupported(String),

    #[error("Teardown failed: {0}")]
    Teardown(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Session is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WhipError>;
