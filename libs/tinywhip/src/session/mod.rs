// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// WHIP Session Negotiator
//
// `machine` holds the transition rules with no I/O; `client` runs them on a
// tokio task against real (or fake) transports.

pub mod client;
pub mod machine;

pub use client::{IceBootstrap, WhipClient, WhipHandle};
pub use machine::{
    Command, Event, OfferResponse, Outcome, Resource, Session, SessionState, WILDCARD_ETAG,
    Warning,
};
