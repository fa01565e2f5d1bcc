// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! WHIP/WHEP signaling client.
//!
//! Publishes media to a WHIP endpoint (RFC 9725) or plays from a WHEP
//! endpoint: SDP offer/answer over HTTP, trickle ICE via ETag-guarded PATCH,
//! and session teardown. The WebRTC engine itself is a collaborator behind
//! [`media::MediaTransport`]; enable the `webrtc-peer` feature for a
//! webrtc-rs backed implementation.

pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod media;
pub mod sdp;
pub mod session;
pub mod signaling;
pub mod whep;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{IceServer, WhepConfig, WhipConfig};
pub use error::{Result, WhipError};
pub use link::{parse_ice_server, parse_ice_servers};
pub use media::{
    ConnectionState, IceConnectionState, IceGatheringState, MediaEvent, MediaTransport,
    OfferOptions,
};
pub use sdp::{Candidate, IceComponent, build_trickle_fragment};
pub use session::{IceBootstrap, SessionState, WhipClient, WhipHandle};
pub use signaling::{HttpSignaling, SignalingResponse, SignalingTransport};
pub use whep::{ReconnectOutcome, ReconnectPolicy, WhepClient, negotiate_with_reconnect};
