// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// Media Transport Collaborator
//
// The ICE agent, DTLS/SRTP and the actual audio/video live behind this trait.
// The negotiation layer only creates offers, commits descriptions, and reacts
// to the notifications delivered as `MediaEvent`s.

#[cfg(feature = "webrtc-peer")]
pub mod webrtc_peer;

#[cfg(feature = "webrtc-peer")]
pub use webrtc_peer::{LocalTrack, PeerRole, WebRtcPeer};

use crate::config::IceServer;
use crate::error::Result;
use crate::sdp::Candidate;
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceGatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

/// Notifications from the media transport, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LocalCandidate(Candidate),
    /// Null candidate: the agent has no more candidates to report.
    EndOfCandidates,
    IceGatheringStateChanged(IceGatheringState),
    ConnectionStateChanged(ConnectionState),
    IceConnectionStateChanged(IceConnectionState),
    CandidateError(String),
}

/// Constraints for `create_offer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfferOptions {
    /// Publish sessions negotiate no receive direction.
    pub send_only: bool,
}

/// Opaque capabilities of the underlying WebRTC engine.
pub trait MediaTransport: Send + Sync + 'static {
    /// Local media handed to `add_track`.
    type Track: Send + 'static;

    fn apply_ice_servers(&self, servers: &[IceServer]) -> impl Future<Output = Result<()>> + Send;

    fn add_track(&self, track: Self::Track) -> impl Future<Output = Result<()>> + Send;

    fn create_offer(&self, options: OfferOptions) -> impl Future<Output = Result<String>> + Send;

    fn set_local_description(&self, sdp: &str) -> impl Future<Output = Result<()>> + Send;

    /// Current local description, including candidates gathered so far.
    fn local_description(&self) -> impl Future<Output = Option<String>> + Send;

    fn set_remote_description(&self, answer_sdp: &str) -> impl Future<Output = Result<()>> + Send;

    /// Stops every outbound track (get-senders + stop).
    fn stop_senders(&self) -> impl Future<Output = ()> + Send;

    fn close(&self) -> impl Future<Output = Result<()>> + Send;

    fn connection_state(&self) -> ConnectionState;

    fn ice_gathering_state(&self) -> IceGatheringState;
}
