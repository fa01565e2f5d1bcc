// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// WHIP Session State Machine
//
// Sans-IO: `Session::handle` takes one input event and returns the side
// effects to perform. Network responses, timer expiries and media-transport
// notifications are fed back in as further events by whoever runs the
// commands (`session::client` in production, plain function calls in tests).
//
// Idle -> Probing -> CreatingOffer -> OfferCreated -> (AwaitingGatherTimeout) -> OfferSent
//      -> Connected -> Closed
// In trickle mode OfferCreated moves straight to OfferSent; candidates are
// then trickled from OfferSent and Connected, so there is no separate
// trickle-active state.
// Failed is terminal for negotiation; local resources are still released by
// an explicit destroy.

use crate::config::{IceServer, WhipConfig};
use crate::link::parse_extensions;
use crate::media::{ConnectionState, IceConnectionState};
use crate::sdp::{Candidate, IceCredentials, LocalOfferInfo, MediaLine, build_trickle_fragment};
use std::collections::VecDeque;
use std::time::Duration;
use url::Url;

/// ETag recorded when a successful offer response carries none.
pub const WILDCARD_ETAG: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// OPTIONS in flight to learn whether the endpoint accepts PATCH.
    Probing,
    CreatingOffer,
    /// Offer created, local description being committed.
    OfferCreated,
    /// Bulk-ICE mode: waiting for gathering to complete or the timeout.
    AwaitingGatherTimeout,
    OfferSent,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

/// Server-assigned session resource and its version token. Both are set
/// together or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub url: Url,
    pub etag: String,
}

/// The parts of an offer POST response the session reads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OfferResponse {
    pub status: u16,
    pub location: Option<String>,
    pub etag: Option<String>,
    /// All `Link` values joined with `, `.
    pub link: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    IngestRequested,
    TrickleProbed { allows_patch: bool },
    IceBootstrapRequested,
    IceConfigFetched(Vec<IceServer>),
    IceConfigUnavailable(String),
    OfferCreated(String),
    LocalDescriptionSet,
    IceGatheringComplete,
    GatherTimeout,
    OfferResponse(OfferResponse),
    /// The POST itself failed (network, timeout).
    OfferRequestFailed(String),
    AnswerApplied,
    LocalCandidate(Candidate),
    IceUpdateResult { ok: bool },
    ConnectionStateChanged(ConnectionState),
    IceConnectionStateChanged(IceConnectionState),
    CandidateError(String),
    /// The media transport rejected an operation (offer, description).
    TransportError(String),
    DestroyRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// ICE bootstrap skipped: OPTIONS needs the auth token.
    NoAuthToken,
    IceConfigUnavailable(String),
    TrickleDisabled(String),
}

/// How an ingest request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Connected,
    /// HTTP 405: wrong endpoint.
    ConfigurationError(String),
    NegotiationFailed { status: u16, body: String },
    RequestFailed(String),
    TransportFailure(String),
    /// A negotiation is already outstanding.
    Busy,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ProbeTrickle,
    FetchIceConfig,
    ApplyIceServers(Vec<IceServer>),
    CreateOffer { send_only: bool },
    SetLocalDescription(String),
    StartGatherTimer(Duration),
    CancelGatherTimer,
    /// POST the current local description.
    SendOffer,
    ApplyAnswer(String),
    UpdateIce {
        resource: Url,
        etag: String,
        fragment: String,
    },
    /// Fulfil pending resource-URL waiters.
    ResolveResource(Option<Url>),
    Delete(Url),
    StopTracks,
    CloseTransport,
    Finish(Outcome),
    Warn(Warning),
    TeardownComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownReason {
    Destroy,
    TransportFailure,
}

/// One WHIP publish session.
#[derive(Debug)]
pub struct Session {
    endpoint: Url,
    state: SessionState,
    has_auth_token: bool,
    trickle_enabled: bool,
    gather_timeout: Duration,

    resource: Option<Resource>,
    extensions: Vec<String>,
    credentials: Option<IceCredentials>,
    media: Vec<MediaLine>,

    pending_candidates: VecDeque<Candidate>,
    ice_update_in_flight: bool,
    gathering_complete: bool,
    ingest_outstanding: bool,
    /// Teardown requested while the offer was in flight; runs once it resolves.
    pending_teardown: Option<TeardownReason>,
    torn_down: bool,

    connection_state: ConnectionState,
    ice_connection_state: IceConnectionState,
}

impl Session {
    pub fn new(endpoint: Url, config: &WhipConfig) -> Self {
        Self {
            endpoint,
            state: SessionState::Idle,
            has_auth_token: config.auth_token.is_some(),
            trickle_enabled: !config.no_trickle_ice,
            gather_timeout: config.ice_gathering_timeout(),
            resource: None,
            extensions: Vec::new(),
            credentials: None,
            media: Vec::new(),
            pending_candidates: VecDeque::new(),
            ice_update_in_flight: false,
            gathering_complete: false,
            ingest_outstanding: false,
            pending_teardown: None,
            torn_down: false,
            connection_state: ConnectionState::New,
            ice_connection_state: IceConnectionState::New,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn resource(&self) -> Option<&Resource> {
        self.resource.as_ref()
    }

    pub fn resource_url(&self) -> Option<&Url> {
        self.resource.as_ref().map(|r| &r.url)
    }

    pub fn etag(&self) -> Option<&str> {
        self.resource.as_ref().map(|r| r.etag.as_str())
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn credentials(&self) -> Option<&IceCredentials> {
        self.credentials.as_ref()
    }

    pub fn media_lines(&self) -> &[MediaLine] {
        &self.media
    }

    pub fn trickle_enabled(&self) -> bool {
        self.trickle_enabled
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.ice_connection_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    /// Whether a resource URL may still show up without a new ingest.
    pub fn resource_pending(&self) -> bool {
        self.resource.is_none() && (self.ingest_outstanding || self.offer_pending())
    }

    /// Offer POST in flight, or due once the gather wait ends.
    fn offer_pending(&self) -> bool {
        self.resource.is_none()
            && matches!(
                self.state,
                SessionState::AwaitingGatherTimeout | SessionState::OfferSent
            )
    }

    /// Applies one input and returns the side effects to run, in order.
    pub fn handle(&mut self, event: Event) -> Vec<Command> {
        if self.torn_down && !matches!(event, Event::DestroyRequested) {
            tracing::trace!("[WhipSession] Ignoring {:?} after teardown", event);
            return Vec::new();
        }

        match event {
            Event::IngestRequested => self.on_ingest(),
            Event::TrickleProbed { allows_patch } => self.on_trickle_probed(allows_patch),
            Event::IceBootstrapRequested => self.on_ice_bootstrap(),
            Event::IceConfigFetched(servers) => {
                tracing::info!(
                    "[WhipSession] Applying {} ICE server(s) from endpoint",
                    servers.len()
                );
                vec![Command::ApplyIceServers(servers)]
            }
            Event::IceConfigUnavailable(reason) => {
                vec![Command::Warn(Warning::IceConfigUnavailable(reason))]
            }
            Event::OfferCreated(sdp) => self.on_offer_created(sdp),
            Event::LocalDescriptionSet => self.on_local_description_set(),
            Event::IceGatheringComplete => self.on_gathering_complete(),
            Event::GatherTimeout => self.on_gather_timeout(),
            Event::OfferResponse(response) => self.on_offer_response(response),
            Event::OfferRequestFailed(reason) => {
                if self.state != SessionState::OfferSent {
                    return Vec::new();
                }
                tracing::error!("[WhipSession] Offer request failed: {}", reason);
                self.fail_negotiation(Outcome::RequestFailed(reason))
            }
            Event::AnswerApplied => self.on_answer_applied(),
            Event::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            Event::IceUpdateResult { ok } => self.on_ice_update_result(ok),
            Event::ConnectionStateChanged(state) => self.on_connection_state(state),
            Event::IceConnectionStateChanged(state) => {
                tracing::debug!("[WhipSession] IceConnectionState {:?}", state);
                self.ice_connection_state = state;
                Vec::new()
            }
            Event::CandidateError(reason) => {
                tracing::debug!("[WhipSession] IceCandidateError {}", reason);
                Vec::new()
            }
            Event::TransportError(reason) => self.on_transport_error(reason),
            Event::DestroyRequested => self.begin_teardown(TeardownReason::Destroy),
        }
    }

    fn on_ingest(&mut self) -> Vec<Command> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Failed | SessionState::Closed => {
                return vec![Command::Finish(Outcome::Closed)];
            }
            _ => return vec![Command::Finish(Outcome::Busy)],
        }

        self.ingest_outstanding = true;
        if self.trickle_enabled {
            self.state = SessionState::Probing;
            vec![Command::ProbeTrickle]
        } else {
            self.state = SessionState::CreatingOffer;
            vec![Command::CreateOffer { send_only: true }]
        }
    }

    fn on_trickle_probed(&mut self, allows_patch: bool) -> Vec<Command> {
        if self.state != SessionState::Probing {
            return Vec::new();
        }

        if allows_patch {
            tracing::debug!(
                "[WhipSession] Endpoint says it supports Trickle ICE as PATCH is an allowed method"
            );
        } else {
            tracing::info!("[WhipSession] Endpoint does not support Trickle ICE");
            self.trickle_enabled = false;
        }

        self.state = SessionState::CreatingOffer;
        vec![Command::CreateOffer { send_only: true }]
    }

    fn on_ice_bootstrap(&mut self) -> Vec<Command> {
        if self.has_auth_token {
            tracing::debug!("[WhipSession] Fetching ICE config from endpoint");
            vec![Command::FetchIceConfig]
        } else {
            vec![Command::Warn(Warning::NoAuthToken)]
        }
    }

    fn on_offer_created(&mut self, sdp: String) -> Vec<Command> {
        if self.state != SessionState::CreatingOffer {
            return Vec::new();
        }

        let info = LocalOfferInfo::parse(&sdp);
        if self.credentials.is_none() {
            self.credentials = info.credentials;
        }
        if self.media.is_empty() {
            self.media = info.media;
        }
        if self.credentials.is_none() {
            tracing::warn!("[WhipSession] Local offer carries no ICE credentials");
        }

        self.state = SessionState::OfferCreated;
        vec![Command::SetLocalDescription(sdp)]
    }

    fn on_local_description_set(&mut self) -> Vec<Command> {
        if self.state != SessionState::OfferCreated {
            return Vec::new();
        }

        if self.trickle_enabled || self.gathering_complete {
            self.state = SessionState::OfferSent;
            vec![Command::SendOffer]
        } else {
            self.state = SessionState::AwaitingGatherTimeout;
            vec![Command::StartGatherTimer(self.gather_timeout)]
        }
    }

    fn on_gathering_complete(&mut self) -> Vec<Command> {
        self.gathering_complete = true;
        if self.state != SessionState::AwaitingGatherTimeout {
            return Vec::new();
        }

        tracing::debug!("[WhipSession] ICE gathering complete, sending offer");
        self.state = SessionState::OfferSent;
        vec![Command::CancelGatherTimer, Command::SendOffer]
    }

    fn on_gather_timeout(&mut self) -> Vec<Command> {
        if self.state != SessionState::AwaitingGatherTimeout {
            return Vec::new();
        }

        tracing::debug!("[WhipSession] onIceGatheringTimeout, sending offer");
        self.state = SessionState::OfferSent;
        vec![Command::SendOffer]
    }

    fn on_offer_response(&mut self, response: OfferResponse) -> Vec<Command> {
        if self.state != SessionState::OfferSent {
            tracing::warn!(
                "[WhipSession] Offer response (HTTP {}) in state {:?}, ignoring",
                response.status,
                self.state
            );
            return Vec::new();
        }

        match response.status {
            200 | 201 => self.on_offer_accepted(response),
            405 => {
                tracing::error!("[WhipSession] Update the URL passed into the WHIP client");
                self.fail_negotiation(Outcome::ConfigurationError(format!(
                    "Method not allowed at {}",
                    self.endpoint
                )))
            }
            status => {
                tracing::error!(
                    "[WhipSession] Failed to setup stream connection with endpoint: {} {}",
                    status,
                    response.body
                );
                self.fail_negotiation(Outcome::NegotiationFailed {
                    status,
                    body: response.body,
                })
            }
        }
    }

    fn on_offer_accepted(&mut self, response: OfferResponse) -> Vec<Command> {
        let Some(location) = response.location.as_deref() else {
            tracing::error!("[WhipSession] HTTP {} without Location header", response.status);
            return self.fail_negotiation(Outcome::NegotiationFailed {
                status: response.status,
                body: "missing Location header".into(),
            });
        };

        // Relative locations resolve against the endpoint
        let url = match self.endpoint.join(location) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!("[WhipSession] Invalid Location '{}': {}", location, e);
                return self.fail_negotiation(Outcome::NegotiationFailed {
                    status: response.status,
                    body: format!("invalid Location header: {}", e),
                });
            }
        };

        let etag = response.etag.unwrap_or_else(|| WILDCARD_ETAG.to_owned());
        self.extensions = response
            .link
            .as_deref()
            .map(parse_extensions)
            .unwrap_or_default();

        tracing::info!("[WhipSession] WHIP Resource {} (ETag: {})", url, etag);
        tracing::debug!("[WhipSession] WHIP Resource Extensions {:?}", self.extensions);

        self.resource = Some(Resource {
            url: url.clone(),
            etag,
        });

        let mut commands = vec![Command::ResolveResource(Some(url))];
        if let Some(reason) = self.pending_teardown.take() {
            commands.extend(self.finish(Outcome::Closed));
            commands.extend(self.teardown(reason));
            return commands;
        }

        commands.push(Command::ApplyAnswer(response.body));
        commands
    }

    fn on_answer_applied(&mut self) -> Vec<Command> {
        if self.state != SessionState::OfferSent || self.resource.is_none() {
            return Vec::new();
        }

        self.state = SessionState::Connected;
        let mut commands: Vec<Command> = self.finish(Outcome::Connected).into_iter().collect();
        commands.extend(self.next_ice_update());
        commands
    }

    fn on_local_candidate(&mut self, candidate: Candidate) -> Vec<Command> {
        if !self.trickle_enabled || self.state.is_terminal() {
            tracing::debug!("[WhipSession] {}", candidate.to_attribute());
            return Vec::new();
        }

        self.pending_candidates.push_back(candidate);
        self.next_ice_update()
    }

    fn on_ice_update_result(&mut self, ok: bool) -> Vec<Command> {
        self.ice_update_in_flight = false;

        if !ok {
            tracing::info!("[WhipSession] Trickle ICE not supported by endpoint");
            self.trickle_enabled = false;
            self.pending_candidates.clear();
            return vec![Command::Warn(Warning::TrickleDisabled(
                "ICE update PATCH rejected".into(),
            ))];
        }

        self.next_ice_update()
    }

    /// Issues the next queued PATCH if none is outstanding and the resource exists.
    fn next_ice_update(&mut self) -> Vec<Command> {
        if self.ice_update_in_flight || !self.trickle_enabled || self.state.is_terminal() {
            return Vec::new();
        }
        let Some(resource) = &self.resource else {
            return Vec::new();
        };

        while let Some(candidate) = self.pending_candidates.pop_front() {
            let Some(fragment) =
                build_trickle_fragment(&candidate, self.credentials.as_ref(), &self.media)
            else {
                continue;
            };

            self.ice_update_in_flight = true;
            return vec![Command::UpdateIce {
                resource: resource.url.clone(),
                etag: resource.etag.clone(),
                fragment,
            }];
        }

        Vec::new()
    }

    fn on_connection_state(&mut self, state: ConnectionState) -> Vec<Command> {
        tracing::debug!("[WhipSession] PeerConnectionState {:?}", state);
        self.connection_state = state;

        if state != ConnectionState::Failed || self.state == SessionState::Idle {
            return Vec::new();
        }

        tracing::warn!("[WhipSession] Connection failed, tearing down");
        let mut commands: Vec<Command> = self
            .finish(Outcome::TransportFailure("connection failed".into()))
            .into_iter()
            .collect();
        commands.extend(self.begin_teardown(TeardownReason::TransportFailure));
        commands
    }

    fn on_transport_error(&mut self, reason: String) -> Vec<Command> {
        tracing::error!("[WhipSession] Media transport error: {}", reason);

        if self.state.is_terminal() {
            return Vec::new();
        }

        let mut commands: Vec<Command> = self
            .finish(Outcome::TransportFailure(reason))
            .into_iter()
            .collect();
        if self.resource.is_some() {
            // Remote session exists (answer rejected): release it too.
            commands.extend(self.begin_teardown(TeardownReason::TransportFailure));
        } else {
            self.state = SessionState::Failed;
            commands.push(Command::ResolveResource(None));
            if let Some(reason) = self.pending_teardown.take() {
                commands.extend(self.teardown(reason));
            }
        }
        commands
    }

    /// Negotiation failed before a resource existed.
    fn fail_negotiation(&mut self, outcome: Outcome) -> Vec<Command> {
        self.state = SessionState::Failed;

        let mut commands = vec![Command::ResolveResource(None)];
        commands.extend(self.finish(outcome));
        if let Some(reason) = self.pending_teardown.take() {
            commands.extend(self.teardown(reason));
        }
        commands
    }

    fn finish(&mut self, outcome: Outcome) -> Option<Command> {
        if !self.ingest_outstanding {
            return None;
        }
        self.ingest_outstanding = false;
        Some(Command::Finish(outcome))
    }

    fn begin_teardown(&mut self, reason: TeardownReason) -> Vec<Command> {
        if self.torn_down {
            return vec![Command::TeardownComplete];
        }

        if self.offer_pending() {
            // Resource URL not known yet; wait for the offer response.
            // A transport failure recorded first keeps the session Failed.
            tracing::debug!("[WhipSession] Teardown waiting for in-flight offer");
            self.pending_teardown.get_or_insert(reason);
            return Vec::new();
        }

        let mut commands: Vec<Command> = self.finish(Outcome::Closed).into_iter().collect();
        commands.extend(self.teardown(reason));
        commands
    }

    fn teardown(&mut self, reason: TeardownReason) -> Vec<Command> {
        let mut commands = Vec::new();

        if let Some(resource) = self.resource.take() {
            commands.push(Command::Delete(resource.url));
        }
        commands.push(Command::StopTracks);
        commands.push(Command::CloseTransport);
        commands.push(Command::ResolveResource(None));
        commands.push(Command::TeardownComplete);

        self.credentials = None;
        self.pending_candidates.clear();
        self.ice_update_in_flight = false;
        self.pending_teardown = None;
        self.torn_down = true;
        self.state = match reason {
            TeardownReason::Destroy => SessionState::Closed,
            TeardownReason::TransportFailure => SessionState::Failed,
        };

        commands
    }
}
