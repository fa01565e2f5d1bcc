// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// WHIP Client Driver
//
// Owns one `Session` and runs the commands it emits against the signaling and
// media transports. A single tokio task serializes every transition; callers
// talk to it through `WhipHandle`.
//
// The offer POST is the only command awaited concurrently with control
// messages, so `destroy()` can be observed while it is in flight.

use super::machine::{Command, Event, OfferResponse, Outcome, Session, SessionState, Warning};
use crate::config::{IceServer, WhipConfig};
use crate::error::{Result, WhipError};
use crate::link::parse_ice_servers;
use crate::media::{
    IceConnectionState, IceGatheringState, MediaEvent, MediaTransport, OfferOptions,
};
use crate::signaling::{SignalingResponse, SignalingTransport};
use hyper::header;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use url::Url;

const CONTROL_CHANNEL_CAPACITY: usize = 32;

type EventFuture = Pin<Box<dyn Future<Output = Event> + Send>>;

/// Result of [`WhipHandle::set_ice_servers_from_endpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceBootstrap {
    /// Servers parsed from the endpoint's `Link` headers, already applied.
    Applied(Vec<IceServer>),
    /// Nothing applied; the session keeps its configured servers.
    Skipped(Warning),
}

enum Control<T> {
    Ingest {
        tracks: Vec<T>,
        reply: oneshot::Sender<Result<()>>,
    },
    BootstrapIce {
        reply: oneshot::Sender<Result<IceBootstrap>>,
    },
    ResourceUrl {
        reply: oneshot::Sender<Option<Url>>,
    },
    Extensions {
        reply: oneshot::Sender<Vec<String>>,
    },
    IceConnectionState {
        reply: oneshot::Sender<IceConnectionState>,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
    Destroy {
        reply: oneshot::Sender<Result<()>>,
    },
}

enum ResourceWaiter {
    Url(oneshot::Sender<Option<Url>>),
    Extensions(oneshot::Sender<Vec<String>>),
}

enum Wake<T> {
    Control(Option<Control<T>>),
    Media(MediaEvent),
    OfferDone(Event),
    GatherTimeout,
}

/// Caller side of a running WHIP session.
///
/// Cheap to clone. When the last handle is dropped the session is destroyed.
pub struct WhipHandle<T> {
    control: mpsc::Sender<Control<T>>,
}

impl<T> Clone for WhipHandle<T> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
        }
    }
}

impl<T: Send + 'static> WhipHandle<T> {
    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Control<T>) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(build(reply))
            .await
            .map_err(|_| WhipError::Closed)?;
        rx.await.map_err(|_| WhipError::Closed)
    }

    /// Adds the tracks and negotiates the session.
    ///
    /// Resolves once the answer is applied, or with the error that ended the
    /// attempt. Only one ingest may be outstanding at a time.
    pub async fn ingest(&self, tracks: Vec<T>) -> Result<()> {
        self.request(|reply| Control::Ingest { tracks, reply })
            .await?
    }

    /// OPTIONS the endpoint and apply the ICE servers it advertises.
    ///
    /// Without an auth token this is skipped with a warning.
    pub async fn set_ice_servers_from_endpoint(&self) -> Result<IceBootstrap> {
        self.request(|reply| Control::BootstrapIce { reply }).await?
    }

    /// The session resource URL, waiting for an in-flight offer if needed.
    pub async fn resource_url(&self) -> Result<Option<Url>> {
        self.request(|reply| Control::ResourceUrl { reply }).await
    }

    /// Protocol extensions from the offer response `Link` header.
    pub async fn resource_extensions(&self) -> Result<Vec<String>> {
        self.request(|reply| Control::Extensions { reply }).await
    }

    pub async fn ice_connection_state(&self) -> Result<IceConnectionState> {
        self.request(|reply| Control::IceConnectionState { reply })
            .await
    }

    pub async fn state(&self) -> Result<SessionState> {
        self.request(|reply| Control::State { reply }).await
    }

    /// Tears the session down: DELETE (best-effort), stop tracks, close.
    ///
    /// Idempotent. Once the driver has exited this returns `Ok` as well.
    pub async fn destroy(&self) -> Result<()> {
        match self.request(|reply| Control::Destroy { reply }).await {
            Err(WhipError::Closed) => Ok(()),
            other => other?,
        }
    }
}

/// Driver task for one WHIP session.
pub struct WhipClient<S: SignalingTransport, M: MediaTransport> {
    session: Session,
    config: WhipConfig,
    signaling: Arc<S>,
    media: Arc<M>,
    media_events: mpsc::Receiver<MediaEvent>,
    control: mpsc::Receiver<Control<M::Track>>,

    offer_in_flight: Option<EventFuture>,
    gather_timer: Option<Pin<Box<Sleep>>>,

    ingest_waiter: Option<oneshot::Sender<Result<()>>>,
    bootstrap_waiter: Option<oneshot::Sender<Result<IceBootstrap>>>,
    resource_waiters: Vec<ResourceWaiter>,
    destroy_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl<S: SignalingTransport, M: MediaTransport> WhipClient<S, M> {
    /// Validates the configuration and spawns the driver on the current runtime.
    pub fn spawn(
        config: WhipConfig,
        signaling: Arc<S>,
        media: Arc<M>,
        media_events: mpsc::Receiver<MediaEvent>,
    ) -> Result<WhipHandle<M::Track>> {
        let endpoint = config.validate()?;
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

        tracing::info!(
            "[WhipClient] Creating session for {} (trickle: {})",
            endpoint,
            !config.no_trickle_ice
        );

        let client = Self {
            session: Session::new(endpoint, &config),
            config,
            signaling,
            media,
            media_events,
            control: control_rx,
            offer_in_flight: None,
            gather_timer: None,
            ingest_waiter: None,
            bootstrap_waiter: None,
            resource_waiters: Vec::new(),
            destroy_waiters: Vec::new(),
        };

        tokio::spawn(client.run());

        Ok(WhipHandle {
            control: control_tx,
        })
    }

    async fn run(mut self) {
        if !self.config.ice_servers.is_empty() {
            if let Err(e) = self.media.apply_ice_servers(&self.config.ice_servers).await {
                tracing::warn!("[WhipClient] Failed to apply configured ICE servers: {}", e);
            }
        }

        let mut control_open = true;
        let mut media_open = true;

        loop {
            if !control_open && self.session.is_torn_down() {
                break;
            }

            let offer = &mut self.offer_in_flight;
            let timer = &mut self.gather_timer;
            let control = &mut self.control;
            let media_events = &mut self.media_events;

            let wake = tokio::select! {
                message = control.recv(), if control_open => Wake::Control(message),
                event = media_events.recv(), if media_open => match event {
                    Some(event) => Wake::Media(event),
                    None => {
                        media_open = false;
                        continue;
                    }
                },
                event = poll_slot(offer), if offer.is_some() => Wake::OfferDone(event),
                _ = poll_slot(timer), if timer.is_some() => Wake::GatherTimeout,
                else => break,
            };

            match wake {
                Wake::Control(Some(message)) => self.on_control(message).await,
                Wake::Control(None) => {
                    control_open = false;
                    if !self.session.is_torn_down() {
                        tracing::debug!("[WhipClient] All handles dropped, destroying session");
                        self.dispatch(Event::DestroyRequested).await;
                    }
                }
                Wake::Media(event) => {
                    if let Some(event) = media_event(event) {
                        self.dispatch(event).await;
                    }
                }
                Wake::OfferDone(event) => {
                    self.offer_in_flight = None;
                    self.dispatch(event).await;
                }
                Wake::GatherTimeout => {
                    self.gather_timer = None;
                    self.dispatch(Event::GatherTimeout).await;
                }
            }
        }

        tracing::debug!("[WhipClient] Driver exiting");
    }

    async fn on_control(&mut self, message: Control<M::Track>) {
        match message {
            Control::Ingest { tracks, reply } => {
                if self.session.is_torn_down() {
                    let _ = reply.send(Err(WhipError::Closed));
                    return;
                }
                if self.ingest_waiter.is_some() {
                    let _ = reply.send(Err(busy()));
                    return;
                }

                if self.session.state() == SessionState::Idle {
                    for track in tracks {
                        if let Err(e) = self.media.add_track(track).await {
                            tracing::error!("[WhipClient] Failed to add track: {}", e);
                            let _ = reply.send(Err(e));
                            return;
                        }
                    }
                }

                self.ingest_waiter = Some(reply);
                self.dispatch(Event::IngestRequested).await;
            }
            Control::BootstrapIce { reply } => {
                if self.bootstrap_waiter.is_some() {
                    let _ = reply.send(Err(busy()));
                    return;
                }
                self.bootstrap_waiter = Some(reply);
                self.dispatch(Event::IceBootstrapRequested).await;
            }
            Control::ResourceUrl { reply } => {
                if self.session.resource_pending() {
                    self.resource_waiters.push(ResourceWaiter::Url(reply));
                } else {
                    let _ = reply.send(self.session.resource_url().cloned());
                }
            }
            Control::Extensions { reply } => {
                if self.session.resource_pending() {
                    self.resource_waiters.push(ResourceWaiter::Extensions(reply));
                } else {
                    let _ = reply.send(self.session.extensions().to_vec());
                }
            }
            Control::IceConnectionState { reply } => {
                let _ = reply.send(self.session.ice_connection_state());
            }
            Control::State { reply } => {
                let _ = reply.send(self.session.state());
            }
            Control::Destroy { reply } => {
                self.destroy_waiters.push(reply);
                self.dispatch(Event::DestroyRequested).await;
            }
        }
    }

    /// Feeds an event through the session, running the resulting commands
    /// until no follow-up events remain.
    async fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            for command in self.session.handle(event) {
                if let Some(next) = self.execute(command).await {
                    queue.push_back(next);
                }
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Option<Event> {
        tracing::trace!("[WhipClient] {:?}", command);

        match command {
            Command::ProbeTrickle => {
                let allows_patch = match self
                    .signaling
                    .get_configuration(self.session.endpoint(), self.config.auth_token.as_deref())
                    .await
                {
                    Ok(response) => response.allows_patch(),
                    Err(e) => {
                        tracing::warn!("[WhipClient] Trickle ICE probe failed: {}", e);
                        false
                    }
                };
                Some(Event::TrickleProbed { allows_patch })
            }

            Command::FetchIceConfig => {
                let response = self
                    .signaling
                    .get_configuration(self.session.endpoint(), self.config.auth_token.as_deref())
                    .await;
                Some(match response {
                    Ok(response) if response.ok() => Event::IceConfigFetched(parse_ice_servers(
                        response.header_all(header::LINK),
                    )),
                    Ok(response) => Event::IceConfigUnavailable(format!(
                        "OPTIONS returned HTTP {}",
                        response.status
                    )),
                    Err(e) => Event::IceConfigUnavailable(e.to_string()),
                })
            }

            Command::ApplyIceServers(servers) => {
                let result = self.media.apply_ice_servers(&servers).await;
                if let Err(e) = &result {
                    tracing::error!("[WhipClient] Failed to apply ICE servers: {}", e);
                }
                if let Some(reply) = self.bootstrap_waiter.take() {
                    let _ = reply.send(result.map(|_| IceBootstrap::Applied(servers)));
                }
                None
            }

            Command::CreateOffer { send_only } => {
                match self.media.create_offer(OfferOptions { send_only }).await {
                    Ok(sdp) => Some(Event::OfferCreated(sdp)),
                    Err(e) => Some(Event::TransportError(format!("create offer: {}", e))),
                }
            }

            Command::SetLocalDescription(sdp) => {
                match self.media.set_local_description(&sdp).await {
                    Ok(()) => Some(Event::LocalDescriptionSet),
                    Err(e) => Some(Event::TransportError(format!("set local description: {}", e))),
                }
            }

            Command::StartGatherTimer(timeout) => {
                self.gather_timer = Some(Box::pin(tokio::time::sleep(timeout)));
                // Gathering may have finished before the wait started
                (self.media.ice_gathering_state() == IceGatheringState::Complete)
                    .then_some(Event::IceGatheringComplete)
            }

            Command::CancelGatherTimer => {
                self.gather_timer = None;
                None
            }

            Command::SendOffer => {
                self.offer_in_flight = Some(self.send_offer());
                None
            }

            Command::ApplyAnswer(sdp) => match self.media.set_remote_description(&sdp).await {
                Ok(()) => Some(Event::AnswerApplied),
                Err(e) => Some(Event::TransportError(format!("set remote description: {}", e))),
            },

            Command::UpdateIce {
                resource,
                etag,
                fragment,
            } => {
                let ok = match self.signaling.update_ice(&resource, &etag, &fragment).await {
                    Ok(response) if response.ok() => true,
                    Ok(response) => {
                        let e = WhipError::TrickleUnsupported(format!(
                            "PATCH returned HTTP {}",
                            response.status
                        ));
                        tracing::warn!("[WhipClient] {}", e);
                        false
                    }
                    Err(e) => {
                        tracing::warn!("[WhipClient] ICE update failed: {}", e);
                        false
                    }
                };
                Some(Event::IceUpdateResult { ok })
            }

            Command::ResolveResource(url) => {
                let extensions = if url.is_some() {
                    self.session.extensions().to_vec()
                } else {
                    Vec::new()
                };
                for waiter in self.resource_waiters.drain(..) {
                    match waiter {
                        ResourceWaiter::Url(reply) => {
                            let _ = reply.send(url.clone());
                        }
                        ResourceWaiter::Extensions(reply) => {
                            let _ = reply.send(extensions.clone());
                        }
                    }
                }
                None
            }

            Command::Delete(resource) => {
                tracing::info!("[WhipClient] Deleting session resource {}", resource);
                let failure = match self.signaling.delete(&resource).await {
                    Ok(response) if response.ok() => None,
                    Ok(response) => Some(WhipError::Teardown(format!(
                        "DELETE {} returned HTTP {}",
                        resource, response.status
                    ))),
                    Err(e) => Some(WhipError::Teardown(format!("DELETE {}: {}", resource, e))),
                };
                if let Some(e) = failure {
                    tracing::warn!("[WhipClient] {}", e);
                }
                None
            }

            Command::StopTracks => {
                self.media.stop_senders().await;
                None
            }

            Command::CloseTransport => {
                if let Err(e) = self.media.close().await {
                    tracing::warn!("[WhipClient] Failed to close media transport: {}", e);
                }
                None
            }

            Command::Finish(outcome) => {
                let result = outcome_result(outcome);
                match &result {
                    Ok(()) => tracing::info!("[WhipClient] Session connected"),
                    Err(e) => tracing::debug!("[WhipClient] Ingest ended: {}", e),
                }
                if let Some(reply) = self.ingest_waiter.take() {
                    let _ = reply.send(result);
                }
                None
            }

            Command::Warn(warning) => {
                match &warning {
                    Warning::NoAuthToken => tracing::warn!(
                        "[WhipClient] No auth token set, cannot fetch ICE servers from endpoint"
                    ),
                    Warning::IceConfigUnavailable(reason) => {
                        tracing::warn!("[WhipClient] ICE config unavailable: {}", reason)
                    }
                    Warning::TrickleDisabled(reason) => {
                        tracing::warn!("[WhipClient] Falling back to bulk ICE: {}", reason)
                    }
                }
                if !matches!(warning, Warning::TrickleDisabled(_)) {
                    if let Some(reply) = self.bootstrap_waiter.take() {
                        let _ = reply.send(Ok(IceBootstrap::Skipped(warning)));
                    }
                }
                None
            }

            Command::TeardownComplete => {
                tracing::info!("[WhipClient] Session closed");
                self.offer_in_flight = None;
                self.gather_timer = None;
                for reply in self.destroy_waiters.drain(..) {
                    let _ = reply.send(Ok(()));
                }
                None
            }
        }
    }

    /// POST of the current local description, resolved as a session event.
    fn send_offer(&self) -> EventFuture {
        let signaling = Arc::clone(&self.signaling);
        let media = Arc::clone(&self.media);
        let endpoint = self.session.endpoint().clone();
        let auth_token = self.config.auth_token.clone();

        Box::pin(async move {
            let Some(sdp) = media.local_description().await else {
                return Event::TransportError("no local description to send".into());
            };

            tracing::debug!("[WhipClient] Sending offer to {}", endpoint);
            match signaling
                .send_offer(&endpoint, auth_token.as_deref(), &sdp)
                .await
            {
                Ok(response) => Event::OfferResponse(offer_response(&response)),
                Err(e) => Event::OfferRequestFailed(e.to_string()),
            }
        })
    }
}

/// Awaits the slot's future, or never resolves while the slot is empty.
async fn poll_slot<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

fn media_event(event: MediaEvent) -> Option<Event> {
    match event {
        MediaEvent::LocalCandidate(candidate) => Some(Event::LocalCandidate(candidate)),
        MediaEvent::EndOfCandidates => Some(Event::IceGatheringComplete),
        MediaEvent::IceGatheringStateChanged(IceGatheringState::Complete) => {
            Some(Event::IceGatheringComplete)
        }
        MediaEvent::IceGatheringStateChanged(_) => None,
        MediaEvent::ConnectionStateChanged(state) => Some(Event::ConnectionStateChanged(state)),
        MediaEvent::IceConnectionStateChanged(state) => {
            Some(Event::IceConnectionStateChanged(state))
        }
        MediaEvent::CandidateError(reason) => Some(Event::CandidateError(reason)),
    }
}

fn offer_response(response: &SignalingResponse) -> OfferResponse {
    let links = response.header_all(header::LINK);
    OfferResponse {
        status: response.status.as_u16(),
        location: response.header(header::LOCATION).map(str::to_owned),
        etag: response.header(header::ETAG).map(str::to_owned),
        link: (!links.is_empty()).then(|| links.join(", ")),
        body: response.text(),
    }
}

fn outcome_result(outcome: Outcome) -> Result<()> {
    match outcome {
        Outcome::Connected => Ok(()),
        Outcome::ConfigurationError(reason) => Err(WhipError::Configuration(reason)),
        Outcome::NegotiationFailed { status, body } => Err(WhipError::Negotiation { status, body }),
        Outcome::RequestFailed(reason) => Err(WhipError::Http(reason)),
        Outcome::TransportFailure(reason) => Err(WhipError::TransportFailure(reason)),
        Outcome::Busy => Err(busy()),
        Outcome::Closed => Err(WhipError::Closed),
    }
}

fn busy() -> WhipError {
    WhipError::Other(anyhow::anyhow!("A negotiation is already in progress"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ConnectionState;
    use crate::sdp::{Candidate, IceComponent};
    use crate::testing::{Call, FakeMedia, FakeSignaling, created, options, response};
    use std::time::Duration;
    use tokio::sync::Notify;

    const ENDPOINT: &str = "https://whip.example.com/whip/live";

    struct Harness {
        handle: WhipHandle<String>,
        signaling: Arc<FakeSignaling>,
        media: Arc<FakeMedia>,
        events: mpsc::Sender<MediaEvent>,
    }

    fn start(config: WhipConfig, signaling: FakeSignaling, media: FakeMedia) -> Harness {
        let signaling = Arc::new(signaling);
        let media = Arc::new(media);
        let (events, events_rx) = mpsc::channel(64);
        let handle = WhipClient::spawn(
            config,
            Arc::clone(&signaling),
            Arc::clone(&media),
            events_rx,
        )
        .unwrap();
        Harness {
            handle,
            signaling,
            media,
            events,
        }
    }

    /// Lets the driver run until everything it can do without the clock is done.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn candidate(port: u16) -> Candidate {
        Candidate {
            foundation: "1".into(),
            component: IceComponent::Rtp,
            transport: "udp".into(),
            priority: 2130706431,
            address: "10.0.0.2".into(),
            port,
            typ: "host".into(),
            related_address: None,
            related_port: None,
            tcp_type: None,
        }
    }

    fn trickle_signaling() -> FakeSignaling {
        FakeSignaling::new()
            .with_options_response(options(Some("POST, PATCH, OPTIONS, DELETE"), &[]))
            .with_offer_response(Ok(created("/whip/resource/7", Some("\"v1\""))))
    }

    #[tokio::test(start_paused = true)]
    async fn test_trickle_publish_and_patch() {
        let h = start(WhipConfig::new(ENDPOINT), trickle_signaling(), FakeMedia::new());

        h.handle.ingest(vec!["camera".into()]).await.unwrap();

        assert_eq!(
            h.handle.resource_url().await.unwrap().unwrap().as_str(),
            "https://whip.example.com/whip/resource/7"
        );
        assert_eq!(h.handle.state().await.unwrap(), SessionState::Connected);
        assert!(h.media.calls().contains(&"add_track:camera".to_owned()));
        assert!(h.media.calls().contains(&"create_offer:send_only=true".to_owned()));
        // Default STUN server applied at start
        assert_eq!(h.media.ice_servers().len(), 1);

        h.events
            .send(MediaEvent::LocalCandidate(candidate(5000)))
            .await
            .unwrap();
        settle().await;

        let patches = h.signaling.patches();
        assert_eq!(patches.len(), 1);
        match &patches[0] {
            Call::Patch { etag, fragment, .. } => {
                assert_eq!(etag, "\"v1\"");
                assert!(fragment.starts_with("a=ice-ufrag:uf\r\na=ice-pwd:pw\r\n"));
                assert!(fragment.contains("a=mid:1\r\n"));
            }
            other => panic!("unexpected call {:?}", other),
        }

        // End of candidates is never forwarded as a PATCH
        h.events.send(MediaEvent::EndOfCandidates).await.unwrap();
        settle().await;
        assert_eq!(h.signaling.patches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_mode_waits_for_gather_timeout() {
        let config = WhipConfig {
            no_trickle_ice: true,
            ..WhipConfig::new(ENDPOINT)
        };
        let h = start(
            config,
            FakeSignaling::new().with_offer_response(Ok(created("/r/1", None))),
            FakeMedia::with_gathering(IceGatheringState::Gathering),
        );

        let handle = h.handle.clone();
        let ingest = tokio::spawn(async move { handle.ingest(Vec::new()).await });

        tokio::time::sleep(Duration::from_millis(1990)).await;
        assert_eq!(h.signaling.posts(), 0);
        assert!(
            !h.signaling
                .calls()
                .iter()
                .any(|c| matches!(c, Call::Options { .. }))
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.signaling.posts(), 1);
        ingest.await.unwrap().unwrap();

        // Bulk mode never trickles
        h.events
            .send(MediaEvent::LocalCandidate(candidate(1)))
            .await
            .unwrap();
        settle().await;
        assert!(h.signaling.patches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_during_gather_wait_deletes_resource() {
        let config = WhipConfig {
            no_trickle_ice: true,
            ..WhipConfig::new(ENDPOINT)
        };
        let h = start(
            config,
            FakeSignaling::new().with_offer_response(Ok(created("/r/9", Some("e1")))),
            FakeMedia::with_gathering(IceGatheringState::Gathering),
        );

        let handle = h.handle.clone();
        let ingest = tokio::spawn(async move { handle.ingest(Vec::new()).await });
        tokio::time::sleep(Duration::from_millis(500)).await;

        let handle = h.handle.clone();
        let destroy = tokio::spawn(async move { handle.destroy().await });
        let url = h.handle.resource_url().await.unwrap();

        destroy.await.unwrap().unwrap();
        assert!(matches!(ingest.await.unwrap(), Err(WhipError::Closed)));
        assert_eq!(h.signaling.posts(), 1);
        assert_eq!(h.signaling.deletes(), vec![url.unwrap()]);
        assert_eq!(h.handle.state().await.unwrap(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gathering_complete_sends_before_timeout() {
        let config = WhipConfig {
            no_trickle_ice: true,
            ..WhipConfig::new(ENDPOINT)
        };
        let h = start(
            config,
            FakeSignaling::new().with_offer_response(Ok(created("/r/1", Some("e")))),
            FakeMedia::with_gathering(IceGatheringState::Gathering),
        );

        let handle = h.handle.clone();
        let ingest = tokio::spawn(async move { handle.ingest(Vec::new()).await });
        settle().await;
        assert_eq!(h.signaling.posts(), 0);

        h.events
            .send(MediaEvent::IceGatheringStateChanged(IceGatheringState::Complete))
            .await
            .unwrap();
        ingest.await.unwrap().unwrap();

        // The cancelled timer must not fire a second offer
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.signaling.posts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_disables_trickle() {
        let signaling =
            FakeSignaling::new().with_offer_response(Ok(created("/r/1", Some("e"))));
        let h = start(WhipConfig::new(ENDPOINT), signaling, FakeMedia::new());

        h.handle.ingest(Vec::new()).await.unwrap();
        h.events
            .send(MediaEvent::LocalCandidate(candidate(1)))
            .await
            .unwrap();
        settle().await;

        assert!(h.signaling.patches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_method_not_allowed_is_configuration_error() {
        let signaling = FakeSignaling::new()
            .with_options_response(options(None, &[]))
            .with_offer_response(Ok(response(405)));
        let h = start(WhipConfig::new(ENDPOINT), signaling, FakeMedia::new());

        let err = h.handle.ingest(Vec::new()).await.unwrap_err();
        assert!(matches!(err, WhipError::Configuration(_)));

        settle().await;
        assert_eq!(h.signaling.posts(), 1);
        assert_eq!(h.handle.state().await.unwrap(), SessionState::Failed);
        assert_eq!(h.handle.resource_url().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_error_carries_body() {
        let mut failure = response(400);
        failure.body = "bad sdp".into();
        let signaling = FakeSignaling::new()
            .with_options_response(options(None, &[]))
            .with_offer_response(Ok(failure));
        let h = start(WhipConfig::new(ENDPOINT), signaling, FakeMedia::new());

        match h.handle.ingest(Vec::new()).await {
            Err(WhipError::Negotiation { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad sdp");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_waits_for_inflight_offer() {
        let gate = Arc::new(Notify::new());
        let signaling = trickle_signaling().with_offer_gate(Arc::clone(&gate));
        let h = start(WhipConfig::new(ENDPOINT), signaling, FakeMedia::new());

        let handle = h.handle.clone();
        let ingest = tokio::spawn(async move { handle.ingest(Vec::new()).await });
        settle().await;
        assert_eq!(h.signaling.posts(), 1);

        let handle = h.handle.clone();
        let resource = tokio::spawn(async move { handle.resource_url().await });
        let handle = h.handle.clone();
        let destroy = tokio::spawn(async move { handle.destroy().await });
        settle().await;

        assert!(h.signaling.deletes().is_empty());
        assert!(!destroy.is_finished());

        gate.notify_one();
        destroy.await.unwrap().unwrap();

        let expected = Url::parse("https://whip.example.com/whip/resource/7").unwrap();
        assert_eq!(resource.await.unwrap().unwrap(), Some(expected.clone()));
        assert_eq!(h.signaling.deletes(), vec![expected]);
        assert!(matches!(ingest.await.unwrap(), Err(WhipError::Closed)));

        // DELETE comes after the POST that produced the resource
        let calls = h.signaling.calls();
        let post = calls.iter().position(|c| matches!(c, Call::Post { .. }));
        let delete = calls.iter().position(|c| matches!(c, Call::Delete(_)));
        assert!(post < delete);

        let media_calls = h.media.calls();
        assert!(media_calls.contains(&"stop_senders".to_owned()));
        assert!(media_calls.contains(&"close".to_owned()));
        assert!(!media_calls.contains(&"set_remote_description".to_owned()));
        assert_eq!(h.handle.state().await.unwrap(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_before_ingest_skips_delete() {
        let h = start(WhipConfig::new(ENDPOINT), FakeSignaling::new(), FakeMedia::new());

        h.handle.destroy().await.unwrap();
        h.handle.destroy().await.unwrap();

        assert!(h.signaling.calls().is_empty());
        assert!(h.media.calls().contains(&"close".to_owned()));
        assert!(matches!(
            h.handle.ingest(Vec::new()).await,
            Err(WhipError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_patch_falls_back_to_bulk() {
        let signaling = trickle_signaling().with_patch_status(405);
        let h = start(WhipConfig::new(ENDPOINT), signaling, FakeMedia::new());
        h.handle.ingest(Vec::new()).await.unwrap();

        for port in 1..=3 {
            h.events
                .send(MediaEvent::LocalCandidate(candidate(port)))
                .await
                .unwrap();
        }
        settle().await;

        assert_eq!(h.signaling.patches().len(), 1);
        assert_eq!(h.handle.state().await.unwrap(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failure_tears_down() {
        let h = start(WhipConfig::new(ENDPOINT), trickle_signaling(), FakeMedia::new());
        h.handle.ingest(Vec::new()).await.unwrap();

        h.events
            .send(MediaEvent::IceConnectionStateChanged(IceConnectionState::Failed))
            .await
            .unwrap();
        h.events
            .send(MediaEvent::ConnectionStateChanged(ConnectionState::Failed))
            .await
            .unwrap();
        settle().await;

        assert_eq!(h.signaling.deletes().len(), 1);
        assert_eq!(h.handle.state().await.unwrap(), SessionState::Failed);
        assert_eq!(
            h.handle.ice_connection_state().await.unwrap(),
            IceConnectionState::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_destroys() {
        let h = start(WhipConfig::new(ENDPOINT), trickle_signaling(), FakeMedia::new());
        h.handle.ingest(Vec::new()).await.unwrap();

        let Harness {
            handle,
            signaling,
            media,
            events: _events,
        } = h;
        drop(handle);
        settle().await;

        assert_eq!(signaling.deletes().len(), 1);
        assert!(media.calls().contains(&"close".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extensions_available_after_connect() {
        let mut ok = created("/r/1", Some("e"));
        ok.headers.append(
            header::LINK,
            header::HeaderValue::from_static("<urn:ietf:params:whip:ext:example:1>; rel=\"urn:ietf:params:whip:ext:example:1\""),
        );
        let signaling = FakeSignaling::new()
            .with_options_response(options(None, &[]))
            .with_offer_response(Ok(ok));
        let h = start(WhipConfig::new(ENDPOINT), signaling, FakeMedia::new());

        h.handle.ingest(Vec::new()).await.unwrap();
        let extensions = h.handle.resource_extensions().await.unwrap();
        assert_eq!(extensions.len(), 1);
        assert!(extensions[0].starts_with("<urn:ietf:params:whip:ext:example:1>"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ice_bootstrap() {
        let h = start(WhipConfig::new(ENDPOINT), FakeSignaling::new(), FakeMedia::new());
        assert_eq!(
            h.handle.set_ice_servers_from_endpoint().await.unwrap(),
            IceBootstrap::Skipped(Warning::NoAuthToken)
        );
        assert!(h.signaling.calls().is_empty());

        let config = WhipConfig {
            auth_token: Some("secret".into()),
            ..WhipConfig::new(ENDPOINT)
        };
        let signaling = FakeSignaling::new().with_options_response(options(
            Some("POST, PATCH"),
            &[
                "<stun:stun.example.net>; rel=\"ice-server\"",
                "<turn:turn.example.net?transport=udp>; rel=\"ice-server\"; username=\"u\"; credential=\"c\"",
            ],
        ));
        let h = start(config, signaling, FakeMedia::new());

        match h.handle.set_ice_servers_from_endpoint().await.unwrap() {
            IceBootstrap::Applied(servers) => assert_eq!(servers.len(), 2),
            other => panic!("unexpected bootstrap {:?}", other),
        }
        assert_eq!(h.media.ice_servers()[1].username.as_deref(), Some("u"));
        assert_eq!(
            h.signaling.calls(),
            vec![Call::Options {
                auth: Some("secret".into())
            }]
        );
    }
}
