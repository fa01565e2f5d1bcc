// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// WHEP Playback Negotiation
//
// Stateless per attempt: every iteration creates a fresh offer, waits for ICE
// gathering (bounded), and POSTs it. 200/201 applies the answer and returns;
// 405 stops with a configuration error; anything else waits a fixed delay and
// tries again until the media transport reports `Closed`.

use crate::config::WhepConfig;
use crate::error::{Result, WhipError};
use crate::media::{
    ConnectionState, IceGatheringState, MediaEvent, MediaTransport, OfferOptions,
};
use crate::signaling::SignalingTransport;
use hyper::header;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Timing of the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Upper bound on the ICE gathering wait before each POST.
    pub gather_timeout: Duration,
    /// Fixed delay after a failed attempt.
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&WhepConfig::default())
    }
}

impl From<&WhepConfig> for ReconnectPolicy {
    fn from(config: &WhepConfig) -> Self {
        Self {
            gather_timeout: config.ice_gathering_timeout(),
            retry_delay: config.reconnect_delay(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Answer applied. Carries the response `Location` header, if any.
    Established { location: Option<String> },
    /// The media transport was closed before a session was established.
    Closed,
}

/// Negotiates a playback session, retrying failed attempts.
///
/// Returns `Err(WhipError::Configuration)` on HTTP 405 without retrying.
/// Media-transport failures (offer, descriptions) are returned as-is.
pub async fn negotiate_with_reconnect<S, M>(
    signaling: &S,
    media: &M,
    events: &mut mpsc::Receiver<MediaEvent>,
    endpoint: &Url,
    auth_token: Option<&str>,
    policy: &ReconnectPolicy,
) -> Result<ReconnectOutcome>
where
    S: SignalingTransport,
    M: MediaTransport,
{
    let mut attempt = 0u32;

    while media.connection_state() != ConnectionState::Closed {
        attempt += 1;

        let offer = media
            .create_offer(OfferOptions { send_only: false })
            .await?;
        media.set_local_description(&offer).await?;
        wait_for_gathering(media, events, policy.gather_timeout).await;

        let Some(local_sdp) = media.local_description().await else {
            return Err(WhipError::TransportFailure(
                "failed to gather ICE candidates for offer".into(),
            ));
        };

        tracing::debug!("[WhepClient] Attempt {} POST {}", attempt, endpoint);
        match signaling.send_offer(endpoint, auth_token, &local_sdp).await {
            Ok(response) if matches!(response.status.as_u16(), 200 | 201) => {
                media.set_remote_description(&response.text()).await?;
                let location = response.header(header::LOCATION).map(str::to_owned);
                tracing::info!(
                    "[WhepClient] Session established after {} attempt(s) (Location: {:?})",
                    attempt,
                    location
                );
                return Ok(ReconnectOutcome::Established { location });
            }
            Ok(response) if response.status.as_u16() == 405 => {
                tracing::error!("[WhepClient] Update the URL passed into the WHEP client");
                return Err(WhipError::Configuration(format!(
                    "Method not allowed at {}",
                    endpoint
                )));
            }
            Ok(response) => {
                tracing::error!(
                    "[WhepClient] Offer rejected (HTTP {}): {}",
                    response.status,
                    response.text()
                );
            }
            Err(e) => {
                tracing::error!("[WhepClient] Offer request failed: {}", e);
            }
        }

        if media.connection_state() == ConnectionState::Closed {
            break;
        }

        tracing::debug!(
            "[WhepClient] Retrying in {}ms",
            policy.retry_delay.as_millis()
        );
        tokio::time::sleep(policy.retry_delay).await;
    }

    tracing::info!("[WhepClient] Connection closed, giving up negotiation");
    Ok(ReconnectOutcome::Closed)
}

/// Waits until the transport reports gathering complete or the timeout passes.
async fn wait_for_gathering<M: MediaTransport>(
    media: &M,
    events: &mut mpsc::Receiver<MediaEvent>,
    timeout: Duration,
) {
    if media.ice_gathering_state() == IceGatheringState::Complete {
        return;
    }

    let gathered = async {
        while let Some(event) = events.recv().await {
            match event {
                MediaEvent::EndOfCandidates
                | MediaEvent::IceGatheringStateChanged(IceGatheringState::Complete) => return,
                _ => {}
            }
        }
        // Channel closed: only the timer can end the wait now
        std::future::pending::<()>().await
    };

    if tokio::time::timeout(timeout, gathered).await.is_err() {
        tracing::debug!(
            "[WhepClient] ICE gathering not complete after {}ms, sending what we have",
            timeout.as_millis()
        );
    }
}

/// Playback session: reconnect loop plus resource bookkeeping for teardown.
pub struct WhepClient<S: SignalingTransport, M: MediaTransport> {
    config: WhepConfig,
    endpoint: Url,
    signaling: Arc<S>,
    media: Arc<M>,
    events: mpsc::Receiver<MediaEvent>,
    session_url: Option<Url>,
}

impl<S: SignalingTransport, M: MediaTransport> WhepClient<S, M> {
    pub fn new(
        config: WhepConfig,
        signaling: Arc<S>,
        media: Arc<M>,
        events: mpsc::Receiver<MediaEvent>,
    ) -> Result<Self> {
        let endpoint = config.validate()?;
        Ok(Self {
            config,
            endpoint,
            signaling,
            media,
            events,
            session_url: None,
        })
    }

    pub fn session_url(&self) -> Option<&Url> {
        self.session_url.as_ref()
    }

    /// Runs the reconnect loop and remembers the session resource.
    pub async fn connect(&mut self) -> Result<ReconnectOutcome> {
        if !self.config.ice_servers.is_empty() {
            self.media.apply_ice_servers(&self.config.ice_servers).await?;
        }

        let policy = ReconnectPolicy::from(&self.config);
        let outcome = negotiate_with_reconnect(
            self.signaling.as_ref(),
            self.media.as_ref(),
            &mut self.events,
            &self.endpoint,
            self.config.auth_token.as_deref(),
            &policy,
        )
        .await?;

        if let ReconnectOutcome::Established {
            location: Some(location),
        } = &outcome
        {
            match self.endpoint.join(location) {
                Ok(url) => self.session_url = Some(url),
                Err(e) => tracing::warn!("[WhepClient] Invalid Location '{}': {}", location, e),
            }
        }

        Ok(outcome)
    }

    /// DELETEs the session resource (best-effort) and closes the transport.
    pub async fn terminate(&mut self) -> Result<()> {
        if let Some(url) = self.session_url.take() {
            match self.signaling.delete(&url).await {
                Ok(response) if response.ok() => {
                    tracing::info!("[WhepClient] Deleted session {}", url)
                }
                Ok(response) => tracing::warn!(
                    "[WhepClient] {}",
                    WhipError::Teardown(format!("DELETE {} returned HTTP {}", url, response.status))
                ),
                Err(e) => tracing::warn!("[WhepClient] DELETE {} failed: {}", url, e),
            }
        }

        self.media.close().await
    }
}
