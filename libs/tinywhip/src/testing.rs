// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// In-memory signaling and media fakes shared by the driver tests.

use crate::config::IceServer;
use crate::error::{Result, WhipError};
use crate::media::{
    ConnectionState, IceGatheringState, MediaTransport, OfferOptions,
};
use crate::signaling::{SignalingResponse, SignalingTransport};
use hyper::header::{self, HeaderValue};
use hyper::StatusCode;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use url::Url;

pub const OFFER: &str = "v=0\r\n\
    o=- 1 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    a=ice-ufrag:uf\r\n\
    a=ice-pwd:pw\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
    a=mid:0\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
    a=mid:1\r\n";

pub const ANSWER: &str = "v=0\r\no=- 3 4 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Options { auth: Option<String> },
    Post { auth: Option<String>, sdp: String },
    Patch { resource: Url, etag: String, fragment: String },
    Delete(Url),
}

pub fn response(status: u16) -> SignalingResponse {
    SignalingResponse::new(StatusCode::from_u16(status).unwrap())
}

pub fn created(location: &str, etag: Option<&str>) -> SignalingResponse {
    let mut response = response(201);
    response
        .headers
        .insert(header::LOCATION, HeaderValue::from_str(location).unwrap());
    if let Some(etag) = etag {
        response
            .headers
            .insert(header::ETAG, HeaderValue::from_str(etag).unwrap());
    }
    response.body = ANSWER.into();
    response
}

pub fn options(allow: Option<&str>, links: &[&str]) -> SignalingResponse {
    let mut response = response(204);
    if let Some(allow) = allow {
        response.headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_str(allow).unwrap(),
        );
    }
    for link in links {
        response
            .headers
            .append(header::LINK, HeaderValue::from_str(link).unwrap());
    }
    response
}

#[derive(Default)]
pub struct FakeSignaling {
    calls: Mutex<Vec<Call>>,
    offer_responses: Mutex<VecDeque<Result<SignalingResponse>>>,
    options_response: Mutex<Option<SignalingResponse>>,
    patch_status: Mutex<Option<u16>>,
    /// When set, every POST waits for one notification before answering.
    offer_gate: Option<Arc<Notify>>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offer_response(self, response: Result<SignalingResponse>) -> Self {
        self.offer_responses.lock().unwrap().push_back(response);
        self
    }

    pub fn with_options_response(self, response: SignalingResponse) -> Self {
        *self.options_response.lock().unwrap() = Some(response);
        self
    }

    pub fn with_patch_status(self, status: u16) -> Self {
        *self.patch_status.lock().unwrap() = Some(status);
        self
    }

    pub fn with_offer_gate(mut self, gate: Arc<Notify>) -> Self {
        self.offer_gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn posts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Post { .. }))
            .count()
    }

    pub fn patches(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Patch { .. }))
            .collect()
    }

    pub fn deletes(&self) -> Vec<Url> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Delete(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl SignalingTransport for FakeSignaling {
    async fn send_offer(
        &self,
        _endpoint: &Url,
        auth_token: Option<&str>,
        sdp_offer: &str,
    ) -> Result<SignalingResponse> {
        self.record(Call::Post {
            auth: auth_token.map(str::to_owned),
            sdp: sdp_offer.to_owned(),
        });
        if let Some(gate) = &self.offer_gate {
            gate.notified().await;
        }
        let next = self.offer_responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(WhipError::Http("no scripted offer response".into())))
    }

    async fn get_configuration(
        &self,
        _endpoint: &Url,
        auth_token: Option<&str>,
    ) -> Result<SignalingResponse> {
        self.record(Call::Options {
            auth: auth_token.map(str::to_owned),
        });
        let scripted = self.options_response.lock().unwrap().clone();
        scripted.ok_or_else(|| WhipError::Http("connection refused".into()))
    }

    async fn update_ice(
        &self,
        resource: &Url,
        etag: &str,
        sdp_fragment: &str,
    ) -> Result<SignalingResponse> {
        self.record(Call::Patch {
            resource: resource.clone(),
            etag: etag.to_owned(),
            fragment: sdp_fragment.to_owned(),
        });
        let status = self.patch_status.lock().unwrap().unwrap_or(204);
        Ok(response(status))
    }

    async fn delete(&self, resource: &Url) -> Result<SignalingResponse> {
        self.record(Call::Delete(resource.clone()));
        Ok(response(200))
    }
}

pub struct FakeMedia {
    calls: Mutex<Vec<String>>,
    gathering: Mutex<IceGatheringState>,
    connection: Mutex<ConnectionState>,
    ice_servers: Mutex<Vec<IceServer>>,
}

impl FakeMedia {
    /// Gathering already complete, so offers go out without waiting.
    pub fn new() -> Self {
        Self::with_gathering(IceGatheringState::Complete)
    }

    pub fn with_gathering(state: IceGatheringState) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            gathering: Mutex::new(state),
            connection: Mutex::new(ConnectionState::New),
            ice_servers: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers.lock().unwrap().clone()
    }

    pub fn set_gathering(&self, state: IceGatheringState) {
        *self.gathering.lock().unwrap() = state;
    }

    pub fn set_connection(&self, state: ConnectionState) {
        *self.connection.lock().unwrap() = state;
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl MediaTransport for FakeMedia {
    type Track = String;

    async fn apply_ice_servers(&self, servers: &[IceServer]) -> Result<()> {
        self.record(format!("apply_ice_servers:{}", servers.len()));
        *self.ice_servers.lock().unwrap() = servers.to_vec();
        Ok(())
    }

    async fn add_track(&self, track: String) -> Result<()> {
        self.record(format!("add_track:{}", track));
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<String> {
        self.record(format!("create_offer:send_only={}", options.send_only));
        Ok(OFFER.to_owned())
    }

    async fn set_local_description(&self, _sdp: &str) -> Result<()> {
        self.record("set_local_description");
        Ok(())
    }

    async fn local_description(&self) -> Option<String> {
        Some(OFFER.to_owned())
    }

    async fn set_remote_description(&self, answer_sdp: &str) -> Result<()> {
        self.record("set_remote_description");
        if answer_sdp.is_empty() {
            return Err(WhipError::TransportFailure("empty answer".into()));
        }
        Ok(())
    }

    async fn stop_senders(&self) {
        self.record("stop_senders");
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        self.set_connection(ConnectionState::Closed);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.connection.lock().unwrap()
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        *self.gathering.lock().unwrap()
    }
}
