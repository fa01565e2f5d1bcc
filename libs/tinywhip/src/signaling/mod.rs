// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// WHIP/WHEP Signaling Transport
//
// The four HTTP verbs of RFC 9725: POST offer, OPTIONS capabilities,
// PATCH trickle ICE, DELETE session. Implementations do not retry and do not
// treat non-2xx statuses as errors; callers inspect the status themselves.
// Only network, timeout and request-building failures surface as `Err`.

pub mod http;

pub use http::HttpSignaling;

use crate::error::Result;
use bytes::Bytes;
use hyper::{HeaderMap, StatusCode, header};
use std::future::Future;
use url::Url;

pub const SDP_CONTENT_TYPE: &str = "application/sdp";
pub const TRICKLE_ICE_CONTENT_TYPE: &str = "application/trickle-ice-sdpfrag";

/// Status, headers and body of one signaling round-trip.
#[derive(Debug, Clone)]
pub struct SignalingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SignalingResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every occurrence of a header, in the order received.
    pub fn header_all(&self, name: impl header::AsHeaderName) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// Body as text; invalid UTF-8 is replaced rather than rejected.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether `Access-Control-Allow-Methods` lists `PATCH`.
    pub fn allows_patch(&self) -> bool {
        self.header(header::ACCESS_CONTROL_ALLOW_METHODS)
            .map(|methods| methods.split(',').any(|m| m.trim() == "PATCH"))
            .unwrap_or(false)
    }
}

/// HTTP side of a WHIP/WHEP session.
pub trait SignalingTransport: Send + Sync + 'static {
    /// POST the SDP offer to the endpoint (`Content-Type: application/sdp`).
    fn send_offer(
        &self,
        endpoint: &Url,
        auth_token: Option<&str>,
        sdp_offer: &str,
    ) -> impl Future<Output = Result<SignalingResponse>> + Send;

    /// OPTIONS the endpoint to discover allowed methods and `Link` ICE servers.
    fn get_configuration(
        &self,
        endpoint: &Url,
        auth_token: Option<&str>,
    ) -> impl Future<Output = Result<SignalingResponse>> + Send;

    /// PATCH a trickle-ICE fragment, guarded by the session's ETag.
    fn update_ice(
        &self,
        resource: &Url,
        etag: &str,
        sdp_fragment: &str,
    ) -> impl Future<Output = Result<SignalingResponse>> + Send;

    /// DELETE the session resource. Best-effort: callers log failures.
    fn delete(&self, resource: &Url) -> impl Future<Output = Result<SignalingResponse>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_allows_patch() {
        let mut response = SignalingResponse::new(StatusCode::NO_CONTENT);
        assert!(!response.allows_patch());

        response.headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST, OPTIONS"),
        );
        assert!(!response.allows_patch());

        response.headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST,PATCH , DELETE"),
        );
        assert!(response.allows_patch());
    }

    #[test]
    fn test_header_all_keeps_order() {
        let mut response = SignalingResponse::new(StatusCode::OK);
        response
            .headers
            .append(header::LINK, HeaderValue::from_static("first"));
        response
            .headers
            .append(header::LINK, HeaderValue::from_static("second"));

        assert_eq!(response.header_all(header::LINK), vec!["first", "second"]);
        assert_eq!(response.header(header::LINK), Some("first"));
    }
}
