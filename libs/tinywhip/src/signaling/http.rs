// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// hyper-based Signaling Transport
//
// HTTPS via rustls (ring provider, native CA roots), plain http allowed for
// local testing. Every call is bounded by the request timeout.

use super::{SDP_CONTENT_TYPE, SignalingResponse, SignalingTransport, TRICKLE_ICE_CONTENT_TYPE};
use crate::error::{Result, WhipError};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::{Method, Request, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use std::time::Duration;
use url::Url;

type HttpClient = Client<
    hyper_rustls::HttpsConnector<HttpConnector>,
    BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>,
>;

/// WHIP/WHEP HTTP client.
///
/// The auth token passed to `send_offer`/`get_configuration` is used for those
/// calls; the token set with [`HttpSignaling::with_auth_token`] is added to
/// PATCH and DELETE, which carry no token of their own.
#[derive(Clone)]
pub struct HttpSignaling {
    http_client: HttpClient,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpSignaling {
    pub fn new(timeout: Duration) -> Result<Self> {
        // Install rustls crypto provider if needed
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            // Another thread may win the race; that is fine.
            let _ = rustls::crypto::ring::default_provider().install_default();
        }

        tracing::debug!("[HttpSignaling] Building HTTPS connector with native roots...");
        let builder = match hyper_rustls::HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                // Plain http keeps working; https endpoints fail verification.
                tracing::warn!("[HttpSignaling] No native CA roots available: {}", e);
                let tls = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(tls)
            }
        };

        let https = builder
            .https_or_http() // Allow http:// for local testing
            .enable_http1()
            .enable_http2()
            .build();

        let http_client = Client::builder(hyper_util::rt::TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(https);

        Ok(Self {
            http_client,
            auth_token: None,
            timeout,
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token;
        self
    }

    async fn execute(
        &self,
        method: Method,
        url: &Url,
        auth_token: Option<&str>,
        extra_headers: &[(header::HeaderName, &str)],
        body: Option<(&'static str, &str)>,
    ) -> Result<SignalingResponse> {
        let mut req_builder = Request::builder().method(method.clone()).uri(url.as_str());

        // Add Authorization header only if token is provided
        if let Some(token) = auth_token {
            req_builder = req_builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        for (name, value) in extra_headers {
            req_builder = req_builder.header(name, *value);
        }

        let boxed_body = match body {
            Some((content_type, payload)) => {
                req_builder = req_builder.header(header::CONTENT_TYPE, content_type);
                Full::new(Bytes::from(payload.to_owned()))
                    .map_err(|never| match never {})
                    .boxed()
            }
            None => Empty::<Bytes>::new().map_err(|never| match never {}).boxed(),
        };

        let req = req_builder.body(boxed_body).map_err(|e| {
            WhipError::Http(format!("Failed to build {} request: {}", method, e))
        })?;

        tracing::debug!("[HttpSignaling] {} {}", method, url);

        let response = tokio::time::timeout(self.timeout, self.http_client.request(req))
            .await
            .map_err(|_| {
                WhipError::Http(format!(
                    "{} {} timed out after {}ms",
                    method,
                    url,
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| WhipError::Http(format!("{} {} failed: {}", method, url, e)))?;

        let status = response.status();
        let headers = response.headers().clone();

        let body = tokio::time::timeout(self.timeout, response.into_body().collect())
            .await
            .map_err(|_| WhipError::Http(format!("{} {} body timed out", method, url)))?
            .map_err(|e| WhipError::Http(format!("Failed to read {} response: {}", method, e)))?
            .to_bytes();

        tracing::debug!("[HttpSignaling] {} {} -> {}", method, url, status);

        Ok(SignalingResponse {
            status,
            headers,
            body,
        })
    }
}

impl SignalingTransport for HttpSignaling {
    async fn send_offer(
        &self,
        endpoint: &Url,
        auth_token: Option<&str>,
        sdp_offer: &str,
    ) -> Result<SignalingResponse> {
        self.execute(
            Method::POST,
            endpoint,
            auth_token,
            &[],
            Some((SDP_CONTENT_TYPE, sdp_offer)),
        )
        .await
    }

    async fn get_configuration(
        &self,
        endpoint: &Url,
        auth_token: Option<&str>,
    ) -> Result<SignalingResponse> {
        self.execute(Method::OPTIONS, endpoint, auth_token, &[], None)
            .await
    }

    async fn update_ice(
        &self,
        resource: &Url,
        etag: &str,
        sdp_fragment: &str,
    ) -> Result<SignalingResponse> {
        // Servers following RFC 9725 check If-Match; older ones read ETag.
        self.execute(
            Method::PATCH,
            resource,
            self.auth_token.as_deref(),
            &[(header::ETAG, etag), (header::IF_MATCH, etag)],
            Some((TRICKLE_ICE_CONTENT_TYPE, sdp_fragment)),
        )
        .await
    }

    async fn delete(&self, resource: &Url) -> Result<SignalingResponse> {
        self.execute(
            Method::DELETE,
            resource,
            self.auth_token.as_deref(),
            &[],
            None,
        )
        .await
    }
}
