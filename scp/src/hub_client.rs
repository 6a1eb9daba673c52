//! Typed HTTP client for a remote SCP hub.
//!
//! [`HubClient`] covers the endpoints agents and payees call:
//! `/.well-known/x402`, `/v1/tickets/quote`, `/v1/tickets/issue`,
//! `/v1/payments/{id}`, `/v1/channels/{id}`, `/v1/channels?payer=` and
//! `/v1/webhooks`.
//!
//! The hub's self-description is cached with a TTL since fee policy and
//! address change rarely and are consulted on every payment.

use std::fmt::Display;
use std::time::{Duration, Instant};

use alloy_primitives::{Address, B256};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use tokio::sync::RwLock;
use url::Url;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::error::ErrorBody;
use crate::proto::{
    ADMIN_TOKEN_HEADER, ChannelList, ChannelView, HubInfo, IssueRequest, IssueResponse,
    PaymentRecord, Quote, QuoteRequest, WebhookRegistered, WebhookRegistration,
};

/// Errors that can occur while talking to a hub.
#[derive(Debug, thiserror::Error)]
pub enum HubClientError {
    /// URL parse error.
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        /// Human-readable context.
        context: &'static str,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },
    /// HTTP transport error.
    #[error("HTTP error: {context}: {source}")]
    Http {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// JSON deserialization error.
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// Non-success HTTP status.
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        /// Human-readable context.
        context: &'static str,
        /// The HTTP status code.
        status: StatusCode,
        /// The response body.
        body: String,
    },
}

impl HubClientError {
    /// The hub's structured error, if the failure carried one.
    #[must_use]
    pub fn error_body(&self) -> Option<ErrorBody> {
        match self {
            Self::HttpStatus { body, .. } => serde_json::from_str(body).ok(),
            _ => None,
        }
    }

    /// HTTP status, if the hub answered.
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct CachedInfo {
    info: HubInfo,
    expires_at: Instant,
}

/// A client for one hub.
#[derive(Debug)]
pub struct HubClient {
    base_url: Url,
    client: Client,
    headers: HeaderMap,
    timeout: Option<Duration>,
    info_ttl: Duration,
    info_cache: RwLock<Option<CachedInfo>>,
}

impl Clone for HubClient {
    fn clone(&self) -> Self {
        Self {
            base_url: self.base_url.clone(),
            client: self.client.clone(),
            headers: self.headers.clone(),
            timeout: self.timeout,
            info_ttl: self.info_ttl,
            info_cache: RwLock::new(None),
        }
    }
}

impl HubClient {
    /// Default TTL for the cached `/.well-known/x402` document.
    pub const DEFAULT_INFO_TTL: Duration = Duration::from_secs(60);

    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

    /// Creates a client for the hub at `endpoint`. Trailing slashes are
    /// ignored; a path prefix such as `/hub/base` is kept.
    ///
    /// # Errors
    ///
    /// Returns [`HubClientError::UrlParse`] if `endpoint` is not a URL.
    pub fn new(endpoint: &str) -> Result<Self, HubClientError> {
        let mut normalized = endpoint.trim_end_matches('/').to_owned();
        normalized.push('/');
        let base_url = Url::parse(&normalized).map_err(|e| HubClientError::UrlParse {
            context: "Failed to parse hub url",
            source: e,
        })?;
        Ok(Self {
            base_url,
            client: Client::new(),
            headers: HeaderMap::new(),
            timeout: Some(Self::DEFAULT_TIMEOUT),
            info_ttl: Self::DEFAULT_INFO_TTL,
            info_cache: RwLock::new(None),
        })
    }

    /// Uses a shared reqwest client.
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Sets a timeout for all future requests.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the TTL of the hub info cache. `Duration::ZERO` disables it.
    #[must_use]
    pub const fn with_info_ttl(mut self, ttl: Duration) -> Self {
        self.info_ttl = ttl;
        self
    }

    /// Sends `x-scp-admin-token` with every request.
    #[must_use]
    pub fn with_admin_token(mut self, token: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(token) {
            self.headers
                .insert(HeaderName::from_static(ADMIN_TOKEN_HEADER), value);
        }
        self
    }

    /// Hub base URL, always with a trailing slash.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The endpoint as configured, without trailing slash.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// `GET /.well-known/x402`, served from cache while fresh.
    ///
    /// # Errors
    ///
    /// Returns [`HubClientError`] if the request fails.
    pub async fn info(&self) -> Result<HubInfo, HubClientError> {
        if let Some(cached) = self.info_cache.read().await.as_ref()
            && Instant::now() < cached.expires_at
        {
            return Ok(cached.info.clone());
        }
        let info: HubInfo = self
            .get_json(".well-known/x402", "GET /.well-known/x402")
            .await?;
        *self.info_cache.write().await = Some(CachedInfo {
            info: info.clone(),
            expires_at: Instant::now() + self.info_ttl,
        });
        Ok(info)
    }

    /// `POST /v1/tickets/quote`.
    ///
    /// # Errors
    ///
    /// Returns [`HubClientError`] if the request fails or the hub rejects it.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "scp.hub_client.quote", skip_all, fields(payment_id = %request.payment_id), err)
    )]
    pub async fn quote(&self, request: &QuoteRequest) -> Result<Quote, HubClientError> {
        self.post_json("v1/tickets/quote", "POST /v1/tickets/quote", request)
            .await
    }

    /// `POST /v1/tickets/issue`.
    ///
    /// # Errors
    ///
    /// Returns [`HubClientError`] if the request fails or the hub rejects it.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "scp.hub_client.issue", skip_all, fields(payment_id = %request.quote.payment_id), err)
    )]
    pub async fn issue(&self, request: &IssueRequest) -> Result<IssueResponse, HubClientError> {
        self.post_json("v1/tickets/issue", "POST /v1/tickets/issue", request)
            .await
    }

    /// `GET /v1/payments/{id}`.
    ///
    /// # Errors
    ///
    /// Returns [`HubClientError`] if the request fails; unknown payments are
    /// a 404 [`HubClientError::HttpStatus`].
    pub async fn payment(&self, payment_id: &str) -> Result<PaymentRecord, HubClientError> {
        self.get_json(&format!("v1/payments/{payment_id}"), "GET /v1/payments/{id}")
            .await
    }

    /// `GET /v1/channels/{id}`.
    ///
    /// # Errors
    ///
    /// Returns [`HubClientError`] if the request fails.
    pub async fn channel(&self, channel_id: B256) -> Result<ChannelView, HubClientError> {
        self.get_json(&format!("v1/channels/{channel_id}"), "GET /v1/channels/{id}")
            .await
    }

    /// `GET /v1/channels?payer=`.
    ///
    /// # Errors
    ///
    /// Returns [`HubClientError`] if the request fails.
    pub async fn channels_by_payer(&self, payer: Address) -> Result<ChannelList, HubClientError> {
        self.get_json(&format!("v1/channels?payer={payer}"), "GET /v1/channels")
            .await
    }

    /// `POST /v1/webhooks`.
    ///
    /// # Errors
    ///
    /// Returns [`HubClientError`] if the request fails or the hub rejects it.
    pub async fn register_webhook(
        &self,
        registration: &WebhookRegistration,
    ) -> Result<WebhookRegistered, HubClientError> {
        self.post_json("v1/webhooks", "POST /v1/webhooks", registration)
            .await
    }

    fn url(&self, path: &str, context: &'static str) -> Result<Url, HubClientError> {
        self.base_url
            .join(path)
            .map_err(|e| HubClientError::UrlParse { context, source: e })
    }

    async fn post_json<T, R>(
        &self,
        path: &str,
        context: &'static str,
        payload: &T,
    ) -> Result<R, HubClientError>
    where
        T: serde::Serialize + Sync + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let url = self.url(path, context)?;
        let req = self.client.post(url).json(payload);
        self.send(req, context).await
    }

    async fn get_json<R>(&self, path: &str, context: &'static str) -> Result<R, HubClientError>
    where
        R: serde::de::DeserializeOwned,
    {
        let url = self.url(path, context)?;
        let req = self.client.get(url);
        self.send(req, context).await
    }

    async fn send<R>(
        &self,
        mut req: reqwest::RequestBuilder,
        context: &'static str,
    ) -> Result<R, HubClientError>
    where
        R: serde::de::DeserializeOwned,
    {
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let response = req
            .send()
            .await
            .map_err(|e| HubClientError::Http { context, source: e })?;

        let result = if response.status().is_success() {
            response
                .json::<R>()
                .await
                .map_err(|e| HubClientError::JsonDeserialization { context, source: e })
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(HubClientError::HttpStatus {
                context,
                status,
                body,
            })
        };
        log_failure(&result);
        result
    }
}

#[cfg(feature = "telemetry")]
fn log_failure<R, E: Display>(result: &Result<R, E>) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "hub request failed");
    }
}

#[cfg(not(feature = "telemetry"))]
fn log_failure<R, E: Display>(_result: &Result<R, E>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn info_body() -> serde_json::Value {
        json!({
            "hubName": "pay.eth",
            "address": "0x00000000000000000000000000000000000000bb",
            "chainId": 8453,
            "schemes": ["statechannel-hub-v1"],
            "feePolicy": { "base": "10", "bps": 30, "gasSurcharge": "0" }
        })
    }

    #[tokio::test]
    async fn info_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hub/base/.well-known/x402"))
            .respond_with(ResponseTemplate::new(200).set_body_json(info_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = HubClient::new(&format!("{}/hub/base/", server.uri())).unwrap();
        assert_eq!(client.endpoint(), format!("{}/hub/base", server.uri()));
        let first = client.info().await.unwrap();
        let second = client.info().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.fee_policy.bps, 30);
    }

    #[tokio::test]
    async fn error_bodies_are_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/pay_missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "errorCode": "SCP_007_CHANNEL_NOT_FOUND",
                "message": "payment not found",
                "retryable": false
            })))
            .mount(&server)
            .await;

        let client = HubClient::new(&server.uri()).unwrap();
        let err = client.payment("pay_missing").await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(err.error_body().unwrap().message, "payment not found");
    }

    #[tokio::test]
    async fn webhook_registration_sends_admin_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/webhooks"))
            .and(header("x-scp-admin-token", "letmein"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "webhookId": "wh_0011223344556677",
                "status": "active",
                "secret": "abc"
            })))
            .mount(&server)
            .await;

        let client = HubClient::new(&server.uri())
            .unwrap()
            .with_admin_token("letmein");
        let registered = client
            .register_webhook(&WebhookRegistration {
                url: "http://127.0.0.1:4042/webhooks/hub".to_owned(),
                events: Some(vec!["payment.received".to_owned()]),
                channel_id: Some("*".to_owned()),
                secret: None,
            })
            .await
            .unwrap();
        assert_eq!(registered.secret, "abc");
    }

    #[tokio::test]
    async fn channels_by_payer_passes_query() {
        let server = MockServer::start().await;
        let payer = Address::repeat_byte(0xaa);
        Mock::given(method("GET"))
            .and(path("/v1/channels"))
            .and(query_param("payer", payer.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "channels": [] })))
            .mount(&server)
            .await;

        let client = HubClient::new(&server.uri()).unwrap();
        let list = client.channels_by_payer(payer).await.unwrap();
        assert!(list.channels.is_empty());
    }
}
