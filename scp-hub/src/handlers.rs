//! Axum route handlers for the hub API.
//!
//! Public endpoints quote and issue tickets and expose payment and channel
//! status. Webhook and event endpoints require the admin token, passed as
//! `x-scp-admin-token` or `Authorization: Bearer`.

use std::sync::Arc;

use alloy_primitives::{Address, B256};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use scp::ScpErrorCode;
use scp::proto::{
    ADMIN_TOKEN_HEADER, ChannelList, ChannelView, EventKind, HubInfo, IssueRequest,
    IssueResponse, PaymentRecord, Quote, QuoteRequest, WebhookRegistered, WebhookRegistration,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::HubError;
use crate::service::HubService;
use crate::webhooks::{EventPage, Webhook, WebhookUpdate};

/// Shared application state for the hub router.
pub type SharedHub = Arc<HubService>;

/// `GET /.well-known/x402`
pub async fn get_info(State(hub): State<SharedHub>) -> Json<HubInfo> {
    Json(hub.info())
}

/// `POST /v1/tickets/quote`
///
/// # Errors
///
/// 400 on invalid input or fee above `maxFee`, 409 on a reused payment id.
pub async fn post_quote(
    State(hub): State<SharedHub>,
    body: Result<Json<QuoteRequest>, JsonRejection>,
) -> Result<Json<Quote>, HubError> {
    let Json(request) = body?;
    Ok(Json(hub.quote(request).await?))
}

/// `POST /v1/tickets/issue`
///
/// # Errors
///
/// 409 when the state does not match its quote or channel, 503 when a
/// first-seen channel cannot be checked on-chain.
pub async fn post_issue(
    State(hub): State<SharedHub>,
    body: Result<Json<IssueRequest>, JsonRejection>,
) -> Result<Json<IssueResponse>, HubError> {
    let Json(request) = body?;
    Ok(Json(hub.issue(request).await?))
}

/// `GET /v1/payments/{id}`
///
/// # Errors
///
/// 404 if the payment is unknown.
pub async fn get_payment(
    State(hub): State<SharedHub>,
    Path(payment_id): Path<String>,
) -> Result<Json<PaymentRecord>, HubError> {
    Ok(Json(hub.payment(&payment_id).await?))
}

/// `GET /v1/channels/{id}`
///
/// # Errors
///
/// 400 if the id is not a 32-byte hex string.
pub async fn get_channel(
    State(hub): State<SharedHub>,
    Path(channel_id): Path<String>,
) -> Result<Json<ChannelView>, HubError> {
    let channel_id: B256 = channel_id
        .parse()
        .map_err(|_| HubError::bad_request("invalid channel id"))?;
    Ok(Json(hub.channel(channel_id).await))
}

/// `GET /v1/channels` query.
#[derive(Debug, Deserialize)]
pub struct ChannelsQuery {
    payer: Option<String>,
}

/// `GET /v1/channels?payer=0x...`
///
/// # Errors
///
/// 400 if `payer` is missing or not an address.
pub async fn list_channels(
    State(hub): State<SharedHub>,
    Query(query): Query<ChannelsQuery>,
) -> Result<Json<ChannelList>, HubError> {
    let payer: Address = query
        .payer
        .as_deref()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| HubError::bad_request("payer query parameter must be an address"))?;
    Ok(Json(ChannelList {
        channels: hub.channels_by_payer(payer).await,
    }))
}

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim)
}

/// `POST /v1/webhooks`
///
/// # Errors
///
/// 401/403 without admin auth, 400 on an invalid registration.
pub async fn post_webhook(
    State(hub): State<SharedHub>,
    headers: HeaderMap,
    body: Result<Json<WebhookRegistration>, JsonRejection>,
) -> Result<(StatusCode, Json<WebhookRegistered>), HubError> {
    hub.authorize_admin(presented_token(&headers))?;
    let Json(request) = body?;
    let registered = hub.webhooks().register(request).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

/// `GET /v1/webhooks/{id}`. The secret is never returned.
///
/// # Errors
///
/// 401/403 without admin auth, 404 for an unknown id.
pub async fn get_webhook(
    State(hub): State<SharedHub>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Webhook>, HubError> {
    hub.authorize_admin(presented_token(&headers))?;
    hub.webhooks()
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| HubError::not_found(ScpErrorCode::PolicyViolation, "webhook not found"))
}

/// `PATCH /v1/webhooks/{id}`
///
/// # Errors
///
/// 401/403 without admin auth, 404 for an unknown id, 400 on a bad patch.
pub async fn patch_webhook(
    State(hub): State<SharedHub>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<WebhookUpdate>, JsonRejection>,
) -> Result<Json<Webhook>, HubError> {
    hub.authorize_admin(presented_token(&headers))?;
    let Json(patch) = body?;
    Ok(Json(hub.webhooks().update(&id, patch).await?))
}

/// `DELETE /v1/webhooks/{id}`
///
/// # Errors
///
/// 401/403 without admin auth, 404 for an unknown id.
pub async fn delete_webhook(
    State(hub): State<SharedHub>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, HubError> {
    hub.authorize_admin(presented_token(&headers))?;
    if hub.webhooks().remove(&id).await {
        Ok(Json(json!({ "deleted": true })))
    } else {
        Err(HubError::not_found(
            ScpErrorCode::PolicyViolation,
            "webhook not found",
        ))
    }
}

/// `POST /v1/events/emit` body.
#[derive(Debug, Deserialize)]
pub struct EmitRequest {
    event: String,
    #[serde(default)]
    data: Value,
}

/// `POST /v1/events/emit`. Lets operators inject lifecycle events such as
/// `channel.close_started` observed by an external watcher.
///
/// # Errors
///
/// 401/403 without admin auth, 400 on an unknown event type.
pub async fn post_emit(
    State(hub): State<SharedHub>,
    headers: HeaderMap,
    body: Result<Json<EmitRequest>, JsonRejection>,
) -> Result<Json<Value>, HubError> {
    hub.authorize_admin(presented_token(&headers))?;
    let Json(request) = body?;
    let event: EventKind = request
        .event
        .parse()
        .map_err(|()| HubError::bad_request("invalid event type"))?;
    let data = match request.data {
        Value::Null => json!({}),
        other => other,
    };
    let seq = hub.webhooks().emit(event, data).await;
    Ok(Json(json!({ "ok": true, "seq": seq })))
}

/// `GET /v1/events` query.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    since: Option<String>,
    #[serde(alias = "channel")]
    channel_id: Option<String>,
    limit: Option<String>,
}

/// `GET /v1/events?since=&channelId=&limit=`. Unparsable numbers fall back
/// to their defaults.
///
/// # Errors
///
/// 401/403 without admin auth.
pub async fn get_events(
    State(hub): State<SharedHub>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventPage>, HubError> {
    hub.authorize_admin(presented_token(&headers))?;
    let since = query.since.and_then(|s| s.parse().ok()).unwrap_or(0);
    let limit = query.limit.and_then(|l| l.parse().ok());
    let channel = query.channel_id.filter(|c| !c.is_empty());
    Ok(Json(
        hub.webhooks().poll(since, channel.as_deref(), limit).await,
    ))
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found() -> HubError {
    HubError::not_found(ScpErrorCode::PolicyViolation, "route not found")
}

/// Creates an Axum [`Router`] with every hub endpoint.
///
/// Endpoints:
/// - `GET /.well-known/x402` - hub identity, assets and fee policy
/// - `POST /v1/tickets/quote` - price a payment
/// - `POST /v1/tickets/issue` - countersign a state and issue the ticket
/// - `GET /v1/payments/{id}` - payment status
/// - `GET /v1/channels/{id}` - latest channel state
/// - `GET /v1/channels?payer=` - channels of a payer
/// - `POST /v1/webhooks`, `GET|PATCH|DELETE /v1/webhooks/{id}` - admin
/// - `POST /v1/events/emit`, `GET /v1/events` - admin
/// - `GET /health`
pub fn hub_router(hub: SharedHub) -> Router {
    Router::new()
        .route("/.well-known/x402", get(get_info))
        .route("/v1/tickets/quote", post(post_quote))
        .route("/v1/tickets/issue", post(post_issue))
        .route("/v1/payments/{id}", get(get_payment))
        .route("/v1/channels", get(list_channels))
        .route("/v1/channels/{id}", get(get_channel))
        .route("/v1/webhooks", post(post_webhook))
        .route(
            "/v1/webhooks/{id}",
            get(get_webhook).patch(patch_webhook).delete(delete_webhook),
        )
        .route("/v1/events/emit", post(post_emit))
        .route("/v1/events", get(get_events))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(hub)
}
