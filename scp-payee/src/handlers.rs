//! Axum route handlers for the payee gateway.
//!
//! Every priced route answers `402` with offers until a `PAYMENT-SIGNATURE`
//! header (or, in `pay_once` mode, a live access token) is presented.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use scp::proto::PAYMENT_SIGNATURE_HEADER;
use serde_json::{Value, json};

use crate::error::GateError;
use crate::gateway::{Gateway, Outcome};
use crate::grants::presented_token;
use crate::registration::WEBHOOK_PATH;

/// Header hubs sign webhook deliveries with.
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-scp-signature";

/// Shared application state for the payee router.
pub type SharedGateway = Arc<Gateway>;

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        match self {
            Self::Challenge(challenge) => {
                (StatusCode::PAYMENT_REQUIRED, Json(challenge)).into_response()
            }
            Self::Catalog(challenge) => Json(challenge).into_response(),
            Self::Granted(paid) => Json(paid).into_response(),
            Self::Paid { body, cookie } => {
                let mut response = Response::new(Body::from(body.get().to_owned()));
                let headers = response.headers_mut();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                if let Some(value) = cookie.and_then(|c| HeaderValue::from_str(&c).ok()) {
                    headers.insert(SET_COOKIE, value);
                }
                response
            }
        }
    }
}

fn payment_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(PAYMENT_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
}

/// `GET <route>` for every priced route.
///
/// # Errors
///
/// 402 when the presented payment is refused.
pub async fn get_resource(
    State(gateway): State<SharedGateway>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Outcome, GateError> {
    let token = presented_token(&headers);
    gateway
        .handle(Some(uri.path()), payment_header(&headers), token.as_deref())
        .await
}

/// `GET /pay`
///
/// Without a payment, lists every route's offers. With one, settles any of
/// them.
///
/// # Errors
///
/// 402 when the presented payment is refused.
pub async fn get_pay(
    State(gateway): State<SharedGateway>,
    headers: HeaderMap,
) -> Result<Outcome, GateError> {
    gateway.handle(None, payment_header(&headers), None).await
}

/// `POST /webhooks/hub`
pub async fn post_hub_webhook(
    State(gateway): State<SharedGateway>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    match gateway.inbox().accept(&body, signature).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

/// Creates an Axum [`Router`] serving every priced route of `gateway`.
///
/// Endpoints:
/// - `GET <route>` - 402 offers, or the resource once paid
/// - `GET /pay` - offers for every route, or payment for any of them
/// - `POST /webhooks/hub` - hub event deliveries
/// - `GET /health` - liveness
pub fn payee_router(gateway: SharedGateway) -> Router {
    let mut router = Router::new()
        .route("/pay", get(get_pay))
        .route(WEBHOOK_PATH, post(post_hub_webhook))
        .route("/health", get(health));
    let paths: Vec<String> = gateway.route_paths().map(str::to_owned).collect();
    for path in paths {
        router = router.route(&path, get(get_resource));
    }
    router.fallback(not_found).with_state(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Accept, PaymentMode};
    use crate::replay::MemoryReplayStore;
    use crate::verifier::PaymentVerifier;
    use alloy_primitives::B256;
    use alloy_signer_local::PrivateKeySigner;
    use axum::body::to_bytes;
    use axum::http::Request;
    use axum::http::header::COOKIE;
    use scp::UnixTimestamp;
    use scp::amount::TokenAmount;
    use scp::networks::{BASE_MAINNET, CANONICAL_CONTRACT, USDC_BASE};
    use scp::proto::{
        ChannelState, DirectEnvelope, DirectPayment, OfferTerms, PaymentChallenge,
        PaymentPayload,
    };
    use scp::timestamp::ManualClock;
    use scp::webhook::sign_payload;
    use scp_evm::ChannelDomain;
    use scp_evm::ticket::context_hash;
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    const NOW: u64 = 1_700_000_000;
    const PRICE: u64 = 1_000_000;
    const ROUTE: &str = "/v1/data";

    fn domain() -> ChannelDomain {
        ChannelDomain::new(BASE_MAINNET, CANONICAL_CONTRACT)
    }

    fn gateway(payee: &PrivateKeySigner, mode: PaymentMode) -> SharedGateway {
        let clock = Arc::new(ManualClock::new(NOW));
        let verifier = PaymentVerifier::new(payee.address(), domain(), Vec::new(), clock.clone())
            .with_hub_confirmation(false);
        let replay = Arc::new(MemoryReplayStore::new(3_600, 100, clock.clone()));
        let routes = BTreeMap::from([(
            ROUTE.to_owned(),
            vec![Accept {
                network: "eip155:8453".to_owned(),
                chain_id: BASE_MAINNET,
                asset: USDC_BASE,
                hub_endpoint: "http://127.0.0.1:9".to_owned(),
                hub_name: "pay.eth".to_owned(),
                price: TokenAmount::from(PRICE),
            }],
        )]);
        Arc::new(
            Gateway::new(verifier, replay)
                .with_clock(clock)
                .with_routes(routes)
                .with_payment_mode(mode, 3_600),
        )
    }

    async fn send(gw: &SharedGateway, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = payee_router(Arc::clone(gw)).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn direct_invoice(gw: &SharedGateway) -> String {
        let (status, _, body) = send(gw, get(ROUTE)).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        let challenge: PaymentChallenge = serde_json::from_slice(&body).unwrap();
        challenge
            .accepts
            .iter()
            .find(|o| matches!(o.terms, OfferTerms::Direct(_)))
            .map(|o| o.invoice_id().to_owned())
            .unwrap()
    }

    async fn direct_header(
        payer: &PrivateKeySigner,
        payee: &PrivateKeySigner,
        invoice_id: &str,
        payment_id: &str,
        nonce: u64,
    ) -> String {
        let bal_b = PRICE * nonce;
        let state = ChannelState {
            channel_id: B256::repeat_byte(0x42),
            state_nonce: nonce,
            bal_a: TokenAmount::from(10_000_000 - bal_b),
            bal_b: TokenAmount::from(bal_b),
            locks_root: B256::ZERO,
            state_expiry: UnixTimestamp::from_secs(NOW + 3_600),
            context_hash: context_hash(payee.address(), "GET", payment_id, invoice_id),
        };
        let sig_a = domain().sign_state(&state, payer).await.unwrap();
        let payload = PaymentPayload::Direct(DirectEnvelope {
            payment_id: payment_id.to_owned(),
            invoice_id: invoice_id.to_owned(),
            direct: DirectPayment {
                payer: payer.address(),
                payee: payee.address(),
                asset: USDC_BASE,
                amount: TokenAmount::from(PRICE),
                expiry: UnixTimestamp::from_secs(NOW + 120),
                invoice_id: invoice_id.to_owned(),
                payment_id: payment_id.to_owned(),
                channel_state: state,
                sig_a,
            },
        });
        serde_json::to_string(&payload).unwrap()
    }

    fn paid(uri: &str, header: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(PAYMENT_SIGNATURE_HEADER, header)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn unpaid_route_offers_hub_and_direct() {
        let payee = PrivateKeySigner::random();
        let gw = gateway(&payee, PaymentMode::PerRequest);
        let (status, _, body) = send(&gw, get(ROUTE)).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        let body: Value = serde_json::from_slice(&body).unwrap();
        let accepts = body["accepts"].as_array().unwrap();
        assert_eq!(accepts.len(), 2);
        assert_eq!(accepts[0]["scheme"], "statechannel-hub-v1");
        assert_eq!(accepts[0]["payTo"], "pay.eth");
        assert_eq!(accepts[1]["scheme"], "statechannel-direct-v1");
        assert_eq!(accepts[0]["resource"], "http://127.0.0.1:4042/v1/data");
        assert_eq!(gw.invoices().len(), 1);
    }

    #[tokio::test]
    async fn pay_lists_the_catalog() {
        let payee = PrivateKeySigner::random();
        let gw = gateway(&payee, PaymentMode::PerRequest);
        let (status, _, body) = send(&gw, get("/pay")).await;
        assert_eq!(status, StatusCode::OK);
        let challenge: PaymentChallenge = serde_json::from_slice(&body).unwrap();
        assert_eq!(challenge.accepts.len(), 2);
    }

    #[tokio::test]
    async fn direct_payment_is_served_and_replayed_verbatim() {
        let payee = PrivateKeySigner::random();
        let payer = PrivateKeySigner::random();
        let gw = gateway(&payee, PaymentMode::PerRequest);
        let invoice = direct_invoice(&gw).await;
        let header = direct_header(&payer, &payee, &invoice, "pay_1", 1).await;

        let (status, headers, first) = send(&gw, paid(ROUTE, &header)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert!(headers.get(SET_COOKIE).is_none());
        let body: Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"]["value"], "premium-resource");
        assert_eq!(body["receipt"]["paymentId"], "pay_1");
        assert!(body["receipt"]["receiptId"].as_str().unwrap().starts_with("rcpt_"));
        assert!(body["receipt"].get("ticketId").is_none());

        let (status, _, again) = send(&gw, paid(ROUTE, &header)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn pay_once_grant_unlocks_the_route() {
        let payee = PrivateKeySigner::random();
        let payer = PrivateKeySigner::random();
        let gw = gateway(&payee, PaymentMode::PayOnce);
        let invoice = direct_invoice(&gw).await;
        let header = direct_header(&payer, &payee, &invoice, "pay_1", 1).await;

        let (status, headers, body) = send(&gw, paid(ROUTE, &header)).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        let token = body["access"]["token"].as_str().unwrap().to_owned();
        assert_eq!(body["access"]["mode"], "pay_once");
        let cookie = headers[SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with(&format!("scp_access={token};")));

        let request = Request::builder()
            .uri(ROUTE)
            .header(COOKIE, format!("scp_access={token}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&gw, request).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["access"]["token"], token.as_str());
        assert!(body.get("receipt").is_none());

        let request = Request::builder()
            .uri(ROUTE)
            .header("x-scp-access-token", "acc_forged")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&gw, request).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn pay_endpoint_grants_the_invoiced_route() {
        let payee = PrivateKeySigner::random();
        let payer = PrivateKeySigner::random();
        let gw = gateway(&payee, PaymentMode::PayOnce);
        let invoice = direct_invoice(&gw).await;
        let header = direct_header(&payer, &payee, &invoice, "pay_1", 1).await;

        let (status, _, body) = send(&gw, paid("/pay", &header)).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        let token = body["access"]["token"].as_str().unwrap();

        let request = Request::builder()
            .uri(ROUTE)
            .header("x-scp-access-token", token)
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&gw, request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn refused_payments_are_402_with_a_reason() {
        let payee = PrivateKeySigner::random();
        let payer = PrivateKeySigner::random();
        let gw = gateway(&payee, PaymentMode::PerRequest);

        let (status, _, body) = send(&gw, paid(ROUTE, "not json")).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({ "error": "missing or invalid header", "retryable": false }));

        let invoice = direct_invoice(&gw).await;
        let other = PrivateKeySigner::random();
        let header = direct_header(&payer, &other, &invoice, "pay_1", 1).await;
        let (status, _, body) = send(&gw, paid(ROUTE, &header)).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "direct payee mismatch");
    }

    #[tokio::test]
    async fn webhook_deliveries_are_authenticated_once_keyed() {
        let payee = PrivateKeySigner::random();
        let gw = gateway(&payee, PaymentMode::PerRequest);
        let body = r#"{"event":"payment.received","seq":1}"#;
        let post = |signature: Option<String>| {
            let mut builder = Request::builder().method("POST").uri(WEBHOOK_PATH);
            if let Some(sig) = signature {
                builder = builder.header(WEBHOOK_SIGNATURE_HEADER, sig);
            }
            builder.body(Body::from(body)).unwrap()
        };

        let (status, _, reply) = send(&gw, post(None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<Value>(&reply).unwrap(), json!({ "ok": true }));

        gw.inbox().set_secret("http://hub.test", "s3cret").await;
        let (status, _, reply) = send(&gw, post(Some("deadbeef".to_owned()))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            serde_json::from_slice::<Value>(&reply).unwrap(),
            json!({ "error": "invalid webhook signature" })
        );

        let signature = sign_payload("s3cret", body.as_bytes());
        let (status, _, _) = send(&gw, post(Some(signature))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(gw.inbox().events().await.len(), 2);
    }

    #[tokio::test]
    async fn health_and_unknown_routes() {
        let payee = PrivateKeySigner::random();
        let gw = gateway(&payee, PaymentMode::PerRequest);
        let (status, _, body) = send(&gw, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["status"], "ok");

        let (status, _, body) = send(&gw, get("/v1/other")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            serde_json::from_slice::<Value>(&body).unwrap(),
            json!({ "error": "not found" })
        );
    }
}
