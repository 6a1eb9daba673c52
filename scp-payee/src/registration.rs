//! Hub webhook registration and the inbox behind `POST /webhooks/hub`.
//!
//! At startup the gateway registers its callback URL with every hub it
//! accepts tickets from. Each hub hands back its own secret, and a delivery
//! is authentic when it is signed with any of them. Until one is known,
//! deliveries are taken as-is.

use std::collections::{HashMap, VecDeque};

use scp::hub_client::HubClient;
use scp::proto::{EventKind, WebhookRegistration};
use scp::webhook::verify_signature;
use serde_json::Value;
use tokio::sync::RwLock;

/// Events kept in the inbox.
pub const INBOX_CAPACITY: usize = 500;

/// Path hubs deliver to.
pub const WEBHOOK_PATH: &str = "/webhooks/hub";

/// Why a delivery was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid webhook signature")]
pub struct InvalidSignature;

/// Received hub events, newest last.
#[derive(Debug, Default)]
pub struct WebhookInbox {
    /// Delivery secret per hub endpoint.
    secrets: RwLock<HashMap<String, String>>,
    /// Registration id per hub endpoint.
    webhook_ids: RwLock<HashMap<String, String>>,
    events: RwLock<VecDeque<Value>>,
}

impl WebhookInbox {
    /// An inbox with no hub registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the secret `hub` signs its deliveries with, replacing any
    /// earlier one from the same hub.
    pub async fn set_secret(&self, hub: impl Into<String>, secret: impl Into<String>) {
        self.secrets.write().await.insert(hub.into(), secret.into());
    }

    /// Id `hub` assigned to our registration.
    pub async fn webhook_id(&self, hub: &str) -> Option<String> {
        self.webhook_ids.read().await.get(hub).cloned()
    }

    /// Authenticates and records one delivery. Bodies that are not JSON are
    /// acknowledged and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSignature`] when any secret is set and `signature`
    /// matches `body` under none of them.
    pub async fn accept(&self, body: &[u8], signature: Option<&str>) -> Result<(), InvalidSignature> {
        {
            let secrets = self.secrets.read().await;
            if !secrets.is_empty() {
                let valid = signature.is_some_and(|sig| {
                    secrets.values().any(|secret| verify_signature(secret, body, sig))
                });
                if !valid {
                    return Err(InvalidSignature);
                }
            }
        }
        let Ok(event) = serde_json::from_slice::<Value>(body) else {
            tracing::debug!("Ignoring malformed webhook body");
            return Ok(());
        };
        let kind = event.get("event").and_then(Value::as_str).unwrap_or("?");
        let seq = event.get("seq").and_then(Value::as_u64).unwrap_or_default();
        tracing::info!(event = kind, seq, "Webhook event");
        let mut events = self.events.write().await;
        events.push_back(event);
        while events.len() > INBOX_CAPACITY {
            events.pop_front();
        }
        Ok(())
    }

    /// Snapshot of received events, oldest first.
    pub async fn events(&self) -> Vec<Value> {
        self.events.read().await.iter().cloned().collect()
    }
}

/// Registers `callback_base` + [`WEBHOOK_PATH`] with `hub` for payment
/// events on every channel and stores the returned secret in `inbox`.
/// Failure is logged and otherwise ignored; the hub may simply not be up
/// yet.
pub async fn register_with_hub(hub: &HubClient, callback_base: &str, inbox: &WebhookInbox) -> bool {
    let registration = WebhookRegistration {
        url: format!("{}{WEBHOOK_PATH}", callback_base.trim_end_matches('/')),
        events: Some(
            [EventKind::PaymentReceived, EventKind::PaymentRefunded]
                .iter()
                .map(|k| k.as_str().to_owned())
                .collect(),
        ),
        channel_id: Some("*".to_owned()),
        secret: None,
    };
    match hub.register_webhook(&registration).await {
        Ok(registered) => {
            tracing::info!(
                webhook_id = %registered.webhook_id,
                hub = hub.endpoint(),
                "Registered webhook with hub"
            );
            let endpoint = hub.endpoint().to_owned();
            inbox.set_secret(endpoint.clone(), registered.secret).await;
            inbox
                .webhook_ids
                .write()
                .await
                .insert(endpoint, registered.webhook_id);
            true
        }
        Err(e) => {
            tracing::warn!(hub = hub.endpoint(), error = %e, "Webhook registration failed");
            false
        }
    }
}

/// Registers with each of `hubs` in turn and returns how many accepted.
pub async fn register_with_hubs(hubs: &[HubClient], callback_base: &str, inbox: &WebhookInbox) -> usize {
    let mut registered = 0;
    for hub in hubs {
        if register_with_hub(hub, callback_base, inbox).await {
            registered += 1;
        }
    }
    registered
}

#[cfg(test)]
mod tests {
    use super::*;
    use scp::webhook::sign_payload;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn unsigned_inbox_takes_everything_and_caps() {
        let inbox = WebhookInbox::new();
        for seq in 0..(INBOX_CAPACITY + 5) {
            let body = json!({ "event": "payment.received", "seq": seq }).to_string();
            inbox.accept(body.as_bytes(), None).await.unwrap();
        }
        inbox.accept(b"not json", None).await.unwrap();
        let events = inbox.events().await;
        assert_eq!(events.len(), INBOX_CAPACITY);
        assert_eq!(events[0]["seq"], 5);
    }

    #[tokio::test]
    async fn signed_inbox_checks_hmac() {
        let inbox = WebhookInbox::new();
        inbox.set_secret("http://hub.test", "s3cret").await;
        let body = br#"{"event":"payment.received","seq":1}"#;
        assert_eq!(inbox.accept(body, None).await, Err(InvalidSignature));
        assert_eq!(
            inbox.accept(body, Some(&sign_payload("other", body))).await,
            Err(InvalidSignature)
        );
        inbox.accept(body, Some(&sign_payload("s3cret", body))).await.unwrap();
        assert_eq!(inbox.events().await.len(), 1);
    }

    #[tokio::test]
    async fn registration_stores_the_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/webhooks"))
            .and(body_partial_json(json!({
                "url": "http://127.0.0.1:4042/webhooks/hub",
                "events": ["payment.received", "payment.refunded"],
                "channelId": "*",
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "webhookId": "wh_0011223344556677",
                "url": "http://127.0.0.1:4042/webhooks/hub",
                "events": ["payment.received", "payment.refunded"],
                "channelId": "*",
                "status": "active",
                "secret": "feedface",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let hub = HubClient::new(&server.uri()).unwrap();
        let inbox = WebhookInbox::new();
        assert!(register_with_hub(&hub, "http://127.0.0.1:4042/", &inbox).await);
        assert_eq!(
            inbox.webhook_id(hub.endpoint()).await.as_deref(),
            Some("wh_0011223344556677")
        );

        let body = br#"{"event":"payment.refunded","seq":2}"#;
        assert!(inbox.accept(body, None).await.is_err());
        assert!(inbox.accept(body, Some(&sign_payload("feedface", body))).await.is_ok());
    }

    #[tokio::test]
    async fn registration_failure_is_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/webhooks"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let hub = HubClient::new(&server.uri()).unwrap();
        let inbox = WebhookInbox::new();
        assert!(!register_with_hub(&hub, "http://127.0.0.1:4042", &inbox).await);
        assert!(inbox.accept(b"{}", None).await.is_ok());
    }

    async fn mount_registration(server: &MockServer, webhook_id: &str, secret: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/webhooks"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "webhookId": webhook_id,
                "url": "http://127.0.0.1:4042/webhooks/hub",
                "events": ["payment.received", "payment.refunded"],
                "channelId": "*",
                "status": "active",
                "secret": secret,
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn every_hub_is_registered_and_its_deliveries_accepted() {
        let first = MockServer::start().await;
        mount_registration(&first, "wh_aaaaaaaaaaaaaaaa", "first-secret").await;
        let second = MockServer::start().await;
        mount_registration(&second, "wh_bbbbbbbbbbbbbbbb", "second-secret").await;
        let down = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;

        let hubs: Vec<HubClient> = [&first, &down, &second]
            .iter()
            .map(|s| HubClient::new(&s.uri()).unwrap())
            .collect();
        let inbox = WebhookInbox::new();
        assert_eq!(register_with_hubs(&hubs, "http://127.0.0.1:4042", &inbox).await, 2);
        assert_eq!(
            inbox.webhook_id(hubs[2].endpoint()).await.as_deref(),
            Some("wh_bbbbbbbbbbbbbbbb")
        );
        assert_eq!(inbox.webhook_id(hubs[1].endpoint()).await, None);

        let body = br#"{"event":"payment.received","seq":7}"#;
        for secret in ["first-secret", "second-secret"] {
            inbox.accept(body, Some(&sign_payload(secret, body))).await.unwrap();
        }
        assert_eq!(
            inbox.accept(body, Some(&sign_payload("third-secret", body))).await,
            Err(InvalidSignature)
        );
        assert_eq!(inbox.events().await.len(), 2);
    }
}
