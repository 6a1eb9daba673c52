//! Webhook registry, event log and signed delivery.
//!
//! Every emitted event gets a sequence number and lands in a bounded log that
//! admins can poll. Active hooks subscribed to the event (and to its channel,
//! or to `*`) receive a signed POST. Failed deliveries are retried with
//! exponential backoff; a hook whose deliveries are exhausted
//! [`FAIL_THRESHOLD`] times in a row is marked `failing` and skipped until an
//! admin re-activates it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use scp::UnixTimestamp;
use scp::ids;
use scp::proto::{EventEnvelope, EventKind, WebhookRegistered, WebhookRegistration};
use scp::timestamp::Clock;
use scp::webhook::{ATTEMPT_HEADER, EVENT_HEADER, SIGNATURE_HEADER, sign_payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

/// Retries after the first delivery attempt.
pub const MAX_RETRIES: u32 = 5;
/// Backoff before retry `n` is `RETRY_BASE * 2^n`.
pub const RETRY_BASE: Duration = Duration::from_secs(2);
/// Per-delivery HTTP timeout.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Active hooks allowed per channel filter.
pub const MAX_HOOKS_PER_CHANNEL: usize = 10;
/// Events kept for polling.
pub const EVENT_LOG_MAX: usize = 1000;
/// Exhausted deliveries before a hook is marked failing.
pub const FAIL_THRESHOLD: u32 = 3;
/// Default and maximum page size of [`WebhookManager::poll`].
pub const DEFAULT_POLL_LIMIT: usize = 50;
/// Upper bound on a poll page.
pub const MAX_POLL_LIMIT: usize = 200;

const ANY_CHANNEL: &str = "*";

/// Delivery state of a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookStatus {
    /// Receiving deliveries.
    Active,
    /// Disabled by an admin.
    Paused,
    /// Disabled after repeated delivery failures.
    Failing,
}

impl HookStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Failing => "failing",
        }
    }
}

/// A registered webhook. The secret is never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    /// Hub-minted id.
    pub id: String,
    /// Delivery URL.
    pub url: String,
    /// HMAC key for deliveries.
    #[serde(skip)]
    pub secret: String,
    /// Subscribed events.
    pub events: Vec<EventKind>,
    /// Channel filter, `*` for every channel.
    pub channel_id: String,
    /// Active or disabled.
    pub status: HookStatus,
    /// Registration time.
    pub created_at: UnixTimestamp,
    /// Consecutive failed deliveries.
    pub fail_count: u32,
}

impl Webhook {
    fn wants(&self, event: EventKind, channel_id: &str) -> bool {
        self.status == HookStatus::Active
            && self.events.contains(&event)
            && (self.channel_id == ANY_CHANNEL || self.channel_id.eq_ignore_ascii_case(channel_id))
    }
}

/// `PATCH /v1/webhooks/{id}` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookUpdate {
    /// New delivery URL.
    #[serde(default)]
    pub url: Option<String>,
    /// New event names.
    #[serde(default)]
    pub events: Option<Vec<String>>,
    /// New secret.
    #[serde(default)]
    pub secret: Option<String>,
    /// `active` or `disabled`.
    #[serde(default)]
    pub status: Option<String>,
}

/// One logged event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    /// Position in the log, from 1.
    pub seq: u64,
    /// Event kind.
    pub event: EventKind,
    /// When it was emitted.
    pub timestamp: UnixTimestamp,
    /// Event-specific payload.
    pub data: Value,
}

/// `GET /v1/events` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    /// Cursor the page starts after.
    pub since: u64,
    /// Entries in `items`.
    pub count: usize,
    /// Pass as `since` for the next page.
    pub next_cursor: u64,
    /// Entries, oldest first.
    pub items: Vec<EventEntry>,
}

/// Registration and update failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    /// Not an absolute http(s) URL.
    #[error("invalid webhook url: must be absolute http(s) URL")]
    InvalidUrl,
    /// Empty or unknown event list.
    #[error("events must be a non-empty subset of: {}", all_event_names())]
    InvalidEvents,
    /// The channel filter already has [`MAX_HOOKS_PER_CHANNEL`] active hooks.
    #[error("max webhooks reached for this channel")]
    LimitReached,
    /// No hook with that id.
    #[error("webhook not found")]
    NotFound,
    /// A patch field was invalid.
    #[error("invalid webhook update")]
    InvalidUpdate,
}

fn all_event_names() -> String {
    EventKind::ALL
        .iter()
        .map(EventKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_url(raw: &str) -> Option<Url> {
    Url::parse(raw)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
}

/// `None` means "all events". Duplicates are dropped, order kept.
fn normalize_events(events: Option<&[String]>) -> Option<Vec<EventKind>> {
    let Some(events) = events else {
        return Some(EventKind::ALL.to_vec());
    };
    if events.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(events.len());
    for name in events {
        let kind: EventKind = name.parse().ok()?;
        if !out.contains(&kind) {
            out.push(kind);
        }
    }
    Some(out)
}

#[derive(Debug, Default)]
struct Inner {
    hooks: BTreeMap<String, Webhook>,
    log: VecDeque<EventEntry>,
    seq: u64,
}

/// Owns webhooks and the event log.
#[derive(Debug)]
pub struct WebhookManager {
    inner: Arc<Mutex<Inner>>,
    client: Client,
    retry_base: Duration,
    clock: Arc<dyn Clock>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl WebhookManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            client: Client::new(),
            retry_base: RETRY_BASE,
            clock,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Overrides the retry backoff base.
    #[must_use]
    pub const fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    /// Registers a hook.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError`] for a bad URL, bad events or a full channel.
    pub async fn register(
        &self,
        request: WebhookRegistration,
    ) -> Result<WebhookRegistered, WebhookError> {
        let url = parse_url(&request.url).ok_or(WebhookError::InvalidUrl)?;
        let events =
            normalize_events(request.events.as_deref()).ok_or(WebhookError::InvalidEvents)?;
        let channel_id = request
            .channel_id
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| ANY_CHANNEL.to_owned());

        let mut inner = self.inner.lock().await;
        let active_on_channel = inner
            .hooks
            .values()
            .filter(|h| h.status == HookStatus::Active && h.channel_id == channel_id)
            .count();
        if active_on_channel >= MAX_HOOKS_PER_CHANNEL {
            return Err(WebhookError::LimitReached);
        }
        let hook = Webhook {
            id: ids::webhook_id(),
            url: url.to_string(),
            secret: request
                .secret
                .filter(|s| !s.is_empty())
                .unwrap_or_else(ids::webhook_secret),
            events,
            channel_id,
            status: HookStatus::Active,
            created_at: self.clock.now(),
            fail_count: 0,
        };
        tracing::info!(webhook_id = %hook.id, url = %hook.url, channel_id = %hook.channel_id, "Registered webhook");
        let registered = WebhookRegistered {
            webhook_id: hook.id.clone(),
            url: hook.url.clone(),
            events: hook.events.clone(),
            channel_id: hook.channel_id.clone(),
            status: hook.status.as_str().to_owned(),
            secret: hook.secret.clone(),
        };
        inner.hooks.insert(hook.id.clone(), hook);
        Ok(registered)
    }

    /// Looks up a hook.
    pub async fn get(&self, id: &str) -> Option<Webhook> {
        self.inner.lock().await.hooks.get(id).cloned()
    }

    /// Applies a patch. Setting `status` to `active` or `paused` resets the
    /// failure count; other status values are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::NotFound`] or [`WebhookError::InvalidUpdate`].
    pub async fn update(&self, id: &str, patch: WebhookUpdate) -> Result<Webhook, WebhookError> {
        let url = match patch.url.as_deref().filter(|u| !u.is_empty()) {
            Some(raw) => Some(parse_url(raw).ok_or(WebhookError::InvalidUpdate)?),
            None => None,
        };
        let events = match patch.events.as_deref() {
            Some(list) => Some(normalize_events(Some(list)).ok_or(WebhookError::InvalidUpdate)?),
            None => None,
        };

        let mut inner = self.inner.lock().await;
        let hook = inner.hooks.get_mut(id).ok_or(WebhookError::NotFound)?;
        if let Some(url) = url {
            hook.url = url.to_string();
        }
        if let Some(events) = events {
            hook.events = events;
        }
        if let Some(secret) = patch.secret.filter(|s| !s.is_empty()) {
            hook.secret = secret;
        }
        match patch.status.as_deref() {
            Some("active") => {
                hook.status = HookStatus::Active;
                hook.fail_count = 0;
            }
            Some("paused") => {
                hook.status = HookStatus::Paused;
                hook.fail_count = 0;
            }
            _ => {}
        }
        Ok(hook.clone())
    }

    /// Deletes a hook. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> bool {
        self.inner.lock().await.hooks.remove(id).is_some()
    }

    /// Logs an event and schedules deliveries. Returns its sequence number.
    pub async fn emit(&self, event: EventKind, data: Value) -> u64 {
        let channel_id = data
            .get("channelId")
            .and_then(Value::as_str)
            .unwrap_or(ANY_CHANNEL)
            .to_owned();

        let mut inner = self.inner.lock().await;
        inner.seq += 1;
        let entry = EventEntry {
            seq: inner.seq,
            event,
            timestamp: self.clock.now(),
            data,
        };
        inner.log.push_back(entry.clone());
        while inner.log.len() > EVENT_LOG_MAX {
            inner.log.pop_front();
        }
        let targets: Vec<Webhook> = inner
            .hooks
            .values()
            .filter(|h| h.wants(event, &channel_id))
            .cloned()
            .collect();
        drop(inner);

        tracing::debug!(seq = entry.seq, %event, targets = targets.len(), "Emitted event");
        for hook in targets {
            self.spawn_delivery(hook, entry.clone());
        }
        entry.seq
    }

    /// Events after `since`, optionally for one channel.
    pub async fn poll(&self, since: u64, channel_id: Option<&str>, limit: Option<usize>) -> EventPage {
        let max = limit
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_POLL_LIMIT)
            .min(MAX_POLL_LIMIT);
        let inner = self.inner.lock().await;
        let items: Vec<EventEntry> = inner
            .log
            .iter()
            .filter(|e| e.seq > since)
            .filter(|e| {
                channel_id.is_none_or(|c| {
                    e.data
                        .get("channelId")
                        .and_then(Value::as_str)
                        .is_some_and(|d| d.eq_ignore_ascii_case(c))
                })
            })
            .take(max)
            .cloned()
            .collect();
        let next_cursor = items.last().map_or(since, |e| e.seq);
        EventPage {
            since,
            count: items.len(),
            next_cursor,
            items,
        }
    }

    /// Waits for every in-flight delivery, including retries.
    pub async fn idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancels pending retries and waits for in-flight deliveries.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn_delivery(&self, hook: Webhook, entry: EventEntry) {
        let delivery = Delivery {
            inner: Arc::clone(&self.inner),
            client: self.client.clone(),
            retry_base: self.retry_base,
            shutdown: self.shutdown.clone(),
        };
        self.tracker.spawn(delivery.run(hook, entry));
    }
}

struct Delivery {
    inner: Arc<Mutex<Inner>>,
    client: Client,
    retry_base: Duration,
    shutdown: CancellationToken,
}

impl Delivery {
    async fn run(self, hook: Webhook, entry: EventEntry) {
        let envelope = EventEnvelope {
            event: entry.event,
            timestamp: entry.timestamp,
            webhook_id: hook.id.clone(),
            seq: entry.seq,
            data: entry.data,
        };
        let Ok(body) = serde_json::to_vec(&envelope) else {
            return;
        };
        let signature = sign_payload(&hook.secret, &body);

        for attempt in 0..=MAX_RETRIES {
            if self.send(&hook, envelope.event, &body, &signature, attempt).await {
                if let Some(h) = self.inner.lock().await.hooks.get_mut(&hook.id) {
                    h.fail_count = 0;
                }
                return;
            }
            if attempt == MAX_RETRIES {
                break;
            }
            let delay = self.retry_base.saturating_mul(1 << attempt);
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }

        let mut inner = self.inner.lock().await;
        if let Some(h) = inner.hooks.get_mut(&hook.id) {
            h.fail_count += 1;
            if h.fail_count >= FAIL_THRESHOLD {
                h.status = HookStatus::Failing;
                tracing::warn!(webhook_id = %h.id, fail_count = h.fail_count, "Webhook marked failing");
            }
        }
    }

    async fn send(
        &self,
        hook: &Webhook,
        event: EventKind,
        body: &[u8],
        signature: &str,
        attempt: u32,
    ) -> bool {
        let result = self
            .client
            .post(&hook.url)
            .timeout(DELIVERY_TIMEOUT)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, event.as_str())
            .header(ATTEMPT_HEADER, (attempt + 1).to_string())
            .body(body.to_vec())
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::debug!(webhook_id = %hook.id, attempt, status = %response.status(), "Webhook delivery rejected");
                false
            }
            Err(e) => {
                tracing::debug!(webhook_id = %hook.id, attempt, error = %e, "Webhook delivery failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scp::timestamp::ManualClock;
    use scp::webhook::verify_signature;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager() -> WebhookManager {
        WebhookManager::new(Arc::new(ManualClock::new(1_700_000_000)))
            .with_retry_base(Duration::from_millis(1))
    }

    fn registration(url: &str) -> WebhookRegistration {
        WebhookRegistration {
            url: url.to_owned(),
            ..WebhookRegistration::default()
        }
    }

    #[tokio::test]
    async fn register_validates_input() {
        let m = manager();
        assert_eq!(
            m.register(registration("ftp://hooks.local/x")).await,
            Err(WebhookError::InvalidUrl)
        );
        let bad_events = WebhookRegistration {
            events: Some(vec!["payment.lost".to_owned()]),
            ..registration("http://hooks.local/x")
        };
        let err = m.register(bad_events).await.unwrap_err();
        assert!(err.to_string().starts_with("events must be a non-empty subset of: channel.close_started"));

        let ok = m
            .register(WebhookRegistration {
                events: Some(vec!["balance.low".into(), "balance.low".into()]),
                ..registration("http://hooks.local/x")
            })
            .await
            .unwrap();
        assert_eq!(ok.events, vec![EventKind::BalanceLow]);
        assert_eq!(ok.channel_id, "*");
        assert_eq!(ok.status, "active");
        assert_eq!(ok.secret.len(), 32);
    }

    #[tokio::test]
    async fn per_channel_limit() {
        let m = manager();
        for _ in 0..MAX_HOOKS_PER_CHANNEL {
            m.register(WebhookRegistration {
                channel_id: Some("0xabc".into()),
                ..registration("http://hooks.local/x")
            })
            .await
            .unwrap();
        }
        let err = m
            .register(WebhookRegistration {
                channel_id: Some("0xabc".into()),
                ..registration("http://hooks.local/x")
            })
            .await
            .unwrap_err();
        assert_eq!(err, WebhookError::LimitReached);
        assert!(m.register(registration("http://hooks.local/x")).await.is_ok());
    }

    #[tokio::test]
    async fn poll_pages_and_filters() {
        let m = manager();
        for i in 0..5 {
            let channel = if i % 2 == 0 { "0xaa" } else { "0xbb" };
            m.emit(EventKind::PaymentReceived, json!({ "channelId": channel, "i": i }))
                .await;
        }
        let page = m.poll(0, None, Some(2)).await;
        assert_eq!(page.count, 2);
        assert_eq!(page.next_cursor, 2);
        let page = m.poll(page.next_cursor, Some("0xAA"), None).await;
        assert_eq!(page.items.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 5]);
        let empty = m.poll(5, None, None).await;
        assert_eq!((empty.count, empty.next_cursor), (0, 5));
    }

    #[tokio::test]
    async fn update_and_remove() {
        let m = manager();
        let id = m.register(registration("http://hooks.local/x")).await.unwrap().webhook_id;
        let patched = m
            .update(
                &id,
                WebhookUpdate {
                    status: Some("paused".into()),
                    events: Some(vec!["channel.closed".into()]),
                    ..WebhookUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.status, HookStatus::Paused);
        assert_eq!(patched.events, vec![EventKind::ChannelClosed]);
        assert_eq!(
            m.update(&id, WebhookUpdate { events: Some(vec![]), ..WebhookUpdate::default() })
                .await,
            Err(WebhookError::InvalidUpdate)
        );
        assert_eq!(
            m.update("wh_missing", WebhookUpdate::default()).await,
            Err(WebhookError::NotFound)
        );
        assert!(m.remove(&id).await);
        assert!(!m.remove(&id).await);
    }

    #[tokio::test]
    async fn delivers_signed_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-scp-event", "payment.received"))
            .and(header("x-scp-delivery-attempt", "1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let m = manager();
        let reg = m
            .register(WebhookRegistration {
                channel_id: Some("0xaa".into()),
                secret: Some("s3cret".into()),
                ..registration(&format!("{}/hook", server.uri()))
            })
            .await
            .unwrap();
        m.emit(EventKind::PaymentReceived, json!({ "channelId": "0xaa" })).await;
        m.emit(EventKind::PaymentReceived, json!({ "channelId": "0xbb" })).await;
        m.idle().await;

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let req = &requests[0];
        let sig = req.headers.get("x-scp-signature").unwrap().to_str().unwrap();
        assert!(verify_signature("s3cret", &req.body, sig));
        let envelope: EventEnvelope = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(envelope.webhook_id, reg.webhook_id);
        assert_eq!(envelope.seq, 1);
    }

    #[tokio::test]
    async fn exhausted_deliveries_mark_hook_failing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let m = manager();
        let id = m
            .register(registration(&server.uri()))
            .await
            .unwrap()
            .webhook_id;
        for round in 1..=FAIL_THRESHOLD {
            m.emit(EventKind::BalanceLow, json!({})).await;
            m.idle().await;
            let hook = m.get(&id).await.unwrap();
            assert_eq!(hook.fail_count, round);
        }
        assert_eq!(m.get(&id).await.unwrap().status, HookStatus::Failing);
        let attempts = server.received_requests().await.unwrap().len();
        assert_eq!(attempts, (FAIL_THRESHOLD * (MAX_RETRIES + 1)) as usize);

        m.emit(EventKind::BalanceLow, json!({})).await;
        m.idle().await;
        assert_eq!(server.received_requests().await.unwrap().len(), attempts);
    }
}
