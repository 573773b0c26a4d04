//! Notification contracts, subscription matching, and push dispatch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lastbite_core::{
    haversine_km, GeoPoint, NotificationKind, OfferLive, PushEndpoint, Subscription,
    SubscriptionScope,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "lastbite-notify";

/// Wire payload consumed by client apps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub data: NotificationData,
}

/// Structured routing data nested inside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    #[serde(rename = "type")]
    pub kind: String,
    pub offer_id: i64,
    pub business_id: i64,
    pub url: String,
}

impl NotificationPayload {
    /// Payload announcing that an offer just went live.
    pub fn offer_live(event: &OfferLive) -> Self {
        Self {
            title: "New offer nearby".to_string(),
            body: event.title.clone(),
            icon: "/static/icons/offer-192.png".to_string(),
            badge: "/static/icons/badge-72.png".to_string(),
            data: NotificationData {
                kind: NotificationKind::OfferLive.as_str().to_string(),
                offer_id: event.offer_id,
                business_id: event.vendor_id,
                url: format!("/offers/{}", event.offer_id),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The transport reports the subscription no longer exists.
    #[error("push endpoint is gone")]
    Gone,
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

/// Outbound push primitive. Implementations decide the protocol; the
/// dispatcher only consumes the outcome classification.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(
        &self,
        endpoint: &PushEndpoint,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError>;
}

/// Durable record of successful sends, keyed (offer, subscriber, kind).
#[async_trait]
pub trait NotificationLedger: Send + Sync {
    /// True when a send for this key was recorded after `cutoff`.
    async fn sent_since(
        &self,
        offer_id: i64,
        subscriber_id: i64,
        kind: NotificationKind,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Insert-or-refresh the key's `sent_at`.
    async fn record_send(
        &self,
        offer_id: i64,
        subscriber_id: i64,
        kind: NotificationKind,
        sent_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

/// Mutation surface for invalidating dead push endpoints.
#[async_trait]
pub trait EndpointRegistry: Send + Sync {
    /// Disable the subscriber's endpoint. Must be idempotent.
    async fn disable_endpoint(&self, subscriber_id: i64) -> anyhow::Result<()>;
}

/// Credentials handed to the push transport explicitly, never set as
/// process-global state.
#[derive(Debug, Clone)]
pub struct PushCredentials {
    pub public_key: String,
    pub private_key: String,
    pub subject: String,
}

/// HTTP push gateway transport: posts the JSON payload to the endpoint
/// URL carried in the subscription blob. Web-push envelope crypto is a
/// gateway concern, not replicated here.
#[derive(Debug, Clone)]
pub struct HttpPushTransport {
    client: reqwest::Client,
    credentials: PushCredentials,
}

impl HttpPushTransport {
    pub fn new(credentials: PushCredentials, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building push http client: {e}"))?;
        Ok(Self { client, credentials })
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(
        &self,
        endpoint: &PushEndpoint,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&endpoint.transport_blob)
            .header("x-push-public-key", &self.credentials.public_key)
            .header("x-push-private-key", &self.credentials.private_key)
            .header("x-push-subject", &self.credentials.subject)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(Duration::ZERO)
                } else {
                    DeliveryError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            Err(DeliveryError::Gone)
        } else {
            Err(DeliveryError::Transient(format!("http status {status}")))
        }
    }
}

/// One matchable recipient: an active subscription joined with the
/// subscriber's enabled push endpoint.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub subscription: Subscription,
    pub endpoint: PushEndpoint,
}

/// Pure matcher: which candidates should hear about this offer.
///
/// Union of offer-scope matches on the offer id, business-scope matches
/// on the vendor id, and area-scope subscriptions within their radius of
/// the vendor (boundary distance included). Each subscriber appears at
/// most once even when several of their subscriptions match.
pub fn eligible_candidates(
    event: &OfferLive,
    vendor_location: Option<GeoPoint>,
    candidates: Vec<Candidate>,
    default_radius_km: f64,
) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| c.subscription.is_active && c.endpoint.enabled)
        .filter(|c| {
            let sub = &c.subscription;
            match sub.scope {
                SubscriptionScope::Offer => sub.scope_id == Some(event.offer_id),
                SubscriptionScope::Business => sub.scope_id == Some(event.vendor_id),
                SubscriptionScope::Area => match (vendor_location, sub.location()) {
                    (Some(vendor), Some(here)) => {
                        haversine_km(vendor, here) <= sub.effective_radius_km(default_radius_km)
                    }
                    _ => false,
                },
            }
        })
        .filter(|c| seen.insert(c.subscription.subscriber_id))
        .collect()
}

/// Per-batch fan-out result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanoutSummary {
    pub matched: usize,
    pub suppressed: usize,
    pub sent: usize,
    pub gone: usize,
    pub failed: usize,
}

enum SendOutcome {
    Suppressed,
    Sent,
    Gone,
    Failed,
}

/// Bounded-concurrency push fan-out with per-send timeout and the
/// anti-spam gate in front of every send.
pub struct Dispatcher {
    transport: Arc<dyn PushTransport>,
    ledger: Arc<dyn NotificationLedger>,
    endpoints: Arc<dyn EndpointRegistry>,
    limit: Arc<Semaphore>,
    send_timeout: Duration,
    antispam_window: chrono::Duration,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        ledger: Arc<dyn NotificationLedger>,
        endpoints: Arc<dyn EndpointRegistry>,
        concurrency: usize,
        send_timeout: Duration,
        antispam_window: chrono::Duration,
    ) -> Self {
        Self {
            transport,
            ledger,
            endpoints,
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
            send_timeout,
            antispam_window,
        }
    }

    /// Deliver `payload` to every candidate. One recipient's failure
    /// never aborts the rest; all outcomes land in the summary.
    pub async fn dispatch(
        &self,
        event: &OfferLive,
        payload: &NotificationPayload,
        candidates: Vec<Candidate>,
        now: DateTime<Utc>,
    ) -> FanoutSummary {
        let mut summary = FanoutSummary {
            matched: candidates.len(),
            ..FanoutSummary::default()
        };
        let cutoff = now - self.antispam_window;
        let kind = NotificationKind::OfferLive;
        let offer_id = event.offer_id;

        let span = info_span!("notify_fanout", offer_id, recipients = candidates.len());

        let mut handles = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let transport = Arc::clone(&self.transport);
            let ledger = Arc::clone(&self.ledger);
            let endpoints = Arc::clone(&self.endpoints);
            let limit = Arc::clone(&self.limit);
            let payload = payload.clone();
            let send_timeout = self.send_timeout;

            let task = async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                let subscriber_id = candidate.subscription.subscriber_id;

                match ledger.sent_since(offer_id, subscriber_id, kind, cutoff).await {
                    Ok(true) => return SendOutcome::Suppressed,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(offer_id, subscriber_id, %err, "anti-spam lookup failed; skipping send");
                        return SendOutcome::Failed;
                    }
                }

                let sent =
                    tokio::time::timeout(send_timeout, transport.send(&candidate.endpoint, &payload))
                        .await
                        .unwrap_or(Err(DeliveryError::Timeout(send_timeout)));

                match sent {
                    Ok(()) => {
                        if let Err(err) = ledger.record_send(offer_id, subscriber_id, kind, now).await
                        {
                            warn!(offer_id, subscriber_id, %err, "delivered but ledger write failed");
                        }
                        SendOutcome::Sent
                    }
                    Err(DeliveryError::Gone) => {
                        if let Err(err) = endpoints.disable_endpoint(subscriber_id).await {
                            warn!(offer_id, subscriber_id, %err, "failed to disable gone endpoint");
                        }
                        SendOutcome::Gone
                    }
                    Err(err) => {
                        warn!(offer_id, subscriber_id, %err, "push delivery failed");
                        SendOutcome::Failed
                    }
                }
            };
            handles.push(tokio::spawn(task.instrument(span.clone())));
        }

        for handle in handles {
            match handle.await {
                Ok(SendOutcome::Suppressed) => summary.suppressed += 1,
                Ok(SendOutcome::Sent) => summary.sent += 1,
                Ok(SendOutcome::Gone) => summary.gone += 1,
                Ok(SendOutcome::Failed) => summary.failed += 1,
                Err(err) => {
                    warn!(offer_id, %err, "send task panicked");
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(id: i64, subscriber_id: i64, scope: SubscriptionScope, scope_id: Option<i64>) -> Subscription {
        Subscription {
            id,
            subscriber_id,
            scope,
            scope_id,
            lat: None,
            lon: None,
            radius_km: None,
            is_active: true,
        }
    }

    fn candidate(subscription: Subscription) -> Candidate {
        let endpoint = PushEndpoint {
            subscriber_id: subscription.subscriber_id,
            enabled: true,
            transport_blob: format!("https://push.example/{}", subscription.subscriber_id),
        };
        Candidate { subscription, endpoint }
    }

    fn event() -> OfferLive {
        OfferLive {
            offer_id: 41,
            vendor_id: 9,
            title: "Half-price sushi box".into(),
        }
    }

    #[test]
    fn payload_wire_shape_uses_client_field_names() {
        let payload = NotificationPayload::offer_live(&event());
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["data"]["type"], "offer_live");
        assert_eq!(value["data"]["offerId"], 41);
        assert_eq!(value["data"]["businessId"], 9);
        assert_eq!(value["data"]["url"], "/offers/41");
    }

    #[test]
    fn offer_and_business_scopes_match_their_ids() {
        let candidates = vec![
            candidate(sub(1, 100, SubscriptionScope::Offer, Some(41))),
            candidate(sub(2, 101, SubscriptionScope::Offer, Some(999))),
            candidate(sub(3, 102, SubscriptionScope::Business, Some(9))),
            candidate(sub(4, 103, SubscriptionScope::Business, Some(8))),
        ];
        let matched = eligible_candidates(&event(), None, candidates, 5.0);
        let ids: Vec<i64> = matched.iter().map(|c| c.subscription.subscriber_id).collect();
        assert_eq!(ids, vec![100, 102]);
    }

    #[test]
    fn area_boundary_distance_is_included() {
        let vendor = GeoPoint { lat: 0.0, lon: 0.0 };
        let mut near = sub(1, 200, SubscriptionScope::Area, None);
        near.lat = Some(0.05);
        near.lon = Some(0.0);
        let exact_km = haversine_km(vendor, GeoPoint { lat: 0.05, lon: 0.0 });

        near.radius_km = Some(exact_km);
        let matched = eligible_candidates(&event(), Some(vendor), vec![candidate(near.clone())], 5.0);
        assert_eq!(matched.len(), 1, "distance == radius must match");

        near.radius_km = Some(exact_km - 0.001);
        let matched = eligible_candidates(&event(), Some(vendor), vec![candidate(near)], 5.0);
        assert!(matched.is_empty(), "distance beyond radius must not match");
    }

    #[test]
    fn area_subscription_without_coordinates_never_matches() {
        let vendor = GeoPoint { lat: 0.0, lon: 0.0 };
        let broken = sub(1, 201, SubscriptionScope::Area, None);
        let matched = eligible_candidates(&event(), Some(vendor), vec![candidate(broken)], 5.0);
        assert!(matched.is_empty());
    }

    #[test]
    fn vendor_without_location_still_gets_scope_matches() {
        let mut area = sub(1, 300, SubscriptionScope::Area, None);
        area.lat = Some(0.0);
        area.lon = Some(0.0);
        let candidates = vec![
            candidate(area),
            candidate(sub(2, 301, SubscriptionScope::Offer, Some(41))),
        ];
        let matched = eligible_candidates(&event(), None, candidates, 5.0);
        let ids: Vec<i64> = matched.iter().map(|c| c.subscription.subscriber_id).collect();
        assert_eq!(ids, vec![301]);
    }

    #[test]
    fn subscriber_matching_twice_is_notified_once() {
        let candidates = vec![
            candidate(sub(1, 400, SubscriptionScope::Offer, Some(41))),
            candidate(sub(2, 400, SubscriptionScope::Business, Some(9))),
        ];
        let matched = eligible_candidates(&event(), None, candidates, 5.0);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn disabled_endpoints_are_filtered_out() {
        let mut c = candidate(sub(1, 500, SubscriptionScope::Offer, Some(41)));
        c.endpoint.enabled = false;
        let matched = eligible_candidates(&event(), None, vec![c], 5.0);
        assert!(matched.is_empty());
    }
}
