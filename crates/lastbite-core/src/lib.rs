//! Core domain model for the lastbite offer marketplace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lastbite-core";

/// Mean Earth radius in kilometers, used for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Fallback notification radius for area subscriptions that carry none.
pub const DEFAULT_RADIUS_KM: f64 = 5.0;

/// A time-boxed offer published by a vendor.
///
/// `is_active` is derived state: only the activation job flips it, user
/// edits never touch it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: i64,
    pub vendor_id: i64,
    pub title: String,
    pub publish_at: DateTime<Utc>,
    pub unpublish_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Event emitted when an offer transitions into its live window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferLive {
    pub offer_id: i64,
    pub vendor_id: i64,
    pub title: String,
}

/// Granularity a subscriber wants notifications for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionScope {
    Offer,
    Business,
    Area,
}

impl SubscriptionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionScope::Offer => "offer",
            SubscriptionScope::Business => "business",
            SubscriptionScope::Area => "area",
        }
    }
}

/// A subscriber's standing interest in offers.
///
/// `scope_id` is required for offer/business scope and null for area
/// scope; area scope requires coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub subscriber_id: i64,
    pub scope: SubscriptionScope,
    pub scope_id: Option<i64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub radius_km: Option<f64>,
    pub is_active: bool,
}

impl Subscription {
    /// Subscription coordinates, when both components are present.
    pub fn location(&self) -> Option<GeoPoint> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
            _ => None,
        }
    }

    pub fn effective_radius_km(&self, default_radius_km: f64) -> f64 {
        self.radius_km.unwrap_or(default_radius_km)
    }
}

/// Opaque push delivery target for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEndpoint {
    pub subscriber_id: i64,
    pub enabled: bool,
    pub transport_blob: String,
}

/// Kind discriminator for the notification ledger key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    OfferLive,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::OfferLive => "offer_live",
        }
    }
}

/// Ledger row recording the last successful send for one
/// (offer, subscriber, kind) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentNotification {
    pub offer_id: i64,
    pub subscriber_id: i64,
    pub kind: NotificationKind,
    pub sent_at: DateTime<Utc>,
}

/// Per-vendor aggregate recomputed wholesale by the scoring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorMetrics {
    pub vendor_id: i64,
    pub total_orders: i64,
    pub completed_orders: i64,
    pub unique_customers: i64,
    pub repeat_customers: i64,
    pub avg_rating: f64,
    pub quality_score: f64,
    pub is_top: bool,
}

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Great-circle distance between two points in kilometers.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_zero_for_identical_points() {
        let p = GeoPoint { lat: 52.52, lon: 13.405 };
        assert_eq!(haversine_km(p, p), 0.0);
    }

    #[test]
    fn haversine_matches_known_city_distance() {
        // Berlin -> Hamburg is roughly 255 km great-circle.
        let berlin = GeoPoint { lat: 52.52, lon: 13.405 };
        let hamburg = GeoPoint { lat: 53.551, lon: 9.993 };
        let d = haversine_km(berlin, hamburg);
        assert!((d - 255.0).abs() < 3.0, "got {d}");
    }

    #[test]
    fn haversine_is_symmetric() {
        let a = GeoPoint { lat: 40.7128, lon: -74.006 };
        let b = GeoPoint { lat: 34.0522, lon: -118.2437 };
        assert!((haversine_km(a, b) - haversine_km(b, a)).abs() < 1e-9);
    }

    #[test]
    fn subscription_radius_falls_back_to_default() {
        let sub = Subscription {
            id: 1,
            subscriber_id: 7,
            scope: SubscriptionScope::Area,
            scope_id: None,
            lat: Some(48.1),
            lon: Some(11.5),
            radius_km: None,
            is_active: true,
        };
        assert_eq!(sub.effective_radius_km(DEFAULT_RADIUS_KM), 5.0);
        assert!(sub.location().is_some());
    }
}
