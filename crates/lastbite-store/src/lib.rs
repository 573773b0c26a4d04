//! Postgres persistence for the offer marketplace core.
//!
//! Expected tables (provisioned by the surrounding application, not
//! here): `offers`, `vendors`, `subscriptions`, `push_endpoints`,
//! `sent_notifications`, `vendor_metrics`, plus the order/review
//! history tables `orders` and `reviews` read by the scoring job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lastbite_core::{
    GeoPoint, NotificationKind, OfferLive, PushEndpoint, Subscription, SubscriptionScope,
    VendorMetrics,
};
use lastbite_notify::{Candidate, EndpointRegistry, NotificationLedger};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "lastbite-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Postgres "undefined table" (42P01): a supporting table that has not
/// been provisioned yet. Metric collection degrades to zero on it.
fn is_undefined_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("42P01"))
}

fn parse_scope(raw: &str) -> Option<SubscriptionScope> {
    match raw {
        "offer" => Some(SubscriptionScope::Offer),
        "business" => Some(SubscriptionScope::Business),
        "area" => Some(SubscriptionScope::Area),
        _ => None,
    }
}

/// Raw per-vendor counts feeding the quality score.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VendorOrderStats {
    pub total_orders: i64,
    pub completed_orders: i64,
    pub unique_customers: i64,
    pub repeat_customers: i64,
    pub avg_rating: f64,
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Flip due offers live. Single conditional statement: only rows
    /// whose state disagrees are touched, so repeated ticks are no-ops.
    /// Offers whose whole window elapsed before first activation are
    /// excluded: they never go live and never notify.
    pub async fn activate_due_offers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<OfferLive>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE offers
               SET is_active = TRUE
             WHERE publish_at <= $1
               AND is_active = FALSE
               AND (unpublish_at IS NULL OR unpublish_at > $1)
            RETURNING id, vendor_id, title
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(OfferLive {
                offer_id: row.try_get("id")?,
                vendor_id: row.try_get("vendor_id")?,
                title: row.try_get("title")?,
            });
        }
        Ok(events)
    }

    /// Retire offers whose unpublish time has passed. Idempotent for
    /// the same reason as activation.
    pub async fn deactivate_expired_offers(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE offers
               SET is_active = FALSE
             WHERE unpublish_at IS NOT NULL
               AND unpublish_at <= $1
               AND is_active = TRUE
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn vendor_location(&self, vendor_id: i64) -> Result<Option<GeoPoint>, StoreError> {
        let row = sqlx::query("SELECT lat, lon FROM vendors WHERE id = $1")
            .bind(vendor_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|row| {
            let lat: Option<f64> = row.try_get("lat").ok()?;
            let lon: Option<f64> = row.try_get("lon").ok()?;
            Some(GeoPoint { lat: lat?, lon: lon? })
        }))
    }

    /// Candidate set for one activated offer: active subscriptions in
    /// any of the three scopes, joined with their subscriber's enabled
    /// endpoint. Area-scope geo filtering happens in process.
    pub async fn notification_candidates(
        &self,
        offer_id: i64,
        vendor_id: i64,
    ) -> Result<Vec<Candidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.subscriber_id, s.scope, s.scope_id,
                   s.lat, s.lon, s.radius_km, s.is_active,
                   p.enabled, p.transport_blob
              FROM subscriptions s
              JOIN push_endpoints p
                ON p.subscriber_id = s.subscriber_id
               AND p.enabled = TRUE
             WHERE s.is_active = TRUE
               AND (
                     (s.scope = 'offer' AND s.scope_id = $1)
                  OR (s.scope = 'business' AND s.scope_id = $2)
                  OR s.scope = 'area'
                   )
            "#,
        )
        .bind(offer_id)
        .bind(vendor_id)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_scope: String = row.try_get("scope")?;
            let Some(scope) = parse_scope(&raw_scope) else {
                warn!(scope = %raw_scope, "skipping subscription with unknown scope");
                continue;
            };
            let subscriber_id: i64 = row.try_get("subscriber_id")?;
            candidates.push(Candidate {
                subscription: Subscription {
                    id: row.try_get("id")?,
                    subscriber_id,
                    scope,
                    scope_id: row.try_get("scope_id")?,
                    lat: row.try_get("lat")?,
                    lon: row.try_get("lon")?,
                    radius_km: row.try_get("radius_km")?,
                    is_active: row.try_get("is_active")?,
                },
                endpoint: PushEndpoint {
                    subscriber_id,
                    enabled: row.try_get("enabled")?,
                    transport_blob: row.try_get("transport_blob")?,
                },
            });
        }
        Ok(candidates)
    }

    pub async fn vendor_ids(&self) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query("SELECT id FROM vendors ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get("id")?);
        }
        Ok(ids)
    }

    /// Raw counts for one vendor. A missing `orders` or `reviews`
    /// table degrades the affected metrics to zero instead of failing.
    pub async fn collect_vendor_stats(
        &self,
        vendor_id: i64,
    ) -> Result<VendorOrderStats, StoreError> {
        let mut stats = VendorOrderStats::default();

        let orders = sqlx::query(
            r#"
            SELECT COUNT(*)::int8 AS total_orders,
                   COUNT(*) FILTER (WHERE status = 'completed')::int8 AS completed_orders,
                   COUNT(DISTINCT customer_id)::int8 AS unique_customers
              FROM orders
             WHERE vendor_id = $1
            "#,
        )
        .bind(vendor_id)
        .fetch_one(&self.pool)
        .await;

        match orders {
            Ok(row) => {
                stats.total_orders = row.try_get("total_orders")?;
                stats.completed_orders = row.try_get("completed_orders")?;
                stats.unique_customers = row.try_get("unique_customers")?;
            }
            Err(err) if is_undefined_table(&err) => {
                warn!(vendor_id, "orders table missing; order metrics degrade to zero");
                return Ok(stats);
            }
            Err(err) => return Err(err.into()),
        }

        let repeat = sqlx::query(
            r#"
            SELECT COUNT(*)::int8 AS repeat_customers
              FROM (SELECT customer_id
                      FROM orders
                     WHERE vendor_id = $1
                     GROUP BY customer_id
                    HAVING COUNT(*) > 1) repeats
            "#,
        )
        .bind(vendor_id)
        .fetch_one(&self.pool)
        .await?;
        stats.repeat_customers = repeat.try_get("repeat_customers")?;

        let rating = sqlx::query(
            "SELECT COALESCE(AVG(rating)::float8, 0) AS avg_rating FROM reviews WHERE vendor_id = $1",
        )
        .bind(vendor_id)
        .fetch_one(&self.pool)
        .await;

        match rating {
            Ok(row) => stats.avg_rating = row.try_get("avg_rating")?,
            Err(err) if is_undefined_table(&err) => {
                warn!(vendor_id, "reviews table missing; avg_rating degrades to zero");
            }
            Err(err) => return Err(err.into()),
        }

        Ok(stats)
    }

    /// Persist the recomputed aggregate wholesale.
    pub async fn upsert_vendor_metrics(&self, metrics: &VendorMetrics) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO vendor_metrics
                   (vendor_id, total_orders, completed_orders, unique_customers,
                    repeat_customers, avg_rating, quality_score, is_top, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (vendor_id) DO UPDATE
               SET total_orders = EXCLUDED.total_orders,
                   completed_orders = EXCLUDED.completed_orders,
                   unique_customers = EXCLUDED.unique_customers,
                   repeat_customers = EXCLUDED.repeat_customers,
                   avg_rating = EXCLUDED.avg_rating,
                   quality_score = EXCLUDED.quality_score,
                   is_top = EXCLUDED.is_top,
                   updated_at = NOW()
            "#,
        )
        .bind(metrics.vendor_id)
        .bind(metrics.total_orders)
        .bind(metrics.completed_orders)
        .bind(metrics.unique_customers)
        .bind(metrics.repeat_customers)
        .bind(metrics.avg_rating)
        .bind(metrics.quality_score)
        .bind(metrics.is_top)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationLedger for PgStore {
    async fn sent_since(
        &self,
        offer_id: i64,
        subscriber_id: i64,
        kind: NotificationKind,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1
                  FROM sent_notifications
                 WHERE offer_id = $1
                   AND subscriber_id = $2
                   AND kind = $3
                   AND sent_at > $4
            ) AS recent
            "#,
        )
        .bind(offer_id)
        .bind(subscriber_id)
        .bind(kind.as_str())
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("recent")?)
    }

    async fn record_send(
        &self,
        offer_id: i64,
        subscriber_id: i64,
        kind: NotificationKind,
        sent_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sent_notifications (offer_id, subscriber_id, kind, sent_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (offer_id, subscriber_id, kind)
            DO UPDATE SET sent_at = EXCLUDED.sent_at
            "#,
        )
        .bind(offer_id)
        .bind(subscriber_id)
        .bind(kind.as_str())
        .bind(sent_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EndpointRegistry for PgStore {
    async fn disable_endpoint(&self, subscriber_id: i64) -> anyhow::Result<()> {
        // Conditional write keeps this a no-op for already-disabled rows.
        sqlx::query(
            "UPDATE push_endpoints SET enabled = FALSE WHERE subscriber_id = $1 AND enabled = TRUE",
        )
        .bind(subscriber_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_strings_round_trip() {
        for scope in [
            SubscriptionScope::Offer,
            SubscriptionScope::Business,
            SubscriptionScope::Area,
        ] {
            assert_eq!(parse_scope(scope.as_str()), Some(scope));
        }
        assert_eq!(parse_scope("vendor"), None);
    }

    #[test]
    fn default_stats_are_all_zero() {
        let stats = VendorOrderStats::default();
        assert_eq!(stats.total_orders, 0);
        assert_eq!(stats.avg_rating, 0.0);
    }
}
