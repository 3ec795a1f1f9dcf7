//! Webhook delivery ids already accepted, used to drop GitHub redeliveries.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::schema::webhook_deliveries;

/// Record a delivery id. Returns `false` when it was seen before.
pub async fn record_delivery(
    conn: &mut AsyncPgConnection,
    delivery_id: &str,
    event_type: &str,
) -> anyhow::Result<bool> {
    let inserted = diesel::insert_into(webhook_deliveries::table)
        .values((
            webhook_deliveries::delivery_id.eq(delivery_id),
            webhook_deliveries::event_type.eq(event_type),
        ))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;

    if inserted == 0 {
        tracing::info!(delivery_id, event = event_type, "Duplicate webhook delivery");
    }
    Ok(inserted > 0)
}

/// Release a delivery id whose processing failed, so a redelivery is handled.
pub async fn forget_delivery(conn: &mut AsyncPgConnection, delivery_id: &str) -> anyhow::Result<()> {
    diesel::delete(webhook_deliveries::table.find(delivery_id))
        .execute(conn)
        .await?;
    Ok(())
}

/// Drop delivery ids received before `cutoff`.
pub async fn prune_deliveries(
    conn: &mut AsyncPgConnection,
    cutoff: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let pruned = diesel::delete(
        webhook_deliveries::table.filter(webhook_deliveries::received_at.lt(cutoff)),
    )
    .execute(conn)
    .await?;
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[tokio::test]
    async fn redelivery_is_detected_until_released() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let mut conn = pool.get().await.unwrap();

        assert!(record_delivery(&mut conn, "d-1", "pull_request").await.unwrap());
        assert!(!record_delivery(&mut conn, "d-1", "pull_request").await.unwrap());

        forget_delivery(&mut conn, "d-1").await.unwrap();
        assert!(record_delivery(&mut conn, "d-1", "pull_request").await.unwrap());
    }

    #[tokio::test]
    async fn pruning_keeps_recent_deliveries() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let mut conn = pool.get().await.unwrap();
        record_delivery(&mut conn, "old", "ping").await.unwrap();
        record_delivery(&mut conn, "new", "ping").await.unwrap();
        diesel::update(webhook_deliveries::table.find("old"))
            .set(webhook_deliveries::received_at.eq(Utc::now() - chrono::Duration::days(30)))
            .execute(&mut *conn)
            .await
            .unwrap();

        let pruned = prune_deliveries(&mut conn, Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(record_delivery(&mut conn, "old", "ping").await.unwrap());
        assert!(!record_delivery(&mut conn, "new", "ping").await.unwrap());
    }
}
