//! `quota_usage` sink for embedding usage events.
//!
//! Each [`UsageEvent`] becomes one `quota_usage` row in whichever database
//! backs the store. Inserts run on a spawned task and failures are only
//! logged, so accounting never blocks or fails the caller.
//! [`QuotaUsageRecorder::flush`] waits for pending inserts before a
//! short-lived process exits.

use chrono::Utc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use embedstore_core::usage::{UsageEvent, UsageRecorder};

use crate::db::{on_pool, DbPool};

#[derive(Clone)]
pub struct QuotaUsageRecorder {
    pool: DbPool,
    pending: TaskTracker,
}

impl QuotaUsageRecorder {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            pending: TaskTracker::new(),
        }
    }

    /// Wait for every insert spawned so far.
    pub async fn flush(&self) {
        self.pending.close();
        self.pending.wait().await;
        self.pending.reopen();
    }
}

/// Insert one event and wait for the write.
pub async fn insert_event(pool: &DbPool, event: &UsageEvent) -> anyhow::Result<()> {
    let request_id = event
        .request_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    on_pool!(pool, |p| {
        sqlx::query(
            r#"
            INSERT INTO quota_usage (ts, provider, metric, amount, scope_id, request_id, endpoint)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(&event.provider)
        .bind(&event.metric)
        .bind(event.amount)
        .bind(&event.scope_id)
        .bind(&request_id)
        .bind(&event.endpoint)
        .execute(p)
        .await?;
    });
    Ok(())
}

impl UsageRecorder for QuotaUsageRecorder {
    fn record(&self, event: UsageEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(metric = %event.metric, "no runtime, dropping usage event");
            return;
        };
        let pool = self.pool.clone();
        self.pending.spawn_on(
            async move {
                if let Err(e) = insert_event(&pool, &event).await {
                    warn!(error = %e, metric = %event.metric, "failed to record usage");
                }
            },
            &handle,
        );
    }
}

/// Totals per `(provider, metric)` for the stats report.
pub async fn usage_totals(pool: &DbPool) -> anyhow::Result<Vec<(String, String, i64)>> {
    let rows: Vec<(String, String, i64)> = on_pool!(pool, |p| {
        sqlx::query_as(
            "SELECT provider, metric, CAST(COALESCE(SUM(amount), 0) AS BIGINT) FROM quota_usage \
             GROUP BY provider, metric ORDER BY provider, metric",
        )
        .fetch_all(p)
        .await?
    });
    Ok(rows)
}
