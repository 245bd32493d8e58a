//! Store statistics and health overview.
//!
//! Summarizes what's indexed: row counts per entity type, how many rows are
//! past the freshness threshold, which models produced the vectors, and
//! usage totals. Used by `estore stats`.

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::config::Config;
use crate::db::{self, on_pool, DbPool};
use crate::usage_log::usage_totals;

/// Per-entity-type breakdown.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTypeStats {
    pub entity_type: String,
    pub rows: i64,
    pub entities: i64,
    pub last_write_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub total_rows: i64,
    /// Rows older than the freshness threshold.
    pub stale_rows: i64,
    /// Rows still carrying placeholder vectors.
    pub placeholder_rows: i64,
    pub by_type: Vec<EntityTypeStats>,
    pub by_model: Vec<(String, String, i64)>,
    pub usage: Vec<(String, String, i64)>,
}

pub async fn collect_stats(pool: &DbPool, max_age_hours: u32) -> Result<IndexStats> {
    let cutoff = (Utc::now() - Duration::hours(i64::from(max_age_hours))).timestamp_millis();

    let (total_rows, stale_rows, placeholder_rows, type_rows, by_model) = on_pool!(pool, |p| {
        let total_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding")
            .fetch_one(p)
            .await?;
        let stale_rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM embedding WHERE ts < $1")
                .bind(cutoff)
                .fetch_one(p)
                .await?;
        let placeholder_rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM embedding WHERE provider = 'none'")
                .fetch_one(p)
                .await?;
        let type_rows: Vec<(String, i64, i64, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT
                entity_type,
                COUNT(*) AS row_count,
                COUNT(DISTINCT COALESCE(entity_id, '')) AS entity_count,
                MAX(ts) AS last_ts
            FROM embedding
            GROUP BY entity_type
            ORDER BY row_count DESC, entity_type ASC
            "#,
        )
        .fetch_all(p)
        .await?;
        let by_model: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT provider, model, COUNT(*) FROM embedding \
             GROUP BY provider, model ORDER BY provider, model",
        )
        .fetch_all(p)
        .await?;
        (total_rows, stale_rows, placeholder_rows, type_rows, by_model)
    });

    let by_type = type_rows
        .into_iter()
        .map(|(entity_type, rows, entities, last_write_ms)| EntityTypeStats {
            entity_type,
            rows,
            entities,
            last_write_ms,
        })
        .collect();

    Ok(IndexStats {
        total_rows,
        stale_rows,
        placeholder_rows,
        by_type,
        by_model,
        usage: usage_totals(pool).await?,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::open(config).await?;
    let stats = collect_stats(&pool, config.freshness.max_age_hours).await?;

    println!("embedstore: database stats");
    println!("==========================");
    println!();
    match &pool {
        DbPool::Sqlite(_) => {
            let db_size = std::fs::metadata(&config.db.path)
                .map(|m| m.len())
                .unwrap_or(0);
            println!("  Database:    {}", config.db.path.display());
            println!("  Size:        {}", format_bytes(db_size));
        }
        #[cfg(feature = "postgres")]
        DbPool::Postgres(_) => println!("  Database:    postgres"),
    }
    println!();
    println!("  Rows:        {}", stats.total_rows);
    println!(
        "  Stale:       {} (older than {}h)",
        stats.stale_rows, config.freshness.max_age_hours
    );
    println!("  Placeholder: {}", stats.placeholder_rows);

    if !stats.by_type.is_empty() {
        println!();
        println!("  By entity type:");
        println!(
            "  {:<24} {:>8} {:>9}   {}",
            "ENTITY TYPE", "ROWS", "ENTITIES", "LAST WRITE"
        );
        println!("  {}", "-".repeat(64));
        for t in &stats.by_type {
            let last = match t.last_write_ms {
                Some(ms) => format_ms_relative(ms),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>8} {:>9}   {}",
                t.entity_type, t.rows, t.entities, last
            );
        }
    }

    if !stats.by_model.is_empty() {
        println!();
        println!("  By model:");
        for (provider, model, n) in &stats.by_model {
            println!("  {:<10} {:<32} {:>8}", provider, model, n);
        }
    }

    if !stats.usage.is_empty() {
        println!();
        println!("  Usage:");
        for (provider, metric, amount) in &stats.usage {
            println!("  {:<10} {:<16} {:>12}", provider, metric, amount);
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a unix-millisecond timestamp relative to now (e.g. "3 hours ago").
fn format_ms_relative(ms: i64) -> String {
    let delta = (Utc::now().timestamp_millis() - ms) / 1000;

    if delta < 0 {
        return format_ms_iso(ms);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ms_iso(ms)
    }
}

fn format_ms_iso(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}
