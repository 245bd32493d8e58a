//! Implementations of the index-facing CLI commands.
//!
//! Results go to stdout; logs go to stderr through `tracing`.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;

use embedstore_core::freshness::ReembedOptions;
use embedstore_core::search::SearchRequest;
use embedstore_core::upsert::UpsertRequest;

use crate::app;
use crate::config::Config;
use crate::db;
use crate::maintenance::{self, IndexAction};
use crate::scheduler::{FreshnessScheduler, TickOutcome};

pub struct UpsertArgs {
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub scope_id: Option<String>,
    pub title: Option<String>,
    pub meta: Option<String>,
    pub model: Option<String>,
    pub text: Option<String>,
    pub file: Option<PathBuf>,
    pub chunk_words: Option<usize>,
    pub overlap_words: Option<usize>,
}

pub async fn run_upsert(config: &Config, args: UpsertArgs) -> Result<()> {
    let text = match (args.text, &args.file) {
        (Some(t), None) => t,
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        _ => bail!("exactly one of --text or --file is required"),
    };
    let meta: Option<serde_json::Value> = args
        .meta
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--meta must be valid JSON")?;

    let app = app::open(config).await?;
    let mut req = UpsertRequest::new(&args.entity_type, args.entity_id.as_deref(), &text);
    req.scope_id = args.scope_id.as_deref();
    req.title = args.title.as_deref();
    req.model = args.model.as_deref();
    req.meta = meta.as_ref();
    req.chunk_words = args.chunk_words.unwrap_or(config.chunking.max_words);
    req.overlap_words = args.overlap_words.unwrap_or(config.chunking.overlap_words);

    let result = app.index.upsert(&req).await;
    app.shutdown().await;
    let ids = result?;

    println!("{}", serde_json::to_string(&ids)?);
    Ok(())
}

pub struct SearchArgs {
    pub query: String,
    pub k: Option<usize>,
    pub entity_type: Option<String>,
    pub scope_id: Option<String>,
    pub model: Option<String>,
    pub json: bool,
}

pub async fn run_search(config: &Config, args: SearchArgs) -> Result<()> {
    let app = app::open(config).await?;
    let req = SearchRequest {
        query: &args.query,
        k: args.k.unwrap_or(config.retrieval.k),
        entity_type: args.entity_type.as_deref(),
        scope_id: args.scope_id.as_deref(),
        model: args.model.as_deref(),
    };

    let result = app.index.search(&req).await;
    app.shutdown().await;
    let hits = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.4}] #{} {}:{}",
            i + 1,
            hit.score,
            hit.id,
            hit.entity_type,
            hit.entity_id.as_deref().unwrap_or("-")
        );
        if let Some(title) = &hit.title {
            println!("   title: {}", title);
        }
        println!("   {}", snippet(&hit.text, 160));
    }
    Ok(())
}

pub struct ReembedArgs {
    pub max_age_hours: Option<u32>,
    pub limit: Option<usize>,
    pub force: bool,
    pub entity_type: Option<String>,
    pub scope_id: Option<String>,
    pub model: Option<String>,
}

pub async fn run_reembed(config: &Config, args: ReembedArgs) -> Result<()> {
    let app = app::open(config).await?;
    let defaults = &config.freshness;
    let opts = ReembedOptions {
        max_age_hours: args.max_age_hours.unwrap_or(defaults.max_age_hours),
        limit: args.limit.unwrap_or(defaults.limit),
        model: args.model.as_deref().or(defaults.model.as_deref()),
        entity_type: args.entity_type.as_deref().or(defaults.entity_type.as_deref()),
        scope_id: args.scope_id.as_deref().or(defaults.scope_id.as_deref()),
        force: args.force || defaults.force,
    };

    let result = app.index.reembed_stale(&opts).await;
    app.shutdown().await;
    let report = result?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Run the freshness scheduler until Ctrl-C.
pub async fn run_watch(config: &Config, interval_secs: Option<u64>) -> Result<()> {
    let mut freshness = config.freshness.clone();
    if let Some(secs) = interval_secs {
        if secs == 0 {
            bail!("--interval-secs must be > 0");
        }
        freshness.interval_secs = secs;
    }

    let app = app::open(config).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = FreshnessScheduler::new(app.index.clone(), freshness)
        .with_observer(tx)
        .spawn();

    let printer = tokio::spawn(async move {
        while let Some(outcome) = rx.recv().await {
            match outcome {
                TickOutcome::Completed(report) => println!(
                    "reembedded={} skipped={} candidates={}",
                    report.reembedded, report.skipped, report.total_candidates
                ),
                TickOutcome::Failed(err) => println!("tick failed: {}", err),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down freshness scheduler");
    handle.cancel();
    handle.join().await?;
    printer.await?;
    app.shutdown().await;
    Ok(())
}

pub async fn run_index_analyze(config: &Config, reindex: bool) -> Result<()> {
    let pool = db::open(config).await?;
    let result = maintenance::analyze(&pool, reindex).await;
    pool.close().await;
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

pub async fn run_index_alt(
    config: &Config,
    action: IndexAction,
    lists: u32,
    name: Option<String>,
) -> Result<()> {
    let pool = db::open(config).await?;
    let result = maintenance::alt_index(&pool, action, lists, name.as_deref()).await;
    pool.close().await;
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

/// First `max_chars` characters of `text` on one line.
fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut)
}
