//! # embedstore CLI (`estore`)
//!
//! Command-line front end for the embedding store: schema setup, upserting
//! text, similarity search, re-embedding stale rows and running the
//! background freshness loop.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `estore init` | Create the database and run schema migrations |
//! | `estore upsert` | Chunk, embed and store one entity's text |
//! | `estore search "<query>"` | Similarity search |
//! | `estore reembed` | Run one freshness pass |
//! | `estore watch` | Run the freshness scheduler until Ctrl-C |
//! | `estore stats` | Row, staleness and usage summary |
//! | `estore index analyze` | ANALYZE (and optionally REINDEX) the pgvector index |
//! | `estore index create\|drop` | Manage an alternate ivfflat index |
//!
//! ## Examples
//!
//! ```bash
//! estore --config ./config/estore.toml init
//! estore upsert --entity-type keyword --entity-id kw:42 --scope 123 --text "trail running shoes"
//! estore search "running shoes" -k 5 --scope 123
//! estore reembed --max-age-hours 24 --limit 200
//! RUST_LOG=debug estore watch --interval-secs 600
//! estore index analyze --reindex
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use embedstore::commands::{self, ReembedArgs, SearchArgs, UpsertArgs};
use embedstore::maintenance::{IndexAction, DEFAULT_IVFFLAT_LISTS};
use embedstore::{config, migrate, stats};

/// embedstore: content-addressed embedding store with similarity search.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "estore", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/estore.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Chunk, embed and store text for one entity.
    ///
    /// Unchanged chunks are skipped, changed ones are re-embedded in place
    /// and chunks past the new end of the text are removed. Prints the ids
    /// of rows written as a JSON array.
    Upsert {
        #[arg(long)]
        entity_type: String,

        #[arg(long)]
        entity_id: Option<String>,

        #[arg(long = "scope")]
        scope_id: Option<String>,

        #[arg(long)]
        title: Option<String>,

        /// JSON object stored with every chunk.
        #[arg(long)]
        meta: Option<String>,

        /// Embedding model override.
        #[arg(long)]
        model: Option<String>,

        #[arg(long, conflicts_with = "file")]
        text: Option<String>,

        /// Read the text from a file.
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long)]
        chunk_words: Option<usize>,

        #[arg(long)]
        overlap_words: Option<usize>,
    },

    /// Similarity search over stored chunks.
    Search {
        query: String,

        /// Number of results (default from `[retrieval].k`).
        #[arg(short = 'k', long)]
        k: Option<usize>,

        #[arg(long)]
        entity_type: Option<String>,

        #[arg(long = "scope")]
        scope_id: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Re-embed rows older than the freshness threshold (one pass).
    Reembed {
        #[arg(long)]
        max_age_hours: Option<u32>,

        #[arg(long)]
        limit: Option<usize>,

        /// Ignore age and take the oldest rows.
        #[arg(long)]
        force: bool,

        #[arg(long)]
        entity_type: Option<String>,

        #[arg(long = "scope")]
        scope_id: Option<String>,

        #[arg(long)]
        model: Option<String>,
    },

    /// Run the freshness scheduler until interrupted.
    Watch {
        /// Seconds between passes (default from `[freshness].interval_secs`).
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Show row counts, staleness and usage totals.
    Stats,

    /// pgvector index maintenance (no-op on SQLite). Prints a JSON report.
    Index {
        #[command(subcommand)]
        action: IndexCommand,
    },
}

#[derive(Subcommand)]
enum IndexCommand {
    /// Refresh planner statistics after bulk loads.
    Analyze {
        /// Also rebuild the vector index concurrently.
        #[arg(long)]
        reindex: bool,
    },

    /// Create an alternate ivfflat index.
    Create {
        /// Inverted lists, clamped to 10..=65535.
        #[arg(long, default_value_t = DEFAULT_IVFFLAT_LISTS)]
        lists: u32,

        /// Index name (default `idx_embedding_vec_l<lists>`).
        #[arg(long)]
        name: Option<String>,
    },

    /// Drop an alternate ivfflat index.
    Drop {
        #[arg(long, default_value_t = DEFAULT_IVFFLAT_LISTS)]
        lists: u32,

        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let backend = migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully ({}).", backend);
        }
        Commands::Upsert {
            entity_type,
            entity_id,
            scope_id,
            title,
            meta,
            model,
            text,
            file,
            chunk_words,
            overlap_words,
        } => {
            commands::run_upsert(
                &cfg,
                UpsertArgs {
                    entity_type,
                    entity_id,
                    scope_id,
                    title,
                    meta,
                    model,
                    text,
                    file,
                    chunk_words,
                    overlap_words,
                },
            )
            .await?;
        }
        Commands::Search {
            query,
            k,
            entity_type,
            scope_id,
            model,
            json,
        } => {
            commands::run_search(
                &cfg,
                SearchArgs {
                    query,
                    k,
                    entity_type,
                    scope_id,
                    model,
                    json,
                },
            )
            .await?;
        }
        Commands::Reembed {
            max_age_hours,
            limit,
            force,
            entity_type,
            scope_id,
            model,
        } => {
            commands::run_reembed(
                &cfg,
                ReembedArgs {
                    max_age_hours,
                    limit,
                    force,
                    entity_type,
                    scope_id,
                    model,
                },
            )
            .await?;
        }
        Commands::Watch { interval_secs } => {
            commands::run_watch(&cfg, interval_secs).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Index { action } => match action {
            IndexCommand::Analyze { reindex } => {
                commands::run_index_analyze(&cfg, reindex).await?;
            }
            IndexCommand::Create { lists, name } => {
                commands::run_index_alt(&cfg, IndexAction::Create, lists, name).await?;
            }
            IndexCommand::Drop { lists, name } => {
                commands::run_index_alt(&cfg, IndexAction::Drop, lists, name).await?;
            }
        },
    }

    Ok(())
}
