use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use litwatch_composer::{CycleMode, SummaryComposer, UpdateOrchestrator};
use litwatch_ingestion::{
    build_term_extractor, Database, GuardedGenerator, LLMGenerator, PipelineConfig, PubMedClient,
    SourceFetcher,
};
use litwatch_schemas::{SpecializedSummaryId, SummaryRequest};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "litwatch")]
#[command(about = "Track a literature query, index new papers and keep versioned summaries")]
struct Args {
    /// Path to SQLite database file (overrides LITWATCH_DB_PATH)
    #[arg(long, short, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one incremental update cycle
    Update,
    /// Run one cycle over the default window, ignoring the progress cursor
    Init,
    /// Run incremental cycles periodically until interrupted
    Watch {
        /// Hours between cycles (overrides LITWATCH_UPDATE_INTERVAL_HOURS)
        #[arg(long)]
        interval_hours: Option<u64>,
    },
    /// Count records the next cycle would fetch
    Count {
        /// Count over the default window instead of since the cursor
        #[arg(long)]
        initial: bool,
    },
    /// Get the summary for a language, updating it if new records arrived
    Summary {
        #[arg(long, short)]
        language: Option<String>,
        /// Regenerate from scratch instead of merging
        #[arg(long)]
        force: bool,
        /// Restrict the scope to records tagged with any of these terms
        #[arg(long = "term")]
        terms: Vec<String>,
        /// Print the stored version without checking for updates
        #[arg(long, conflicts_with_all = ["force", "terms"])]
        cached: bool,
    },
    /// List every summary version for a language, newest first
    History {
        #[arg(long, short)]
        language: Option<String>,
    },
    /// List indexed terms by frequency
    Terms {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Store statistics
    Stats,
    /// Term-scoped summaries
    Specialized {
        #[command(subcommand)]
        action: SpecializedAction,
    },
    /// Apply pending schema migrations and repair term frequencies
    Migrate,
}

#[derive(Subcommand, Debug)]
enum SpecializedAction {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long = "term", required = true)]
        terms: Vec<String>,
        #[arg(long, short)]
        language: Option<String>,
    },
    List,
    Show { id: i64 },
    Delete { id: i64 },
}

struct Pipeline {
    db: Arc<Mutex<Database>>,
    composer: Arc<SummaryComposer>,
    orchestrator: UpdateOrchestrator,
}

fn build_pipeline(config: &PipelineConfig) -> Result<Pipeline> {
    let db = Database::new(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
    let db = Arc::new(Mutex::new(db));

    let llm = LLMGenerator::new(config.llm.clone()).context("Failed to build LLM client")?;
    let generator = Arc::new(GuardedGenerator::from_config(Arc::new(llm), &config.llm));

    let source = PubMedClient::new(config.pubmed.clone()).context("Failed to build PubMed client")?;
    let fetcher = SourceFetcher::new(Arc::new(source)).with_limits(100, config.max_records);

    let extractor = build_term_extractor(config.term_strategy, generator.clone());
    let composer = Arc::new(SummaryComposer::new(db.clone(), generator.clone()));

    let orchestrator = UpdateOrchestrator::new(
        db.clone(),
        fetcher,
        generator,
        extractor,
        composer.clone(),
        config.query.clone(),
        config.language.clone(),
    );

    Ok(Pipeline {
        db,
        composer,
        orchestrator,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = PipelineConfig::from_env().context("Invalid configuration")?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    info!("litwatch v{} (database: {})", env!("CARGO_PKG_VERSION"), config.db_path.display());

    let pipeline = build_pipeline(&config)?;
    let language = |requested: Option<String>| requested.unwrap_or_else(|| config.language.clone());

    match args.command {
        Command::Update => {
            let report = pipeline.orchestrator.run_cycle(CycleMode::Incremental).await?;
            print_json(&report)?;
        }
        Command::Init => {
            let report = pipeline.orchestrator.run_cycle(CycleMode::Initial).await?;
            print_json(&report)?;
        }
        Command::Watch { interval_hours } => {
            let period = interval_hours
                .map(|h| Duration::from_secs(h.max(1) * 3600))
                .unwrap_or(config.update_interval);
            info!("Running an update every {:?}; Ctrl-C to stop", period);

            pipeline
                .orchestrator
                .run_periodic(period, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
        }
        Command::Count { initial } => {
            let mode = if initial {
                CycleMode::Initial
            } else {
                CycleMode::Incremental
            };
            let count = pipeline.orchestrator.count_pending(mode).await?;
            print_json(&serde_json::json!({ "mode": mode, "count": count }))?;
        }
        Command::Summary {
            language: requested,
            force,
            terms,
            cached,
        } => {
            let language = language(requested);
            if cached {
                match pipeline.composer.current_summary(&language).await? {
                    Some(outcome) => print_json(&outcome)?,
                    None => anyhow::bail!("No {} summary stored yet", language),
                }
            } else {
                let request = SummaryRequest {
                    language,
                    force_regenerate: force,
                    terms,
                };
                let outcome = pipeline.composer.request_summary(&request).await?;
                print_json(&outcome)?;
            }
        }
        Command::History { language: requested } => {
            let history = pipeline.composer.history(&language(requested)).await?;
            print_json(&history)?;
        }
        Command::Terms { limit } => {
            let mut terms = pipeline.db.lock().await.all_terms()?;
            terms.truncate(limit);
            print_json(&terms)?;
        }
        Command::Stats => {
            let stats = pipeline.db.lock().await.get_stats()?;
            print_json(&stats)?;
        }
        Command::Specialized { action } => match action {
            SpecializedAction::Create {
                name,
                terms,
                language: requested,
            } => {
                let summary = pipeline
                    .composer
                    .create_specialized(&name, &terms, &language(requested))
                    .await?;
                print_json(&summary)?;
            }
            SpecializedAction::List => {
                print_json(&pipeline.composer.list_specialized().await?)?;
            }
            SpecializedAction::Show { id } => {
                match pipeline
                    .composer
                    .get_specialized(SpecializedSummaryId(id))
                    .await?
                {
                    Some(summary) => print_json(&summary)?,
                    None => anyhow::bail!("Specialized summary {} not found", id),
                }
            }
            SpecializedAction::Delete { id } => {
                let deleted = pipeline
                    .composer
                    .delete_specialized(SpecializedSummaryId(id))
                    .await?;
                print_json(&serde_json::json!({ "id": id, "deleted": deleted }))?;
            }
        },
        Command::Migrate => {
            // Opening the database already applied pending migrations
            let db = pipeline.db.lock().await;
            let repaired = db.recount_term_frequencies()?;
            let stats = db.get_stats()?;
            info!("Schema is current; {} term frequencies repaired", repaired);
            print_json(&serde_json::json!({
                "repaired_term_frequencies": repaired,
                "total_records": stats.total_records,
                "total_terms": stats.total_terms,
            }))?;
        }
    }

    Ok(())
}
