//! # CodeQuest CLI (`cq`)
//!
//! ## Usage
//!
//! ```bash
//! cq --config ./config/codequest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cq init` | Create the SQLite database and run schema migrations |
//! | `cq analyze <url>` | Fetch, analyze and index a repository, then build a walkthrough |
//! | `cq search "<query>" --repo <id>` | Search an indexed repository |
//! | `cq ask "<question>" --repo <id>` | Ask a question about an indexed repository |
//! | `cq repos` | List indexed repositories |
//! | `cq status` | Show model backends, fallback plan and embedding setup |
//! | `cq serve` | Start the HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! cq init
//! cq analyze https://github.com/tokio-rs/mini-redis --level intermediate
//! cq search "frame parsing" --repo tokio-rs/mini-redis --mode hybrid
//! cq ask "how are connections shut down?" --repo tokio-rs/mini-redis
//! cq serve
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use codequest::app::AppContext;
use codequest::ask::AskRequest;
use codequest::config;
use codequest::migrate;
use codequest::progress::{format_number, ProgressMode};
use codequest::search;
use codequest::server;
use codequest::walkthrough::UserLevel;
use codequest::workflow::{AnalyzeRequest, WorkflowOutput};
use codequest_core::search::SearchMode;

/// CodeQuest: learn a code repository through hybrid code search and a
/// guided walkthrough.
#[derive(Parser)]
#[command(
    name = "cq",
    about = "CodeQuest: learn a repository through hybrid code search and guided walkthroughs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/codequest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Analyze a repository and generate a learning walkthrough.
    ///
    /// Runs fetch → analyze → index → synthesize. Progress goes to stderr;
    /// the walkthrough goes to stdout.
    Analyze {
        /// Git URL, local path, or `file://` URL.
        url: String,

        /// Reader experience: beginner, intermediate, or advanced.
        #[arg(long, default_value = "beginner")]
        level: UserLevel,

        /// Idempotency key for the run.
        #[arg(long)]
        request_id: Option<String>,

        /// Progress output: off, human, or json (default: human on a TTY).
        #[arg(long)]
        progress: Option<String>,

        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search an indexed repository.
    Search {
        query: String,

        /// Repository id (`owner/name`).
        #[arg(long)]
        repo: String,

        /// `vector`, `fulltext`, or `hybrid`.
        #[arg(long, default_value = "hybrid")]
        mode: SearchMode,

        /// Maximum number of results (default `retrieval.final_limit`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ask a question about an indexed repository.
    Ask {
        question: String,

        #[arg(long)]
        repo: String,

        #[arg(long, default_value = "beginner")]
        level: UserLevel,

        #[arg(long)]
        json: bool,
    },

    /// List indexed repositories.
    Repos,

    /// Show model backends, fallback plan and embedding configuration.
    Status,

    /// Start the HTTP API server on `[server].bind`.
    Serve,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let progress = match &cli.command {
        Commands::Analyze {
            progress: Some(mode),
            ..
        } => ProgressMode::parse(mode)
            .with_context(|| format!("invalid --progress value: {mode} (use off, human, or json)"))?,
        _ => ProgressMode::default_for_tty(),
    };
    let ctx = Arc::new(AppContext::build(cfg, progress).await?);

    let result = run(ctx.clone(), cli.command).await;
    ctx.shutdown().await;
    result
}

async fn run(ctx: Arc<AppContext>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {}
        Commands::Analyze {
            url,
            level,
            request_id,
            json,
            ..
        } => {
            let request = AnalyzeRequest {
                url,
                request_id,
                user_level: level,
            };
            let output = ctx.orchestrator.run(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                print_walkthrough(&output);
            }
        }
        Commands::Search {
            query,
            repo,
            mode,
            limit,
        } => {
            if query.trim().is_empty() {
                println!("No results.");
                return Ok(());
            }
            let response = ctx.retriever.search(&repo, &query, mode, limit).await?;
            search::print_results(&response);
        }
        Commands::Ask {
            question,
            repo,
            level,
            json,
        } => {
            let request = AskRequest {
                question,
                repo_id: repo,
                user_level: level,
            };
            let answer = ctx.ask(&request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                for w in &answer.warnings {
                    eprintln!("warning: {}", w.message);
                }
                println!("{}\n", answer.answer);
                if !answer.sources.is_empty() {
                    println!("Sources:");
                    for s in &answer.sources {
                        println!("  {}:{} [{:.2}]", s.file_path, s.line_range, s.similarity_score);
                    }
                }
            }
        }
        Commands::Repos => {
            let repos = ctx.store.list_repositories().await?;
            if repos.is_empty() {
                println!("No repositories indexed. Run `cq analyze <url>` first.");
                return Ok(());
            }
            println!("{:<32} {:<10} {:>7} {:>8}  INDEXED", "REPOSITORY", "STATUS", "FILES", "CHUNKS");
            for r in repos {
                let indexed = r
                    .indexed_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<32} {:<10} {:>7} {:>8}  {}",
                    r.repo_id,
                    r.status.as_str(),
                    format_number(r.file_count as u64),
                    format_number(r.chunk_count as u64),
                    indexed
                );
            }
        }
        Commands::Status => {
            let status = ctx.selector.status().await;
            let plan: Vec<String> = status
                .plan
                .iter()
                .map(|t| format!("{:?}", t).to_lowercase())
                .collect();
            println!("Generation plan: {}", plan.join(" → "));
            if status.backends.is_empty() {
                println!("  no model backends configured");
            }
            for b in &status.backends {
                println!(
                    "  {:<24} {:<7} {}",
                    b.name,
                    if b.available { "up" } else { "down" },
                    format!("{:?}", b.cost_class).to_lowercase()
                );
            }
            println!("Fallback available: {}", if status.has_fallback { "yes" } else { "no" });
            match &ctx.embedder {
                Some(e) => println!("Embeddings: {} ({} dims)", e.model_name(), e.dims()),
                None => println!("Embeddings: disabled (full-text search only)"),
            }
        }
        Commands::Serve => {
            server::run_server(ctx).await?;
        }
    }
    Ok(())
}

fn print_walkthrough(output: &WorkflowOutput) {
    let w = &output.walkthrough;
    println!("{}", w.title);
    println!(
        "{} · {} · complexity {}",
        w.difficulty.level, w.estimated_time, w.difficulty.complexity_score
    );
    println!();
    println!("{}", w.description);
    println!();
    for (i, m) in w.modules.iter().enumerate() {
        let lock = if m.unlocked { " " } else { "🔒" };
        println!("{} {}. {} ({}, {})", lock, i + 1, m.title, m.difficulty, m.estimated_time);
        if !m.focus_files.is_empty() {
            println!("     files: {}", m.focus_files.join(", "));
        }
        println!("     quiz: {} questions · {} activities", m.quiz.len(), m.activities.len());
    }
    if let Some(index) = &output.index {
        println!();
        println!("Indexed {}", index.summary());
    }
    for warning in &output.warnings {
        eprintln!("warning: {}", warning.message);
    }
}
