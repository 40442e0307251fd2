//! prreview - AI review suggestions for pull request diffs
//!
//! Ingests unified diffs, runs them through the review pipeline against a
//! local Ollama server and prints the persisted suggestions.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use prreview_adapters::config::Config;
use prreview_adapters::diff::parse_unified_diff;
use prreview_adapters::queue::{Enqueued, JobQueue};
use prreview_adapters::store::SqliteStore;
use prreview_core::{NewPullRequest, ReviewJob, ReviewStore};
use prreview_engine::llm::OllamaBackend;
use prreview_engine::{Orchestrator, PipelineContext};
use std::future::Future;
use std::io::BufRead;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "prreview",
    about = "AI review suggestions for pull request diffs",
    version
)]
struct Args {
    /// TOML config file (environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, env = "PRREVIEW_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a pull request from a multi-file unified diff
    Submit {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        number: i64,
        #[arg(long)]
        title: String,
        #[arg(long)]
        author: String,
        #[arg(long, default_value = "")]
        head_sha: String,
        #[arg(long, default_value = "")]
        base_sha: String,
        /// Output of `git diff`
        diff_file: PathBuf,
    },
    /// Queue a review run for a pull request and process it
    Review {
        pr_id: Uuid,
        /// Preferred model (defaults to OLLAMA_MODEL)
        #[arg(long)]
        model: Option<String>,
    },
    /// Print runs and suggestions for a pull request
    Show { pr_id: Uuid },
    /// Process JSON job payloads read line by line from stdin
    Worker,
}

fn setup_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => subscriber
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.log_format);

    let config = Config::load(args.config.as_deref())?;
    let store = Arc::new(
        SqliteStore::open(&config.store.database_path).with_context(|| {
            format!(
                "Failed to open database {}",
                config.store.database_path.display()
            )
        })?,
    );

    match args.command {
        Command::Submit {
            repo,
            number,
            title,
            author,
            head_sha,
            base_sha,
            diff_file,
        } => {
            let text = std::fs::read_to_string(&diff_file)
                .with_context(|| format!("Failed to read {}", diff_file.display()))?;
            let files = parse_unified_diff(&text);
            if files.is_empty() {
                anyhow::bail!("No file diffs found in {}", diff_file.display());
            }
            let pr = store
                .create_pull_request(NewPullRequest {
                    repo,
                    number,
                    title,
                    author,
                    head_sha,
                    base_sha,
                    files,
                })
                .await?;
            info!(pr_id = %pr.id, files = pr.files.len(), "Stored pull request");
            println!("{}", pr.id);
            Ok(())
        }
        Command::Review { pr_id, model } => {
            let run = store.create_run(pr_id).await?;
            let queue = JobQueue::new(config.queue);
            let orchestrator = orchestrator(config, store.clone());
            queue.enqueue(ReviewJob::new(run.id, pr_id, model));
            let stats = queue.run_until_idle(job_handler(orchestrator)).await;
            if stats.failed > 0 {
                warn!(run_id = %run.id, "Review run failed");
            }
            print_run(store.as_ref(), run.id).await
        }
        Command::Show { pr_id } => {
            let pr = store
                .load_target(pr_id)
                .await?
                .with_context(|| format!("Pull request {} not found", pr_id))?;
            println!("{} #{} {} ({})", pr.repo, pr.number, pr.title, pr.author);
            for run in store.runs_for_target(pr_id).await? {
                print_run(store.as_ref(), run.id).await?;
            }
            Ok(())
        }
        Command::Worker => run_stdin_worker(config, store).await,
    }
}

fn orchestrator(config: Config, store: Arc<SqliteStore>) -> Orchestrator {
    let backend = Arc::new(OllamaBackend::new(config.inference.base_url.clone()));
    Orchestrator::new(Arc::new(PipelineContext::new(config, store, backend)))
}

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

fn job_handler(orchestrator: Orchestrator) -> impl Fn(ReviewJob) -> JobFuture {
    move |job| -> JobFuture {
        let orchestrator = orchestrator.clone();
        Box::pin(async move { orchestrator.process(&job).await.map(|_| ()) })
    }
}

/// Feed stdin payloads into the queue while the worker drains it. Returns
/// at end of input once every accepted job has finished.
async fn run_stdin_worker(config: Config, store: Arc<SqliteStore>) -> Result<()> {
    let queue = Arc::new(JobQueue::new(config.queue));
    let handler = job_handler(orchestrator(config, store));

    let reader_queue = Arc::clone(&queue);
    let reader = tokio::task::spawn_blocking(move || {
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "Failed to read stdin");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(Enqueued::Duplicate) = reader_queue.enqueue_payload(&line) {
                info!("Duplicate job payload ignored");
            }
        }
        reader_queue.close();
    });

    let stats = queue.run_worker(handler).await;
    reader.await.context("stdin reader failed")?;
    info!(
        completed = stats.completed,
        failed = stats.failed,
        "Worker drained queue"
    );
    Ok(())
}

async fn print_run(store: &dyn ReviewStore, run_id: Uuid) -> Result<()> {
    let run = store
        .get_run(run_id)
        .await?
        .with_context(|| format!("Review run {} not found", run_id))?;
    println!(
        "run {} [{}] provider={}",
        run.id,
        run.status,
        run.provider.as_deref().unwrap_or("-")
    );
    for s in store.suggestions_for_run(run_id).await? {
        println!(
            "  {:<8} {}:{}-{}  {}",
            s.severity.as_str(),
            s.file_path,
            s.start_line,
            s.end_line,
            s.message
        );
        if let Some(patch) = &s.fix_patch {
            for line in patch.lines() {
                println!("           {}", line);
            }
        }
    }
    Ok(())
}
