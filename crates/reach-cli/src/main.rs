mod table;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use reach_client::{ContactExtractor, HttpSessionFactory, ModeVerifier, PageSource, VerifyMode};
use reach_core::checkpoint::{CheckpointStore, checkpoint_file_name};
use reach_core::governor::{GovernorConfig, ResourceGovernor};
use reach_core::models::{Row, RunResult};
use reach_core::orchestrator::{Orchestrator, OrchestratorConfig, TracingRunReporter};
use reach_core::retry::RetryPolicy;
use reach_core::traits::SessionFactory;

#[derive(Parser)]
#[command(name = "reach", version, about = "Resumable contact extraction for lists of websites")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract emails and social profiles for every row of a CSV file
    Run(RunArgs),

    /// Show checkpoint progress for a job
    Status {
        /// Job name (defaults to the input file stem on `run`)
        #[arg(short, long)]
        job: String,

        /// Directory holding checkpoint files
        #[arg(long, env = "REACH_CHECKPOINT_DIR", default_value = "checkpoints")]
        checkpoint_dir: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Input CSV file
    #[arg(short, long)]
    input: PathBuf,

    /// Output CSV file (defaults to <input>_contacts.csv)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Job name used for the checkpoint (defaults to the input file stem)
    #[arg(short, long)]
    job: Option<String>,

    /// Column holding the website URL
    #[arg(long, default_value = "website")]
    target_column: String,

    /// Number of concurrent workers (one session each)
    #[arg(short, long, env = "REACH_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Directory holding checkpoint files
    #[arg(long, env = "REACH_CHECKPOINT_DIR", default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// Per-attempt page load timeout, in seconds
    #[arg(long, env = "REACH_PAGE_TIMEOUT", default_value_t = 15)]
    page_timeout: u64,

    /// Retries after the first attempt for transient failures
    #[arg(long, env = "REACH_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Initial delay between retries, in seconds
    #[arg(long, default_value_t = 2.0)]
    retry_delay: f64,

    /// Backoff multiplier applied to the retry delay
    #[arg(long, default_value_t = 2.0)]
    backoff: f64,

    /// Save the checkpoint after this many processed rows
    #[arg(long, default_value_t = 5)]
    save_every: usize,

    /// Only process the first N rows (20 if given without a value)
    #[arg(long, value_name = "ROWS", num_args = 0..=1, default_missing_value = "20")]
    test_limit: Option<usize>,

    /// Discard existing checkpoint progress and start over
    #[arg(long, default_value_t = false)]
    fresh: bool,

    /// Re-run the failed rows of a completed job
    #[arg(long, default_value_t = false, conflicts_with = "fresh")]
    retry_failed: bool,

    /// Render pages in headless Chromium instead of plain HTTP
    #[arg(long, default_value_t = false)]
    browser: bool,

    /// Email verification: none, format or domain
    #[arg(long, env = "REACH_VERIFY", default_value = "none")]
    verify: VerifyMode,

    /// Allow targets on private/reserved IP ranges
    #[arg(long, default_value_t = false)]
    allow_private_urls: bool,

    /// Throttle dispatch above this process memory share (percent)
    #[arg(long, env = "REACH_MAX_MEMORY_PERCENT", default_value_t = 80.0)]
    max_memory_percent: f64,

    /// Throttle dispatch above this process CPU share (percent)
    #[arg(long, env = "REACH_MAX_CPU_PERCENT", default_value_t = 70.0)]
    max_cpu_percent: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("reach=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => cmd_run(args).await?,
        Commands::Status {
            job,
            checkpoint_dir,
        } => cmd_status(&job, &checkpoint_dir)?,
    }

    Ok(())
}

/// Derive the job name from the input path (e.g. "leads_rome.csv" -> "leads_rome")
fn derive_job_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("default")
        .to_string()
}

fn default_output_path(input: &Path) -> PathBuf {
    input.with_file_name(format!("{}_contacts.csv", derive_job_name(input)))
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let job = args.job.clone().unwrap_or_else(|| derive_job_name(&args.input));
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.input));

    let table = table::read_rows(&args.input, &args.target_column)?;
    tracing::info!(
        input = %args.input.display(),
        rows = table.rows.len(),
        %job,
        "Loaded input"
    );

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight rows and saving progress");
            signal_token.cancel();
        }
    });

    let result = if args.browser {
        run_with_browser(&args, &job, table.rows, &cancel).await?
    } else {
        let mut factory = HttpSessionFactory::new();
        if args.allow_private_urls {
            factory = factory.allow_private_urls();
        }
        run_pipeline(factory, &args, &job, table.rows, &cancel).await?
    };

    table::write_results(&output, &table.headers, &result)?;
    print_summary(&result, &output);

    Ok(())
}

#[cfg(feature = "browser")]
async fn run_with_browser(
    args: &RunArgs,
    job: &str,
    rows: Vec<Row>,
    cancel: &CancellationToken,
) -> Result<RunResult> {
    let factory = reach_client::BrowserSessionFactory::new();
    run_pipeline(factory, args, job, rows, cancel).await
}

#[cfg(not(feature = "browser"))]
async fn run_with_browser(
    _args: &RunArgs,
    _job: &str,
    _rows: Vec<Row>,
    _cancel: &CancellationToken,
) -> Result<RunResult> {
    anyhow::bail!("--browser requires reach to be built with the `browser` feature")
}

async fn run_pipeline<SF>(
    factory: SF,
    args: &RunArgs,
    job: &str,
    rows: Vec<Row>,
    cancel: &CancellationToken,
) -> Result<RunResult>
where
    SF: SessionFactory,
    SF::Session: PageSource,
{
    let retry = RetryPolicy::new(
        args.max_retries,
        Duration::try_from_secs_f64(args.retry_delay).context("Invalid --retry-delay")?,
        args.backoff,
    );
    let governor = GovernorConfig::default()
        .with_max_memory_percent(args.max_memory_percent)
        .with_max_cpu_percent(args.max_cpu_percent);
    let config = OrchestratorConfig::default()
        .with_workers(args.workers)
        .with_checkpoint_dir(&args.checkpoint_dir)
        .with_page_timeout(Duration::from_secs(args.page_timeout))
        .with_save_every(args.save_every)
        .with_test_limit(args.test_limit)
        .with_fresh(args.fresh)
        .with_retry_failed(args.retry_failed);

    let extractor = ContactExtractor::new().with_verifier(ModeVerifier(args.verify));
    let orchestrator = Orchestrator::new(factory, extractor, config)
        .with_retry_policy(retry)
        .with_governor(Arc::new(ResourceGovernor::new(governor)));

    let result = orchestrator
        .run(job, rows, cancel, &TracingRunReporter)
        .await
        .context("Extraction run failed")?;

    let stats = orchestrator.governor().stats();
    tracing::info!(
        peak_memory_percent = stats.peak_memory_percent,
        peak_cpu_percent = stats.peak_cpu_percent,
        memory_warnings = stats.memory_warnings,
        cpu_warnings = stats.cpu_warnings,
        "Resource usage"
    );

    Ok(result)
}

fn print_summary(result: &RunResult, output: &Path) {
    print!("{}", render_summary(result, output));
}

fn render_summary(result: &RunResult, output: &Path) -> String {
    use std::fmt::Write;

    let summary = &result.summary;
    let mut out = String::new();
    let _ = writeln!(out, "\nJob '{}' ({}):", summary.job_name, summary.run_id);
    let _ = writeln!(out, "  rows:       {}", summary.total);
    let _ = writeln!(out, "  completed:  {}", summary.completed);
    let _ = writeln!(out, "  failed:     {}", summary.failed);
    let _ = writeln!(out, "  pending:    {}", summary.pending);
    let _ = writeln!(out, "  dispatched: {}", summary.dispatched);
    let _ = writeln!(out, "  throttled:  {}", summary.throttle_events);
    let _ = writeln!(out, "  elapsed:    {:.1}s", summary.elapsed.as_secs_f64());

    if let Some(kind) = &summary.most_common_error {
        let _ = writeln!(out, "  most common error: {kind}");
    }
    if !result.errors.error_types.is_empty() {
        let _ = writeln!(out, "  errors:");
        for (kind, count) in &result.errors.error_types {
            let _ = writeln!(out, "    {kind}: {count}");
        }
    }
    if summary.interrupted {
        let _ = writeln!(
            out,
            "\nInterrupted: progress saved, run the same command again to resume."
        );
    }
    let _ = writeln!(out, "\nResults written to {}", output.display());
    out
}

fn cmd_status(job: &str, checkpoint_dir: &Path) -> Result<()> {
    if !checkpoint_dir.join(checkpoint_file_name(job)).exists() {
        println!("No checkpoint found for job '{job}' in {}", checkpoint_dir.display());
        return Ok(());
    }

    let store = CheckpointStore::open(checkpoint_dir, job).context("Failed to open checkpoint")?;
    let progress = store.progress();

    println!("Job '{job}':");
    println!(
        "  progress:  {}/{} ({:.1}%)",
        progress.completed, progress.total, progress.percent_complete
    );
    println!("  failed:    {}", progress.failed);
    println!("  pending:   {}", progress.pending);
    println!(
        "  started:   {}",
        progress.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  updated:   {}",
        progress.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  status:    {}",
        if store.is_completed() {
            "completed"
        } else {
            "in progress"
        }
    );

    let failed: Vec<_> = store
        .failed_rows()
        .iter()
        .filter(|(row, _)| !store.is_row_completed(**row))
        .collect();
    if !failed.is_empty() {
        println!("\nFailed rows:");
        for (row, detail) in failed {
            println!("  [{row}] {} ({}): {}", detail.target, detail.kind, detail.error);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_job_name() {
        assert_eq!(derive_job_name(Path::new("data/leads_rome.csv")), "leads_rome");
        assert_eq!(
            default_output_path(Path::new("data/leads_rome.csv")),
            PathBuf::from("data/leads_rome_contacts.csv")
        );
    }

    #[test]
    fn test_cli_parses_run_defaults() {
        let cli = Cli::try_parse_from(["reach", "run", "--input", "leads.csv"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.target_column, "website");
        assert_eq!(args.page_timeout, 15);
        assert_eq!(args.max_retries, 3);
        assert_eq!(args.test_limit, None);
        assert_eq!(args.verify, VerifyMode::None);
    }

    #[test]
    fn test_cli_test_limit_without_value() {
        let cli = Cli::try_parse_from(["reach", "run", "-i", "leads.csv", "--test-limit"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.test_limit, Some(20));
    }

    #[test]
    fn test_summary_reports_most_common_error() {
        use std::collections::BTreeMap;

        use reach_core::models::RunSummary;
        use reach_core::retry::ErrorSummary;

        let result = RunResult {
            rows: Vec::new(),
            summary: RunSummary {
                run_id: uuid::Uuid::new_v4(),
                job_name: "leads".into(),
                total: 10,
                completed: 8,
                failed: 2,
                pending: 0,
                dispatched: 10,
                throttle_events: 0,
                interrupted: false,
                elapsed: Duration::from_secs(3),
                most_common_error: Some("timeout".into()),
            },
            errors: ErrorSummary {
                total_errors: 5,
                error_types: BTreeMap::from([("timeout".into(), 4), ("http".into(), 1)]),
                recent_errors_count: 5,
                most_common_error: Some("timeout".into()),
            },
        };

        let text = render_summary(&result, Path::new("leads_contacts.csv"));
        assert!(text.contains("  most common error: timeout\n"), "{text}");
        assert!(text.contains("    timeout: 4\n"));
        assert!(text.ends_with("Results written to leads_contacts.csv\n"));
    }

    #[test]
    fn test_summary_without_errors_omits_classification() {
        let result = RunResult {
            rows: Vec::new(),
            summary: reach_core::models::RunSummary {
                run_id: uuid::Uuid::new_v4(),
                job_name: "clean".into(),
                total: 1,
                completed: 1,
                failed: 0,
                pending: 0,
                dispatched: 1,
                throttle_events: 0,
                interrupted: false,
                elapsed: Duration::from_millis(10),
                most_common_error: None,
            },
            errors: Default::default(),
        };

        let text = render_summary(&result, Path::new("out.csv"));
        assert!(!text.contains("most common error"));
    }

    #[test]
    fn test_cli_rejects_fresh_with_retry_failed() {
        let parsed =
            Cli::try_parse_from(["reach", "run", "-i", "a.csv", "--fresh", "--retry-failed"]);
        assert!(parsed.is_err());
    }
}
