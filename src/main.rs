use clap::{Args, Parser, Subcommand};
use extract_batch::{
    app_state::AppState,
    config::AppConfig,
    db,
    models::job::{Job, StatusKind},
    routes,
    services::{job_store::JobStore, reconciler::Reconciler, seed},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "extract-batch")]
#[command(about = "Manage the extraction job store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add jobs to the store (existing ids are left alone)
    Seed(SeedArgs),

    /// Show job counts per status
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Also list jobs with this status
        #[arg(long, value_parser = parse_status)]
        list: Option<StatusKind>,
    },

    /// Show one job and its claim history
    Show {
        /// Job id
        id: String,
    },

    /// Recover stale claims now
    Reconcile,

    /// Make jobs eligible again with a fresh attempt budget
    Reset(ResetArgs),

    /// Serve the read-only status API
    Serve,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct SeedSource {
    /// Directory of input documents, one job per file
    #[arg(long)]
    dir: Option<PathBuf>,

    /// JSON manifest: [{"id": "...", "input_ref": "..."}]
    #[arg(long)]
    manifest: Option<PathBuf>,
}

#[derive(Args)]
struct SeedArgs {
    #[command(flatten)]
    source: SeedSource,

    /// File extension to pick up with --dir
    #[arg(long, default_value = "pdf")]
    extension: String,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ResetArgs {
    /// Reset one job (refused while it is claimed)
    #[arg(long)]
    job: Option<String>,

    /// Reset every job that used up its attempts
    #[arg(long)]
    failed: bool,
}

fn parse_status(s: &str) -> Result<StatusKind, String> {
    s.parse::<StatusKind>()
        .map_err(|_| format!("unknown status {s:?} (unclaimed, claimed, success, failed)"))
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so command output stays on stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::from(2);
        }
    };

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let db_pool = db::init_pool(&config.database_url).await?;
    db::run_migrations(&db_pool).await?;
    let store = JobStore::new(db_pool, config.max_attempts);

    match command {
        Commands::Seed(args) => {
            let jobs = match (args.source.dir, args.source.manifest) {
                (Some(dir), _) => seed::jobs_from_dir(&dir, &args.extension).await?,
                (None, Some(manifest)) => seed::jobs_from_manifest(&manifest).await?,
                (None, None) => return Err("either --dir or --manifest is required".into()),
            };
            let inserted = store.seed(&jobs).await?;
            tracing::info!(found = jobs.len(), inserted, "Seeded jobs");
            println!("{inserted} new jobs ({} already present)", jobs.len() as u64 - inserted);
        }
        Commands::Status { json, list } => {
            let tally = store.tally().await?;
            let jobs = match list {
                Some(kind) => store.list(Some(kind), 1_000).await?,
                None => Vec::new(),
            };

            if json {
                let body = serde_json::json!({ "total": tally.total(), "tally": tally, "jobs": jobs });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                println!("unclaimed  {:>8}", tally.unclaimed);
                println!("claimed    {:>8}", tally.claimed);
                println!("success    {:>8}", tally.success);
                println!("failed     {:>8}", tally.failed);
                println!("total      {:>8}", tally.total());
                for job in &jobs {
                    print_job_line(job);
                }
            }
        }
        Commands::Show { id } => {
            let job = store.get(&id).await?;
            let claims = store.claim_history(&id).await?;
            let body = serde_json::json!({ "job": job, "claims": claims });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Reconcile => {
            let reclaimed = Reconciler::new(store, config.stale_claim_after())
                .run_once()
                .await?;
            println!("{} stale claims recovered", reclaimed.len());
            for job in &reclaimed {
                let next = if job.outcome.exhausted { "failed" } else { "unclaimed" };
                println!("  {} -> {next} (attempts {})", job.id, job.outcome.attempts);
            }
        }
        Commands::Reset(args) => match (args.job, args.failed) {
            (Some(id), _) => {
                store.reset_job(&id).await?;
                tracing::info!(job_id = %id, "Job reset");
                println!("{id} reset");
            }
            (None, true) => {
                let count = store.reset_failed().await?;
                tracing::info!(count, "Failed jobs reset");
                println!("{count} failed jobs reset");
            }
            (None, false) => return Err("either --job or --failed is required".into()),
        },
        Commands::Serve => serve(store, &config.bind_addr).await?,
    }
    Ok(())
}

fn print_job_line(job: &Job) {
    println!(
        "  {:<32} {:<10} attempts={} {}",
        job.id,
        job.status.kind().to_string(),
        job.attempts,
        job.claimed_by.as_ref().map(|w| w.as_str()).unwrap_or("")
    );
}

async fn serve(store: JobStore, bind_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    routes::metrics::describe_metrics();

    let app = routes::router(AppState::new(store, prometheus_handle));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("Status API listening on {}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
