use extract_batch::{
    config::AppConfig,
    db,
    routes::metrics::describe_metrics,
    services::{
        chat_agent::ChatStreamConnector,
        completion::CompletionDetector,
        instructions,
        job_store::JobStore,
        output::OutputValidator,
        pool::WorkerPool,
        reconciler::Reconciler,
        retry::RetryController,
        sink::{JsonFileSink, ResultSink},
        worker::WorkerContext,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting extraction worker pool");

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker pool aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Prometheus exporter, with its own listener when METRICS_ADDR is set
    match &config.metrics_addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse()?;
            PrometheusBuilder::new().with_http_listener(addr).install()?;
            tracing::info!(%addr, "Serving Prometheus metrics");
        }
        None => {
            PrometheusBuilder::new().install_recorder()?;
        }
    }
    describe_metrics();

    tracing::info!(database_url = %config.database_url, "Opening job store");
    let db_pool = db::init_pool(&config.database_url).await?;
    db::run_migrations(&db_pool).await?;
    let store = JobStore::new(db_pool, config.max_attempts);

    let connector = ChatStreamConnector::new(
        &config.agent_base_url,
        &config.agent_api_key,
        &config.agent_model,
    )?;

    let sink: Option<Arc<dyn ResultSink>> = match &config.output_dir {
        Some(dir) => Some(Arc::new(JsonFileSink::new(dir.clone()).await?) as Arc<dyn ResultSink>),
        None => None,
    };

    let ctx = WorkerContext {
        store: store.clone(),
        connector: Arc::new(connector),
        detector: CompletionDetector::new(config.detector_config()),
        validator: OutputValidator::new(config.output_required_key.clone()),
        retry: RetryController::new(config.retry_policy()),
        instructions: instructions::load(config.instructions_file.as_deref()).await?,
        sink,
        config: config.worker_config(),
    };
    let reconciler = Reconciler::new(store.clone(), config.stale_claim_after());
    let pool = WorkerPool::new(ctx, reconciler, config.pool_settings());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping workers");
            on_signal.cancel();
        }
    });

    let report = pool.run(cancel).await?;
    let tally = store.tally().await?;

    tracing::info!(
        run_id = %report.run_id,
        jobs = report.jobs,
        completed = report.completed,
        attempts_failed = report.attempts_failed,
        gave_up = report.gave_up,
        claims_lost = report.claims_lost,
        reclaimed = report.reclaimed_at_start,
        unclaimed = tally.unclaimed,
        claimed = tally.claimed,
        success = tally.success,
        failed = tally.failed,
        "Run finished"
    );
    Ok(())
}
