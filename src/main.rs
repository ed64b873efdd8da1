//! feed-triage: one pipeline run per invocation.
//!
//! Exit status: 0 success, 2 partial success (gaps reported), 1 hard failure.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feed_triage::classify::{AnthropicService, ClassificationService, ClassifyMode};
use feed_triage::ingest::HttpTransport;
use feed_triage::{AppConfig, OutputStore, Pipeline, RunParams, RunStatus};

#[derive(Parser, Debug)]
#[command(name = "feed-triage")]
#[command(about = "Fetch, deduplicate, score and classify feed items")]
#[command(version)]
struct Args {
    /// Config file (defaults to config/pipeline.toml)
    #[arg(short, long, env = "FEED_TRIAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Lookback window in hours
    #[arg(long)]
    lookback_hours: Option<u64>,

    /// Maximum concurrent feed fetches
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Items per classification batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Plan batches but send no classification requests
    #[arg(long)]
    dry_run: bool,

    /// Classification mode: priority or stance
    #[arg(long, value_parser = parse_mode)]
    mode: Option<ClassifyMode>,

    /// Whole-run deadline in seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Prometheus listener, e.g. 0.0.0.0:9000
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

fn parse_mode(s: &str) -> Result<ClassifyMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "priority" => Ok(ClassifyMode::Priority),
        "stance" => Ok(ClassifyMode::Stance),
        other => Err(format!("unknown mode `{other}` (expected priority or stance)")),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("feed_triage=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() {
    // Load .env in local/dev; no-op when the file is absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let args = Args::parse();
    let status = match run(args).await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(target: "pipeline", error = %format!("{e:#}"), "run aborted");
            RunStatus::HardFailure
        }
    };
    std::process::exit(status.exit_code());
}

async fn run(args: Args) -> anyhow::Result<RunStatus> {
    if let Some(addr) = args.metrics_addr {
        feed_triage::metrics::install_exporter(addr)
            .with_context(|| format!("installing metrics exporter on {addr}"))?;
    }

    let cfg = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    let mut params = RunParams::from_config(&cfg);
    if let Some(h) = args.lookback_hours {
        params.set_lookback_hours(h)?;
    }
    if let Some(n) = args.max_concurrency {
        params.max_concurrency = n;
    }
    if let Some(n) = args.batch_size {
        params.batch_size = n;
    }
    if let Some(mode) = args.mode {
        params.mode = mode;
    }
    if let Some(secs) = args.deadline_secs {
        params.set_deadline_secs(secs)?;
    }
    params.dry_run |= args.dry_run;
    params.validate()?;

    let transport = Arc::new(HttpTransport::new(
        &cfg.fetch.user_agent,
        Duration::from_secs(cfg.fetch.timeout_secs),
    )?);
    let service: Option<Arc<dyn ClassificationService>> = if params.dry_run {
        None
    } else {
        let timeout = Duration::from_secs(cfg.classify.request_timeout_secs);
        Some(Arc::new(AnthropicService::new(&cfg.service, timeout)?))
    };

    let registry_path = cfg.run.registry_path.clone();
    let store_path = cfg.run.store_path.clone();
    let pipeline = Pipeline::new(cfg, transport, service)?;

    match pipeline.registry().load_health(&registry_path) {
        Ok(n) => tracing::debug!(target: "pipeline", restored = n, "source health restored"),
        Err(e) => tracing::warn!(target: "pipeline", error = %format!("{e:#}"), "source health not restored"),
    }

    let output = pipeline.run(&params, chrono::Utc::now()).await?;

    if let Err(e) = pipeline.registry().save_health(&registry_path) {
        tracing::warn!(target: "pipeline", error = %format!("{e:#}"), "source health not saved");
    }
    if !params.dry_run {
        let mut store = OutputStore::open(&store_path)?;
        store.replace(output.stored())?;
    }

    println!("{}", serde_json::to_string_pretty(&output.report)?);
    Ok(output.report.status)
}
