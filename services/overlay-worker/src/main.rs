//! Overlay worker.
//!
//! Runs one geography overlay job against FlatGeobuf sources and prints the
//! resulting report-card metrics as JSON on stdout. Logs go to stderr.

mod fetcher;
mod job;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use fgb_source::{FileRangeFetcher, HttpFetcherConfig, HttpRangeFetcher, SourceCache, SourceCacheConfig};
use overlay_engine::{parse_geography, DebugFeatureWriter, MetricSubject, OverlayHooks, TracingHooks};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use fetcher::SchemeFetcher;
use job::{JobFailure, OverlayJob};

#[derive(Parser, Debug)]
#[command(name = "overlay-worker")]
#[command(about = "Compute how much of a source falls inside a geography")]
struct Args {
    /// Geography JSON file, or `-` to read it from stdin
    #[arg(short, long, env = "OVERLAY_GEOGRAPHY")]
    geography: String,

    /// Base FlatGeobuf source URL or path
    #[arg(short, long, env = "OVERLAY_SOURCE_URL")]
    source: String,

    /// Source format of the base source
    #[arg(long, env = "OVERLAY_SOURCE_FORMAT", default_value = "FlatGeobuf")]
    source_format: String,

    /// Attribute used to classify base features
    #[arg(long, env = "OVERLAY_GROUP_BY")]
    group_by: Option<String>,

    /// Attributes to summarise per class (comma separated)
    #[arg(long, env = "OVERLAY_STATS_COLUMNS", value_delimiter = ',')]
    stats_columns: Vec<String>,

    /// Geography id reported as the metric subject
    #[arg(long, env = "OVERLAY_GEOGRAPHY_ID", default_value = "0")]
    geography_id: i64,

    /// Write every logged candidate feature to FlatGeobuf files here
    #[arg(long, env = "OVERLAY_DEBUG_DIR")]
    debug_dir: Option<PathBuf>,

    /// Resolve relative source paths against this directory
    #[arg(long, env = "OVERLAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(&args)?;

    info!(source = %args.source, geography = %args.geography, "Starting overlay worker");

    let geography = parse_geography(&read_geography(&args.geography)?)?;
    let cache = build_cache(&args)?;

    let job = OverlayJob {
        geography,
        source_url: args.source.clone(),
        source_format: args.source_format.clone(),
        group_by: args.group_by.clone(),
        stats_columns: args.stats_columns.clone(),
        subject: MetricSubject::geography(args.geography_id),
    };

    let cancellation = CancellationToken::new();
    let token = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling overlay");
            token.cancel();
        }
    });

    let debug_writer = args
        .debug_dir
        .as_ref()
        .map(|dir| DebugFeatureWriter::new(dir).with_delegate(Arc::new(TracingHooks)));
    let hooks: &dyn OverlayHooks = match &debug_writer {
        Some(writer) => writer,
        None => &TracingHooks,
    };

    let result = job.run(&cache, hooks, cancellation).await;

    if let Some(writer) = &debug_writer {
        let written = writer.finish();
        info!(files = written.len(), "Debug output written");
    }

    let stats = cache.range_cache_stats().await;
    info!(
        hits = stats.hits,
        misses = stats.misses,
        hit_rate = stats.hit_rate(),
        memory_bytes = stats.memory_bytes,
        "Range cache"
    );

    match result {
        Ok(metrics) => {
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, kind = e.kind(), "Overlay job failed");
            println!("{}", serde_json::to_string(&JobFailure::from(&e))?);
            Err(e.into())
        }
    }
}

fn init_tracing(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr);

    if args.json_logs {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

fn read_geography(path: &str) -> Result<String> {
    if path == "-" {
        let mut json = String::new();
        std::io::stdin()
            .read_to_string(&mut json)
            .context("failed to read geography from stdin")?;
        return Ok(json);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read geography {}", path))
}

fn build_cache(args: &Args) -> Result<SourceCache> {
    let cache_config = SourceCacheConfig::from_env();
    let http_config = HttpFetcherConfig::from_env();
    http_config
        .validate()
        .map_err(|e| anyhow!("invalid HTTP configuration: {}", e))?;

    let http = HttpRangeFetcher::new(http_config)
        .map_err(|e| anyhow!("failed to create HTTP client: {}", e))?;
    let file = match &args.data_dir {
        Some(dir) => FileRangeFetcher::with_root(dir),
        None => FileRangeFetcher::new(),
    };

    let cache = SourceCache::new(cache_config, Arc::new(SchemeFetcher::new(http, file)))?;
    Ok(cache)
}
