//! `Flowpool`
//!
//! `flowpool run` loads content containers, detects abbreviation candidates
//! on a pool of worker processes and uploads one reply per container.
//! `flowpool worker` is the entry point of those worker processes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::{Value, json};
use tracing::{info, warn};

use flowpool_core::config::load_config;
use flowpool_core::tracing_init::{init_tracing, init_worker_tracing};
use flowpool_core::WorkItem;
use flowpool_engine::builtin::{CapsRequest, CapsResponse};
use flowpool_engine::content::{CONTENTS_FIELD, ContentLoader, FsContentStore, OBJECTS_FIELD};
use flowpool_engine::handler::HandlerRegistry;
use flowpool_engine::launcher::{ProcessLauncher, WorkerLauncher};
use flowpool_engine::manager::ServiceContext;
use flowpool_engine::pipeline::{
    DataTransformer, Invocation, Meta, Param, Pipeline, PipelineStep, Processor, Shape, StepError,
};
use flowpool_engine::proxy::{Proxy, ProxyError};
use flowpool_engine::resource::{ResourceSettings, RunnableResource};
use flowpool_engine::worker::serve_stdio;

const CONTAINER: &str = "container";
const CAPS: &str = "caps";
const ABBREVIATIONS_FIELD: &str = "abbreviations";

#[derive(Parser, Debug)]
#[command(name = "flowpool")]
#[command(version, about = "Flowpool - worker-pool resources and pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Serve one resource worker over stdin/stdout. Spawned by the service.
    Worker {
        /// Log level filter for the worker (written to stderr).
        #[arg(long, default_value = "info", env = "FLOWPOOL_WORKER_LOG_LEVEL")]
        log_level: String,
    },
    /// Run the abbreviation pipeline over a JSON list of containers.
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON file holding a list of containers
    /// (`{"container_id": .., "objects": [{"bucket": .., "key": ..}]}`).
    #[arg(long)]
    input: PathBuf,

    /// Root directory of the content store (one sub-directory per bucket).
    #[arg(long, env = "FLOWPOOL_CONTENT_ROOT")]
    content_root: Option<PathBuf>,

    /// Bucket replies are uploaded to.
    #[arg(long, default_value = "replies", env = "FLOWPOOL_REPLY_BUCKET")]
    reply_bucket: String,

    /// Restrict detection to one script ("en" or "ru").
    #[arg(long)]
    language: Option<String>,

    /// Number of `caps` worker processes (overrides configuration).
    #[arg(long, env = "FLOWPOOL_CAPS_REPLICAS")]
    replicas: Option<usize>,

    /// Directory holding a `.flowpool/settings.json` project configuration.
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Log level filter (overrides configuration).
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "FLOWPOOL_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Worker { log_level } => {
            init_worker_tracing(&log_filter(&log_level));
            serve_stdio(&HandlerRegistry::builtin()).await?;
            Ok(())
        }
        Command::Run(args) => run(args).await,
    }
}

fn log_filter(level: &str) -> String {
    format!("flowpool={level},flowpool_engine={level},flowpool_core={level}")
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.project_dir.as_deref())?;
    if let Some(level) = args.log_level {
        config.service.log_level = level;
    }
    config.service.log_json |= args.log_json;
    init_tracing(&log_filter(&config.service.log_level), config.service.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        input = %args.input.display(),
        "Starting flowpool"
    );

    let mut transformer = DataTransformer::new();
    transformer.register_shape(
        Shape::new(CONTAINER)
            .require(OBJECTS_FIELD)
            .key_field("container_id"),
    );
    let service = ServiceContext::new(config).with_transformer(transformer);

    let raw = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let values: Vec<Value> = serde_json::from_str(&raw).context("Input must be a JSON list")?;
    let items = values
        .into_iter()
        .map(|value| service.transformer.from_value(value, CONTAINER))
        .collect::<Result<Vec<_>, _>>()?;

    let content_root = match args.content_root {
        Some(dir) => dir,
        None => default_content_root()?,
    };
    info!(root = %content_root.display(), "Using content store");
    let loader = ContentLoader::new(FsContentStore::new(content_root), &service.config.content);

    let launcher: Arc<dyn WorkerLauncher> = Arc::new(ProcessLauncher::current_exe()?);
    let mut settings = ResourceSettings::from_config(CAPS, CAPS, &service.config);
    if let Some(replicas) = args.replicas {
        settings = settings.with_replicas(replicas);
    }
    service
        .manager
        .register(RunnableResource::new(settings, launcher)?)
        .await?;
    service.manager.start().await;
    let proxy = service.manager.get_resource(CAPS).await?;

    let pipeline = build_pipeline(loader, proxy)
        .with_input_shape(CONTAINER)
        .with_transformer(Arc::clone(&service.transformer));
    let meta = Meta::new().with_global("reply_bucket", args.reply_bucket);
    if let Some(language) = args.language {
        meta.set_global("language", language);
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let outcome = tokio::select! {
        results = pipeline.start(items, Some(meta)) => Some(results),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            None
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            None
        }
    };

    for (name, report) in service.shutdown().await {
        info!(
            resource = %name,
            stop_messages = report.stop_messages,
            joined_workers = report.joined_workers,
            "Resource stopped"
        );
    }

    if let Some(results) = outcome {
        let failed = results.iter().filter(|item| !item.is_ok()).count();
        info!(items = results.len(), failed, "Pipeline finished");
        print_results(&results)?;
    }
    Ok(())
}

/// load -> detect -> upload.
fn build_pipeline(loader: ContentLoader<FsContentStore>, proxy: Proxy) -> Pipeline {
    let fetcher = loader.clone();
    let mut root = PipelineStep::new(Processor::stream(move |inv: Invocation| {
        fetcher.get_contents_stream(inv.items)
    }))
    .name("load");

    let detect_step = PipelineStep::new(Processor::future(move |inv: Invocation| {
        detect(proxy.clone(), inv)
    }))
    .name("detect")
    .param(Param::required(CONTENTS_FIELD))
    .param(Param::optional("language"));

    let upload_step = PipelineStep::new(Processor::future(move |inv: Invocation| {
        upload(loader.clone(), inv)
    }))
    .name("upload")
    .param(Param::required(ABBREVIATIONS_FIELD))
    .param(Param::required("reply_bucket"));

    root.add_branch(vec![detect_step, upload_step]);
    Pipeline::new(root)
}

async fn detect(proxy: Proxy, inv: Invocation) -> Result<WorkItem, StepError> {
    let item = inv.item()?.clone();
    let contents: Vec<String> = inv.args.get(CONTENTS_FIELD)?;
    let request = CapsRequest {
        text: contents.join("\n"),
        language: inv.args.opt("language")?,
    };
    match proxy.request::<_, CapsResponse>(&request).await {
        Ok(response) => Ok(item.with_field(ABBREVIATIONS_FIELD, response.candidates)),
        Err(e @ ProxyError::Handling { .. }) => {
            warn!(key = %item.key(), error = %e, "Detection rejected");
            Ok(item.with_status(e.status()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn upload(loader: ContentLoader<FsContentStore>, inv: Invocation) -> Result<WorkItem, StepError> {
    let item = inv.item()?.clone();
    let abbreviations: Vec<String> = inv.args.get(ABBREVIATIONS_FIELD)?;
    let bucket: String = inv.args.get("reply_bucket")?;

    let body = serde_json::to_vec(&json!({
        "container_id": item.key(),
        "abbreviations": abbreviations,
    }))
    .map_err(|e| StepError::Failed(e.to_string()))?;
    let length = body.len();
    let descriptor = loader
        .put_content(&format!("{}.json", item.key()), body, &bucket, length, "application/json")
        .await;

    if !descriptor.is_ok() {
        return Ok(item.with_status(descriptor.status().clone()));
    }
    Ok(item.with_field("reply", Value::Object(descriptor.fields().clone())))
}

#[allow(clippy::print_stdout)]
fn print_results(results: &[WorkItem]) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(results)?);
    Ok(())
}

/// Default content root: the platform data directory, e.g. ~/.local/share/flowpool/content
fn default_content_root() -> anyhow::Result<PathBuf> {
    let data = dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine data directory"))?;
    Ok(data.join("flowpool").join("content"))
}
