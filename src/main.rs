use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vision_tagger::{
    app_state::AppState,
    config::AppConfig,
    models::image::ImageStatus,
    services::{
        manifest::{ManifestStore, Selection, MANIFEST_FILE_NAME},
        pipeline::Pipeline,
        stop::StopSignal,
        vision::VisionClient,
    },
};

/// Batch-caption image folders with a vision model and review the results
/// before exporting them as training captions.
#[derive(Parser, Debug)]
#[command(name = "vision-tagger", version)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Caption every pending image in a directory or manifest
    Run(RunArgs),

    /// Show the resolved API settings and send a test request
    CheckConfig,

    /// Create or update <DIR>/manifest.csv from the images in DIR
    Import { dir: PathBuf },

    /// Mark captions as approved for export
    Approve {
        manifest: PathBuf,
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Mark captions as rejected
    Reject {
        manifest: PathBuf,
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Write approved captions as .txt files
    Export {
        manifest: PathBuf,
        /// Directory for the .txt files (default: next to each image)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Print per-status totals
    Status { manifest: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Image directory, or an existing manifest .csv
    input: PathBuf,

    /// Caption prompt template
    #[arg(long)]
    prompt: String,

    /// Batches in flight at once (overrides CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Attempts per batch (overrides RETRY_MAX)
    #[arg(long)]
    retry: Option<u32>,

    /// Skip images that already have a caption
    #[arg(long)]
    skip_exist: bool,

    /// Start from an empty manifest instead of the existing one
    #[arg(long)]
    force_recreate: bool,

    /// Caption rejected images again
    #[arg(long)]
    regenerate_rejected: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    match execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "Command failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn execute(command: Command) -> Result<()> {
    match command {
        Command::Run(args) => run(args).await,
        Command::CheckConfig => check_config().await,
        Command::Import { dir } => import(&dir),
        Command::Approve { manifest, files } => review(&manifest, &files, ImageStatus::Approved),
        Command::Reject { manifest, files } => review(&manifest, &files, ImageStatus::Rejected),
        Command::Export {
            manifest,
            output_dir,
        } => export(&manifest, output_dir.as_deref()),
        Command::Status { manifest } => status(&manifest),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    if args.prompt.trim().is_empty() {
        bail!("--prompt must not be empty");
    }

    let config = AppConfig::from_env()
        .context("Failed to load configuration")?
        .with_overrides(args.concurrency, args.retry)?;
    if config.concurrency > 10 {
        tracing::warn!(
            concurrency = config.concurrency,
            "High concurrency is likely to hit API rate limits"
        );
    }
    let endpoint = config.endpoint()?;
    tracing::info!(
        provider = %endpoint.provider,
        model = %endpoint.model,
        concurrency = config.concurrency,
        retry_max = config.retry_max,
        "Configuration loaded"
    );

    let store = open_input(&args)?;
    let client = VisionClient::new(endpoint).context("Failed to build HTTP client")?;
    let state = AppState::from_config(&config, Arc::new(client), args.prompt);

    let stop = StopSignal::new();
    tokio::spawn(stop_on_ctrl_c(stop.clone()));

    let selection = Selection {
        skip_existing: args.skip_exist,
        regenerate_rejected: args.regenerate_rejected,
    };
    let (store, summary) = Pipeline::new(state, stop).run(store, selection).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    let counts = store.counts();
    tracing::info!(
        pending = counts.pending,
        approved = counts.approved,
        retrying = counts.retrying,
        "Manifest saved to {}",
        store.path().display()
    );
    Ok(())
}

/// Directory input: load (or recreate) its manifest and pick up new images.
/// CSV input: load it as is.
fn open_input(args: &RunArgs) -> Result<ManifestStore> {
    let input = &args.input;

    if input.is_dir() {
        let path = input.join(MANIFEST_FILE_NAME);
        let mut store = if args.force_recreate {
            tracing::info!(path = %path.display(), "Recreating manifest");
            ManifestStore::create(&path)
        } else {
            ManifestStore::open(&path)?
        };
        let imported = store.import_images()?;
        if imported > 0 || args.force_recreate {
            store.save()?;
        }
        return Ok(store);
    }

    let is_csv = input
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if input.is_file() && is_csv {
        return Ok(ManifestStore::open(input)?);
    }

    bail!(
        "Input must be an image directory or a manifest .csv: {}",
        input.display()
    )
}

async fn stop_on_ctrl_c(stop: StopSignal) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Interrupt received, finishing in-flight requests");
        stop.stop();
    }
}

async fn check_config() -> Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let endpoint = config.endpoint()?;

    tracing::info!(
        provider = %endpoint.provider,
        url = %endpoint.url,
        model = %endpoint.model,
        api_key = %endpoint.masked_key(),
        group_id = endpoint.group_id.as_deref().unwrap_or("-"),
        concurrency = config.concurrency,
        retry_max = config.retry_max,
        max_batch_size_bytes = config.max_batch_size_bytes,
        approval_policy = %config.approval_policy,
        "Resolved configuration"
    );

    let client = VisionClient::new(endpoint).context("Failed to build HTTP client")?;
    match client.check_connection().await {
        Ok(reply) => {
            let preview: String = reply.chars().take(100).collect();
            tracing::info!(reply = %preview, "API check succeeded");
            Ok(())
        }
        Err(failure) => bail!("API check failed ({}): {}", failure.kind, failure.message),
    }
}

fn import(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("Not a directory: {}", dir.display());
    }
    let mut store = ManifestStore::open(dir.join(MANIFEST_FILE_NAME))?;
    let imported = store.import_images()?;
    store.save()?;
    println!(
        "Imported {imported} new images into {} ({} total)",
        store.path().display(),
        store.len()
    );
    Ok(())
}

fn review(manifest: &Path, files: &[String], status: ImageStatus) -> Result<()> {
    let mut store = open_existing(manifest)?;
    for file in files {
        store
            .set_status(file, status)
            .with_context(|| format!("Cannot mark {file} as {status}"))?;
    }
    store.save()?;
    println!("Marked {} images as {status}", files.len());
    Ok(())
}

fn export(manifest: &Path, output_dir: Option<&Path>) -> Result<()> {
    let store = open_existing(manifest)?;
    let exported = store.export_txt(output_dir)?;
    println!("Exported {exported} caption files");
    Ok(())
}

fn status(manifest: &Path) -> Result<()> {
    let store = open_existing(manifest)?;
    println!("{}", serde_json::to_string_pretty(&store.counts())?);
    Ok(())
}

fn open_existing(manifest: &Path) -> Result<ManifestStore> {
    if !manifest.is_file() {
        bail!("Manifest not found: {}", manifest.display());
    }
    Ok(ManifestStore::open(manifest)?)
}
