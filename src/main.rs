use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use restor::config::AppConfig;
use restor::context::HelperContext;
use restor::core::{
    CacheOutcome, Catalog, Disk, Image, ImageCache, ImagingSession, ImagingStage, ImagingToolType,
    download_image,
};
use restor::logging::{self, LogConfig};
use restor::rpc::{HelperClient, HelperServer};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "restor")]
#[command(about = "Fetch, verify and apply disk images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to $RESTOR_CONFIG or /etc/restor/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the privileged imaging helper
    Helper,
    /// Check the image cache against the catalog
    Validate,
    /// Download an image into the cache
    Download { name: String },
    /// Write a cached image onto a disk through the helper
    Apply { name: String, disk: String },
    /// Show the helper's version
    Version,
    /// Show the helper's live sessions
    Status,
}

#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    cache_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    catalog_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    socket_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    imaging_tool: Option<ImagingToolType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verify_images: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    post_script: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load(path, Some(&cli.overrides)),
        None => AppConfig::new(Some(&cli.overrides)),
    }
    .context("Failed to load configuration")?;

    logging::init(LogConfig::from(&config))?;

    match &cli.command {
        Commands::Helper => run_helper(config).await.context("Helper failed")?,
        Commands::Validate => run_validate(&config)
            .await
            .context("Failed to validate the image cache")?,
        Commands::Download { name } => run_download(&config, name)
            .await
            .with_context(|| format!("Failed to download {}", name))?,
        Commands::Apply { name, disk } => run_apply(&config, name, disk)
            .await
            .with_context(|| format!("Failed to apply {} to {}", name, disk))?,
        Commands::Version => run_version(&config)
            .await
            .context("Failed to query the helper")?,
        Commands::Status => run_status(&config)
            .await
            .context("Failed to check status of the helper")?,
    }

    Ok(())
}

async fn run_helper(config: AppConfig) -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        warn!("Helper is not running as root; writing to disks will probably fail");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tool = ?config.imaging_tool,
        "Starting imaging helper"
    );

    let ctx = HelperContext::new(config).context("Failed to load the helper catalog")?;
    info!(images = ctx.catalog.len(), "Catalog loaded");
    let server = HelperServer::new(ctx);
    tokio::select! {
        result = server.start() => result,
        _ = tokio::signal::ctrl_c() => {
            server.shutdown();
            Ok(())
        }
    }
}

fn load_catalog(config: &AppConfig) -> Result<Catalog> {
    Catalog::load(&config.catalog_path)
        .with_context(|| format!("Failed to load catalog {}", config.catalog_path.display()))
}

fn find_image<'a>(catalog: &'a Catalog, name: &str) -> Result<&'a Image> {
    catalog
        .get(name)
        .ok_or_else(|| anyhow!("No image named {:?} in the catalog", name))
}

async fn run_validate(config: &AppConfig) -> Result<()> {
    let catalog = load_catalog(config)?;
    let cache = ImageCache::new(&config.cache_directory);
    let report = cache.validate(&catalog).await?;

    for (name, outcome) in &report.entries {
        match outcome {
            CacheOutcome::Cached(path) => println!("{:<24} cached     {}", name, path),
            CacheOutcome::Missing => println!("{:<24} missing", name),
            CacheOutcome::Corrupt => println!("{:<24} corrupt    (removed)", name),
            CacheOutcome::Unreadable(reason) => println!("{:<24} unreadable {}", name, reason),
        }
    }
    for orphan in &report.removed_orphans {
        println!("removed orphan {}", orphan.display());
    }
    println!(
        "{} of {} images cached",
        report.cached_count(),
        report.entries.len()
    );

    Ok(())
}

async fn run_download(config: &AppConfig, name: &str) -> Result<()> {
    let catalog = load_catalog(config)?;
    let image = find_image(&catalog, name)?;
    let cache = ImageCache::new(&config.cache_directory);

    let mut last_decile = None;
    let path = download_image(&cache, image, |received, total| {
        if let Some(total) = total.filter(|t| *t > 0) {
            let decile = received * 10 / total;
            if last_decile != Some(decile) {
                println!("{}: {}%", image.name, decile * 10);
                last_decile = Some(decile);
            }
        }
    })
    .await?;

    println!("{} downloaded to {}", image.name, path);
    Ok(())
}

async fn run_apply(config: &AppConfig, name: &str, disk: &str) -> Result<()> {
    let catalog = load_catalog(config)?;
    let image = find_image(&catalog, name)?;

    let cache = ImageCache::new(&config.cache_directory);
    let report = cache.validate(&catalog).await?;
    let source = report
        .local_path(name)
        .cloned()
        .ok_or_else(|| anyhow!("{} is not cached; run `restor download {}` first", name, name))?;

    let session = ImagingSession::new(
        image.clone(),
        source,
        Disk::new(disk),
        HelperClient::new(&config.socket_path),
    );
    let mut updates = session.subscribe();
    session.begin()?;

    let mut shown = (ImagingStage::NotStarted, 0);
    loop {
        let snapshot = updates.borrow_and_update().clone();
        if (snapshot.stage, snapshot.percent_complete) != shown {
            match snapshot.stage {
                ImagingStage::Imaging | ImagingStage::Verifying => {
                    println!("{} {}%", snapshot.stage, snapshot.percent_complete)
                }
                stage if stage.is_active() => println!("{}", stage),
                _ => {}
            }
            shown = (snapshot.stage, snapshot.percent_complete);
        }

        match snapshot.stage {
            ImagingStage::Complete => {
                println!("{} applied to {}", name, disk);
                return Ok(());
            }
            ImagingStage::Error => {
                let error = snapshot
                    .last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                bail!(error);
            }
            _ => {}
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    bail!("Imaging session ended unexpectedly");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Cancelling...");
                session.cancel();
            }
        }
    }
}

async fn run_version(config: &AppConfig) -> Result<()> {
    let info = HelperClient::new(&config.socket_path).version().await?;
    println!("restor {}", env!("CARGO_PKG_VERSION"));
    println!("helper {} (protocol {})", info.version, info.protocol);
    Ok(())
}

async fn run_status(config: &AppConfig) -> Result<()> {
    let status = HelperClient::new(&config.socket_path).status().await?;

    println!("Helper {} up {}s", status.version, status.uptime_secs);
    println!("Imaging tool: {:?}", status.imaging_tool);
    println!("Active sessions: {}", status.active_sessions);
    for (id, session) in &status.sessions {
        println!(
            "  {}  {} -> {}  {} {}%  since {}",
            id,
            session.image,
            session.disk,
            session.stage,
            session.percent,
            session.started_at.format("%H:%M:%S")
        );
    }
    Ok(())
}
