//! Scan a photo directory for faces and print every photo that has some.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Parser};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, fmt};

use face_gallery::config::Configuration;
use face_gallery::detection::DetectionEngine;
use face_gallery::detection::seetaface::RustfaceDetector;
use face_gallery::events::ProcessedImage;
use face_gallery::index::DirectoryIndex;
use face_gallery::permission::{PermissionGate, PermissionState, SharedPermissionGate};
use face_gallery::state::UiState;
use face_gallery::tasks::loader::ImageLoader;
use face_gallery::tasks::manager::ScanManager;
use face_gallery::tasks::pipeline::Pipeline;

#[derive(Debug, Parser)]
#[command(name = "face-gallery", about = "Find the photos in a library that contain faces")]
struct Args {
    /// Path to YAML config
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
    /// Only scan the configured selection, even with full access
    #[arg(long = "only-selection")]
    only_selection: bool,
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("face_gallery={level}").parse()?)
        .add_directive("rustface=warn".parse()?);
    fmt().with_env_filter(filter).with_target(false).compact().init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        config,
        only_selection,
        verbose,
    } = Args::parse();
    init_tracing(verbose)?;

    let cfg = Configuration::from_yaml_file(&config)
        .with_context(|| format!("failed to load configuration from {}", config.display()))?
        .validated()
        .context("invalid configuration values")?;
    tracing::debug!("loaded configuration from {}:\n{:#?}", config.display(), cfg);

    let gate = Arc::new(SharedPermissionGate::new(cfg.access));
    if !gate.current_state().has_access() {
        gate.request_access();
        bail!("photo access denied; set `access: granted` or `access: partial`");
    }
    if only_selection && cfg.access == PermissionState::Granted {
        info!("limiting scan to the configured selection");
    }

    let started = Instant::now();
    let index = Arc::new(
        DirectoryIndex::new(&cfg.photo_library_path).with_selection(cfg.selection.iter().cloned()),
    );
    let engine = Arc::new(DetectionEngine::init(&cfg.detector, RustfaceDetector::boxed));
    if engine.is_closed() {
        tracing::warn!("no face detector available; every photo will report zero faces");
    }
    let pipeline = Pipeline::new(index, ImageLoader::new(cfg.max_dimension), engine)
        .with_batch_size(cfg.batch_size);
    let manager = ScanManager::new(pipeline)
        .with_gate(gate)
        .with_pages_per_scan(cfg.pages_per_scan);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    let mut scan = manager
        .scan_images(true, only_selection)
        .ok_or_else(|| anyhow!("scan did not start"))?;
    let mut reported = 0usize;
    loop {
        select! {
            _ = cancel.cancelled() => break,
            joined = &mut scan => joined.context("scan task failed")?,
        }

        match manager.snapshot() {
            UiState::Error { message } => {
                manager.shutdown();
                bail!("scan failed: {message}");
            }
            UiState::Success { images, has_more } => {
                for image in &images[reported..] {
                    print_image(image);
                }
                reported = images.len();
                if !has_more {
                    break;
                }
                info!(
                    photos = reported,
                    cursor = manager.cursor().current_index,
                    "continuing scan"
                );
            }
            UiState::Initial | UiState::Loading => break,
        }

        scan = match manager.retry() {
            Some(scan) => scan,
            None => break,
        };
    }

    manager.shutdown();
    let elapsed = Duration::from_millis(started.elapsed().as_millis() as u64);
    info!(
        photos = reported,
        elapsed = %humantime::format_duration(elapsed),
        "scan complete"
    );
    Ok(())
}

fn print_image(image: &ProcessedImage) {
    println!(
        "{}\t{} face(s)\t{}x{}",
        image.photo.locator,
        image.face_count,
        image.raster.width(),
        image.raster.height()
    );
    for region in image.regions.iter().flatten() {
        let b = region.bounding_box;
        println!(
            "\t{}\t{:.0},{:.0} {:.0}x{:.0}\t{:.2}",
            region.id,
            b.left,
            b.top,
            b.width(),
            b.height(),
            region.confidence
        );
    }
}
