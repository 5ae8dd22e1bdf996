//! Argus: reference-image detection over a live video stream

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use argus::capture;
use argus::error::PipelineError;
use argus::matcher::{FeatureExtractor, Matcher, OrbExtractor};
use argus::pipeline::{ProcessingLoop, SharedState, StatsReader};
use argus::reference::{reload_slots, ReferenceSet, ReloadSource};
use argus::stats::PipelineState;
use argus::{Config, ReferenceConfig, CONFIG};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "argus=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Argus launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    CONFIG.store(Arc::new(config.clone()));

    // Shared feature capability for templates and frames
    let extractor: Arc<dyn FeatureExtractor> =
        Arc::new(OrbExtractor::new(config.extractor.clone()));
    let references = Arc::new(ReferenceSet::new(Arc::clone(&extractor)));
    load_initial_references(&references, &config.references)?;

    // No detection without a capture source
    let source = capture::open(&config.source.locator, &config.source)
        .map_err(|e| PipelineError::Startup(format!("cannot open capture source: {e}")))?;
    info!(locator = %config.source.locator, "capture source opened");

    let shared = SharedState::new();
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut processing = ProcessingLoop::new(
        source,
        Arc::clone(&references),
        Matcher::new(extractor),
        Arc::clone(&shared),
        Arc::clone(&*CONFIG),
        stop_rx,
    );
    let mut pipeline_handle = tokio::task::spawn_blocking(move || processing.run());

    spawn_stats_logger(StatsReader::new(Arc::clone(&shared)));
    #[cfg(unix)]
    spawn_reload_on_sighup(Arc::clone(&references));

    // Run until ctrl-c or until the pipeline gives up on its source
    let joined = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            let _ = stop_tx.send(true);
            None
        }
        joined = &mut pipeline_handle => Some(joined),
    };
    let joined = match joined {
        Some(joined) => joined,
        // ctrl-c path: the loop drains its current read, then exits
        None => pipeline_handle.await,
    };
    joined??;

    info!("Argus shutting down");
    Ok(())
}

/// Load the configured reference slots. A `required` slot that fails is fatal;
/// everything else degrades to a warning and the slot stays empty.
fn load_initial_references(
    references: &ReferenceSet,
    entries: &[ReferenceConfig],
) -> Result<()> {
    let requests = entries
        .iter()
        .map(|e| (e.slot.clone(), ReloadSource::Path(e.path.clone())))
        .collect();
    let outcomes = reload_slots(references, requests);

    for (entry, outcome) in entries.iter().zip(&outcomes) {
        match &outcome.result {
            Ok(descriptors) => {
                info!(slot = %entry.slot, path = %entry.path.display(), descriptors, "reference loaded")
            }
            Err(e) if entry.required => {
                return Err(eyre!("required reference '{}' failed to load: {e}", entry.slot))
            }
            Err(e) => warn!(slot = %entry.slot, error = %e, "optional reference skipped"),
        }
    }
    Ok(())
}

/// One stats line per second, mirroring what `/stats` consumers see.
fn spawn_stats_logger(reader: StatsReader) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let stats = reader.snapshot();
            info!(
                fps = stats.fps,
                frames = stats.frames_total,
                matches = %serde_json::to_string(&stats.matches).unwrap_or_default(),
                state = ?stats.state,
                "stats"
            );
            if stats.state == PipelineState::Stopped {
                break;
            }
        }
    });
}

/// SIGHUP re-reads the configured reference images in place; the loop picks the
/// new templates up on its next snapshot without a restart.
#[cfg(unix)]
fn spawn_reload_on_sighup(references: Arc<ReferenceSet>) {
    tokio::spawn(async move {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "SIGHUP handler unavailable");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            let entries = CONFIG.load().references.clone();
            info!(slots = entries.len(), "SIGHUP: reloading references");
            let requests = entries
                .iter()
                .map(|e| (e.slot.clone(), ReloadSource::Path(e.path.clone())))
                .collect();
            for outcome in reload_slots(&references, requests) {
                match outcome.result {
                    Ok(descriptors) => {
                        info!(slot = %outcome.slot, descriptors, "reference reloaded")
                    }
                    Err(e) => warn!(slot = %outcome.slot, error = %e, "reload failed"),
                }
            }
        }
    });
}
