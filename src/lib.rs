pub mod annotate;
pub mod capture;
pub mod error;
pub mod matcher;
pub mod pipeline;
pub mod reference;
pub mod stats;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::annotate::AnnotateConfig;
use crate::matcher::{ExtractorConfig, MatchConfig};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<Arc<ArcSwap<Config>>> =
    once_cell::sync::Lazy::new(|| Arc::new(ArcSwap::from_pointee(Config::default())));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub matching: MatchConfig,
    pub extractor: ExtractorConfig,
    pub annotate: AnnotateConfig,
    pub pipeline: PipelineConfig,
    pub references: Vec<ReferenceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// `http(s)://...` for network MJPEG streams, `/dev/videoN` or `device:N`
    /// for local cameras.
    pub locator: String,
    /// Frames are downscaled to this size before matching.
    pub frame_width: u32,
    pub frame_height: u32,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            locator: "http://192.168.1.16:8080/video".into(),
            frame_width: 320,
            frame_height: 240,
            connect_timeout_ms: 3_000,
            read_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run the full matcher cycle on every Nth frame; skipped frames echo the
    /// previous annotation so the stream stays smooth.
    pub process_every: u64,
    /// Consecutive failed reads before recovery kicks in.
    pub max_read_failures: u32,
    /// Report running totals instead of latest per-frame counts.
    pub cumulative_counts: bool,
    /// Smoothing factor for the fps estimate.
    pub fps_alpha: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            process_every: 1,
            max_read_failures: 3,
            cumulative_counts: false,
            fps_alpha: 0.2,
        }
    }
}

/// One reference slot loaded at startup and on SIGHUP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub slot: String,
    pub path: PathBuf,
    /// Startup fails when a required slot cannot load; optional slots are
    /// skipped with a warning.
    #[serde(default)]
    pub required: bool,
}

impl Config {
    /// Layered load: optional TOML file, then `ARGUS_*` environment overrides
    /// (double underscore as the section separator, e.g. `ARGUS_SOURCE__LOCATOR`).
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        } else {
            builder = builder.add_source(config::File::with_name("config/argus").required(false));
        }
        builder
            .add_source(
                config::Environment::with_prefix("ARGUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
