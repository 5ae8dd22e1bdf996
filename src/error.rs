//! Error taxonomy shared across the pipeline

use thiserror::Error;

/// Capture-side failures. `ReadTimeout` and `EndOfStream` are transient and handled
/// by the processing loop's recovery path; `SourceUnavailable` is fatal once the
/// bounded reconnect budget is spent.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("capture source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("timed out waiting for a frame")]
    ReadTimeout,

    #[error("capture stream ended")]
    EndOfStream,

    #[error("failed to decode captured frame: {0}")]
    Decode(String),
}

/// Reference-template load failures. Both leave the previous template for the slot
/// untouched.
#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("could not decode reference image: {0}")]
    InvalidImage(String),

    #[error("reference image yielded no usable features")]
    FeatureExtractionFailed,

    #[error("could not read reference file {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// Annotation/encoding failures. A failed encode skips that cycle's publish and the
/// loop carries on.
#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("failed to encode annotated frame: {0}")]
    EncodingFailed(String),
}

/// Terminal pipeline outcomes reported to the supervising task.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline startup failed: {0}")]
    Startup(String),

    #[error("capture source lost: {0}")]
    SourceLost(#[from] CaptureError),
}
