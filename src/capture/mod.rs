//! Frame acquisition: source trait, locator dispatch, decode

pub mod decode;
pub mod frame;
pub mod mjpeg;
#[cfg(feature = "local-camera")]
pub mod v4l2;

pub use frame::{Frame, GrayBuffer, PixelBuffer};
pub use mjpeg::MjpegSource;
#[cfg(feature = "local-camera")]
pub use v4l2::V4l2Source;

use crate::error::CaptureError;
use crate::SourceConfig;

/// A sequential video feed. One exclusive reader; blocking reads with a bounded
/// timeout. Retry policy lives in the processing loop, never here.
pub trait FrameSource: Send + std::fmt::Debug {
    /// Read the next frame. Blocks up to the configured timeout.
    fn read(&mut self) -> Result<Frame, CaptureError>;

    /// One bounded reconnect attempt, used by the loop's recovery path.
    fn reopen(&mut self) -> Result<(), CaptureError>;

    /// Release the underlying handle. Idempotent; also run on drop.
    fn close(&mut self);
}

/// Open a source for the given locator.
///
/// `http(s)://...` selects the network MJPEG source; `/dev/videoN` or `device:N`
/// selects a local V4L2 camera (feature `local-camera`).
pub fn open(locator: &str, cfg: &SourceConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    if locator.starts_with("http://") || locator.starts_with("https://") {
        let source = MjpegSource::open(locator, cfg)?;
        return Ok(Box::new(source));
    }

    #[cfg(feature = "local-camera")]
    if locator.starts_with("/dev/") || locator.starts_with("device:") {
        let source = v4l2::V4l2Source::open(locator, cfg)?;
        return Ok(Box::new(source));
    }

    #[cfg(not(feature = "local-camera"))]
    if locator.starts_with("/dev/") || locator.starts_with("device:") {
        return Err(CaptureError::SourceUnavailable(format!(
            "{locator}: local cameras need the `local-camera` feature"
        )));
    }

    Err(CaptureError::SourceUnavailable(format!(
        "unrecognized source locator: {locator}"
    )))
}
