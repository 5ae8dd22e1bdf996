//! Local V4L2 camera capture (feature `local-camera`)

use std::time::Instant;

use tracing::{info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::decode::decode_stream_jpeg;
use crate::capture::frame::{Frame, PixelBuffer};
use crate::error::CaptureError;
use crate::SourceConfig;

/// Frame source for `/dev/videoN` and `device:N` locators.
///
/// Negotiates MJPEG when the device offers it, falling back to YUYV. Holds the
/// exclusive device handle until `close`.
pub struct V4l2Source {
    path: String,
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    fourcc: FourCC,
    width: u32,
    height: u32,
    buffer_count: u32,
    sequence: u64,
}

impl std::fmt::Debug for V4l2Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4l2Source")
            .field("path", &self.path)
            .field("open", &self.device.is_some())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("buffer_count", &self.buffer_count)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl V4l2Source {
    pub fn open(locator: &str, cfg: &SourceConfig) -> Result<Self, CaptureError> {
        let path = match locator.strip_prefix("device:") {
            Some(index) => format!("/dev/video{index}"),
            None => locator.to_string(),
        };
        let mut source = Self {
            path,
            device: None,
            stream: None,
            fourcc: FourCC::new(b"MJPG"),
            width: cfg.frame_width,
            height: cfg.frame_height,
            buffer_count: 4,
            sequence: 0,
        };
        source.connect()?;
        Ok(source)
    }

    fn connect(&mut self) -> Result<(), CaptureError> {
        let device = Device::with_path(&self.path)
            .map_err(|e| CaptureError::SourceUnavailable(format!("{}: {e}", self.path)))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?;
        info!(device = %self.path, card = %caps.card, driver = %caps.driver, "opened capture device");

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::SourceUnavailable(format!(
                "{} does not support video capture",
                self.path
            )));
        }

        self.fourcc = preferred_fourcc(&device)?;

        let mut fmt = device
            .format()
            .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?;
        fmt.width = self.width;
        fmt.height = self.height;
        fmt.fourcc = self.fourcc;
        let fmt = device
            .set_format(&fmt)
            .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?;
        self.width = fmt.width;
        self.height = fmt.height;

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, self.buffer_count)
            .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?;

        self.device = Some(device);
        self.stream = Some(stream);
        Ok(())
    }
}

impl super::FrameSource for V4l2Source {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let timestamp = Instant::now();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::SourceUnavailable("device is closed".into()))?;

        let (buf, _meta) = stream.next().map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                CaptureError::ReadTimeout
            }
            _ => CaptureError::SourceUnavailable(e.to_string()),
        })?;

        let pixels = if self.fourcc == FourCC::new(b"MJPG") {
            decode_stream_jpeg(buf)?
        } else {
            yuyv_to_rgb(buf, self.width, self.height)?
        };

        self.sequence += 1;
        Ok(Frame {
            pixels,
            sequence: self.sequence,
            timestamp,
        })
    }

    fn reopen(&mut self) -> Result<(), CaptureError> {
        warn!(device = %self.path, "reopening capture device");
        self.stream = None;
        self.device = None;
        self.connect()
    }

    fn close(&mut self) {
        self.stream = None;
        self.device = None;
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.close();
    }
}

/// Prefer MJPEG when the device offers it, otherwise YUYV.
fn preferred_fourcc(device: &Device) -> Result<FourCC, CaptureError> {
    let formats = device
        .enum_formats()
        .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?;
    let mut yuyv = false;
    for fmt in formats {
        if fmt.fourcc == FourCC::new(b"MJPG") {
            return Ok(fmt.fourcc);
        }
        if fmt.fourcc == FourCC::new(b"YUYV") {
            yuyv = true;
        }
    }
    if yuyv {
        Ok(FourCC::new(b"YUYV"))
    } else {
        Err(CaptureError::SourceUnavailable(
            "device offers neither MJPG nor YUYV".into(),
        ))
    }
}

/// YUYV 4:2:2 to RGB24.
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<PixelBuffer, CaptureError> {
    let expected = (width as usize) * (height as usize) * 2;
    if data.len() < expected {
        return Err(CaptureError::Decode(format!(
            "yuyv buffer too short: {} < {expected}",
            data.len()
        )));
    }
    let mut rgb = Vec::with_capacity((width as usize) * (height as usize) * 3);
    for quad in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        push_yuv(&mut rgb, y0, u, v);
        push_yuv(&mut rgb, y1, u, v);
    }
    PixelBuffer::from_rgb(rgb, width, height)
        .ok_or_else(|| CaptureError::Decode("yuyv conversion size mismatch".into()))
}

#[inline]
fn push_yuv(out: &mut Vec<u8>, y: u8, u: u8, v: u8) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    out.push(r.clamp(0, 255) as u8);
    out.push(g.clamp(0, 255) as u8);
    out.push(b.clamp(0, 255) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_conversion_produces_rgb24() {
        // Two pixels of mid-gray
        let data = [128u8, 128, 128, 128];
        let buf = yuyv_to_rgb(&data, 2, 1).unwrap();
        assert_eq!(buf.data.len(), 6);
        // Neutral chroma means all channels close together
        let px = &buf.data[..3];
        assert!(px.iter().all(|&c| (c as i32 - px[0] as i32).abs() <= 2));
    }

    #[test]
    fn yuyv_conversion_rejects_short_buffers() {
        assert!(yuyv_to_rgb(&[0u8; 4], 4, 4).is_err());
    }
}
