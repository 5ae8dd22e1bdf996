use bytes::Bytes;
use std::time::Instant;

/// RGB24 pixel buffer shared by live frames and reference templates.
///
/// The data is immutable once built - annotation always works on a copy.
#[derive(Clone, Debug)]
pub struct PixelBuffer {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

impl PixelBuffer {
    /// Wrap an RGB24 byte vector. Returns `None` when the length does not match the
    /// dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Option<Self> {
        if data.len() != (width as usize) * (height as usize) * 3 {
            return None;
        }
        Some(Self {
            data: Bytes::from(data),
            width,
            height,
        })
    }

    /// Convert a decoded `image` buffer.
    pub fn from_dynamic(img: image::DynamicImage) -> Self {
        let rgb = img.into_rgb8();
        let (width, height) = rgb.dimensions();
        Self {
            data: Bytes::from(rgb.into_raw()),
            width,
            height,
        }
    }

    /// Grayscale projection for feature extraction (integer BT.601 luma).
    pub fn to_gray(&self) -> GrayBuffer {
        let mut gray = Vec::with_capacity((self.width * self.height) as usize);
        for px in self.data.chunks_exact(3) {
            let luma = (px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000;
            gray.push(luma as u8);
        }
        GrayBuffer {
            data: gray,
            width: self.width as usize,
            height: self.height as usize,
        }
    }

    /// Downscale to the given dimensions. No-op clone when already that size.
    pub fn resize(&self, width: u32, height: u32) -> Self {
        if self.width == width && self.height == height {
            return self.clone();
        }
        let src = image::RgbImage::from_raw(self.width, self.height, self.data.to_vec())
            .unwrap_or_else(|| image::RgbImage::new(self.width.max(1), self.height.max(1)));
        let resized =
            image::imageops::resize(&src, width, height, image::imageops::FilterType::Triangle);
        Self {
            data: Bytes::from(resized.into_raw()),
            width,
            height,
        }
    }
}

/// Single-channel 8-bit image used by the feature extractor.
pub struct GrayBuffer {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl GrayBuffer {
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }
}

/// One captured frame: immutable pixels plus capture bookkeeping.
#[derive(Clone)]
pub struct Frame {
    pub pixels: PixelBuffer,
    /// Monotonically increasing per-source sequence number.
    pub sequence: u64,
    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}
