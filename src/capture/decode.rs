//! JPEG decode paths for captured frames and reference images

use crate::capture::frame::PixelBuffer;
use crate::error::{CaptureError, ReferenceError};

/// Decode one JPEG frame from a live stream into RGB24.
///
/// Uses zune-jpeg for the hot path; every captured frame goes through here.
/// Grayscale JPEGs are expanded to RGB so downstream stages see one format.
pub fn decode_stream_jpeg(data: &[u8]) -> Result<PixelBuffer, CaptureError> {
    let mut decoder = zune_jpeg::JpegDecoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| CaptureError::Decode(e.to_string()))?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| CaptureError::Decode("jpeg reports no dimensions".into()))?;
    let (width, height) = (width as u32, height as u32);
    let px_count = (width as usize) * (height as usize);

    let rgb = if pixels.len() == px_count * 3 {
        pixels
    } else if pixels.len() == px_count {
        // Luma-only stream: replicate into three channels
        let mut rgb = Vec::with_capacity(px_count * 3);
        for v in pixels {
            rgb.extend_from_slice(&[v, v, v]);
        }
        rgb
    } else {
        return Err(CaptureError::Decode(format!(
            "unexpected jpeg payload: {} bytes for {}x{}",
            pixels.len(),
            width,
            height
        )));
    };

    PixelBuffer::from_rgb(rgb, width, height)
        .ok_or_else(|| CaptureError::Decode("jpeg payload size mismatch".into()))
}

/// Decode reference-image bytes (any format the `image` crate knows) into RGB24.
pub fn decode_reference_bytes(data: &[u8]) -> Result<PixelBuffer, ReferenceError> {
    let img = image::load_from_memory(data)
        .map_err(|e| ReferenceError::InvalidImage(e.to_string()))?;
    Ok(PixelBuffer::from_dynamic(img))
}

/// Load a reference image from disk.
pub fn decode_reference_path(path: &std::path::Path) -> Result<PixelBuffer, ReferenceError> {
    let bytes = std::fs::read(path).map_err(|e| ReferenceError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    decode_reference_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_jpeg() -> Vec<u8> {
        // Encode a small gradient so both decoders have something real to chew on.
        let img = image::RgbImage::from_fn(16, 16, |x, y| {
            image::Rgb([(x * 16) as u8, (y * 16) as u8, 128])
        });
        let mut out = Vec::new();
        let mut enc = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90);
        enc.encode(img.as_raw(), 16, 16, image::ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn stream_decode_produces_rgb24() {
        let buf = decode_stream_jpeg(&tiny_jpeg()).unwrap();
        assert_eq!(buf.width, 16);
        assert_eq!(buf.height, 16);
        assert_eq!(buf.data.len(), 16 * 16 * 3);
    }

    #[test]
    fn stream_decode_rejects_garbage() {
        assert!(decode_stream_jpeg(&[0u8; 64]).is_err());
    }

    #[test]
    fn reference_decode_rejects_garbage() {
        let err = decode_reference_bytes(b"not an image").unwrap_err();
        assert!(matches!(err, ReferenceError::InvalidImage(_)));
    }

    #[test]
    fn reference_decode_accepts_jpeg() {
        let buf = decode_reference_bytes(&tiny_jpeg()).unwrap();
        assert_eq!((buf.width, buf.height), (16, 16));
    }
}
