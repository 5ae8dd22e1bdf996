//! Network MJPEG source: multipart JPEG streams over HTTP

use std::io::Read;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::capture::decode::decode_stream_jpeg;
use crate::capture::FrameSource;
use crate::capture::frame::Frame;
use crate::error::CaptureError;
use crate::SourceConfig;

/// Upper bound on one JPEG part; anything larger means a desynced stream.
const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

/// Frame source for `http(s)://` locators.
///
/// Endpoints replying `multipart/x-mixed-replace` are scanned for JPEG SOI/EOI
/// markers; plain JPEG endpoints are polled one snapshot per read.
pub struct MjpegSource {
    url: String,
    agent: ureq::Agent,
    stream: Option<Stream>,
    sequence: u64,
}

enum Stream {
    Multipart(PartReader),
    Snapshot,
}

impl MjpegSource {
    /// Connect to the stream. Fails with `SourceUnavailable` when the endpoint
    /// cannot be reached.
    pub fn open(url: &str, cfg: &SourceConfig) -> Result<Self, CaptureError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout_read(Duration::from_millis(cfg.read_timeout_ms))
            .build();
        let mut source = Self {
            url: url.to_string(),
            agent,
            stream: None,
            sequence: 0,
        };
        source.connect()?;
        Ok(source)
    }

    fn connect(&mut self) -> Result<(), CaptureError> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            info!(url = %self.url, "connected to multipart mjpeg stream");
            self.stream = Some(Stream::Multipart(PartReader::new(response.into_reader())));
        } else {
            info!(url = %self.url, content_type = %content_type, "endpoint is not multipart, polling snapshots");
            self.stream = Some(Stream::Snapshot);
        }
        Ok(())
    }

    fn next_jpeg(&mut self) -> Result<Vec<u8>, CaptureError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::SourceUnavailable("source is closed".into()))?;
        match stream {
            Stream::Multipart(reader) => reader.read_next_jpeg(),
            Stream::Snapshot => {
                let response = self
                    .agent
                    .get(&self.url)
                    .call()
                    .map_err(|e| map_transport_err(&e))?;
                let mut bytes = Vec::new();
                response
                    .into_reader()
                    .take(MAX_JPEG_BYTES as u64)
                    .read_to_end(&mut bytes)
                    .map_err(|e| map_io_err(&e))?;
                if bytes.is_empty() {
                    return Err(CaptureError::EndOfStream);
                }
                Ok(bytes)
            }
        }
    }
}

impl super::FrameSource for MjpegSource {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let jpeg = self.next_jpeg()?;
        let pixels = decode_stream_jpeg(&jpeg)?;
        self.sequence += 1;
        Ok(Frame {
            pixels,
            sequence: self.sequence,
            timestamp: Instant::now(),
        })
    }

    fn reopen(&mut self) -> Result<(), CaptureError> {
        warn!(url = %self.url, "reconnecting mjpeg source");
        self.stream = None;
        self.connect()
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(url = %self.url, "mjpeg source closed");
        }
    }
}

impl std::fmt::Debug for MjpegSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MjpegSource")
            .field("url", &self.url)
            .field("connected", &self.stream.is_some())
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Drop for MjpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Incremental multipart scanner. Parts are located by JPEG SOI/EOI markers so
/// boundary naming quirks across camera firmwares don't matter.
struct PartReader {
    reader: Box<dyn Read + Send + Sync + 'static>,
    buffer: Vec<u8>,
}

impl PartReader {
    fn new(reader: Box<dyn Read + Send + Sync + 'static>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>, CaptureError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let jpeg = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(jpeg);
            }

            let read = self.reader.read(&mut chunk).map_err(|e| map_io_err(&e))?;
            if read == 0 {
                return Err(CaptureError::EndOfStream);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            // Desync guard: drop everything but a tail that could still hold an SOI
            if self.buffer.len() > MAX_JPEG_BYTES {
                let drain = self.buffer.len() - 2;
                self.buffer.drain(..drain);
            }
        }
    }
}

/// Locate one complete JPEG (SOI `FFD8` .. EOI `FFD9`) in the buffer.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

fn map_io_err(e: &std::io::Error) -> CaptureError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => CaptureError::ReadTimeout,
        std::io::ErrorKind::UnexpectedEof => CaptureError::EndOfStream,
        _ => CaptureError::SourceUnavailable(e.to_string()),
    }
}

fn map_transport_err(e: &ureq::Error) -> CaptureError {
    match e {
        ureq::Error::Transport(t) => CaptureError::SourceUnavailable(t.to_string()),
        ureq::Error::Status(code, _) => {
            CaptureError::SourceUnavailable(format!("http status {code}"))
        }
    }
}
