//! The continuously running capture/match/annotate/publish driver

pub mod shared;

pub use shared::{EncodedFrame, SharedState, StatsReader, StreamPublisher, STREAM_BOUNDARY};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::annotate::annotate;
use crate::capture::{Frame, FrameSource};
use crate::error::{CaptureError, PipelineError};
use crate::matcher::Matcher;
use crate::reference::ReferenceSet;
use crate::stats::{epoch_seconds, rss_mb, FpsEstimator, PipelineState, Statistics};
use crate::Config;

/// Owns the capture source end-to-end: the only reader of the source and the only
/// writer of SharedState. Runs on one dedicated blocking task.
pub struct ProcessingLoop {
    source: Box<dyn FrameSource>,
    references: Arc<ReferenceSet>,
    matcher: Matcher,
    shared: Arc<SharedState>,
    config: Arc<ArcSwap<Config>>,
    stop: watch::Receiver<bool>,

    state: PipelineState,
    fps: FpsEstimator,
    frames_total: u64,
    consecutive_failures: u32,
    last_encoded: Option<EncodedFrame>,
    latest_counts: BTreeMap<String, u32>,
    cumulative_counts: BTreeMap<String, u32>,
    detected: BTreeMap<String, bool>,
    last_error: Option<String>,
    /// Lifecycle trace, newest last. Diagnostic only.
    pub(crate) transitions: Vec<PipelineState>,
}

impl ProcessingLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        references: Arc<ReferenceSet>,
        matcher: Matcher,
        shared: Arc<SharedState>,
        config: Arc<ArcSwap<Config>>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let fps_alpha = config.load().pipeline.fps_alpha;
        Self {
            source,
            references,
            matcher,
            shared,
            config,
            stop,
            state: PipelineState::Starting,
            fps: FpsEstimator::new(fps_alpha),
            frames_total: 0,
            consecutive_failures: 0,
            last_encoded: None,
            latest_counts: BTreeMap::new(),
            cumulative_counts: BTreeMap::new(),
            detected: BTreeMap::new(),
            last_error: None,
            transitions: Vec::new(),
        }
    }

    /// Drive the loop until the stop signal flips or the source is lost for good.
    /// The capture handle is released on every exit path.
    pub fn run(&mut self) -> Result<(), PipelineError> {
        self.transition(PipelineState::Running);
        self.publish();

        let result = self.drive();

        self.transition(PipelineState::Stopped);
        self.publish();
        self.source.close();

        match &result {
            Ok(()) => info!(frames = self.frames_total, "processing loop stopped"),
            Err(e) => error!(error = %e, frames = self.frames_total, "processing loop failed"),
        }
        result
    }

    fn drive(&mut self) -> Result<(), PipelineError> {
        loop {
            if *self.stop.borrow() {
                return Ok(());
            }

            match self.source.read() {
                Ok(frame) => {
                    self.consecutive_failures = 0;
                    self.handle_frame(frame);
                }
                Err(e) => {
                    metrics::counter!("capture_timeouts").increment(1);
                    self.consecutive_failures += 1;
                    let max = self.config.load().pipeline.max_read_failures;
                    if matches!(e, CaptureError::SourceUnavailable(_))
                        || self.consecutive_failures >= max
                    {
                        self.recover(e)?;
                    }
                }
            }
        }
    }

    /// One captured frame: decimation decides between a full processing cycle and
    /// an echoed annotation; statistics refresh either way so the published rate
    /// follows the capture rate.
    fn handle_frame(&mut self, frame: Frame) {
        // load_full: the guard would otherwise be pinned across the whole cycle
        let cfg = self.config.load_full();
        let frame = if frame.pixels.width != cfg.source.frame_width
            || frame.pixels.height != cfg.source.frame_height
        {
            Frame {
                pixels: frame
                    .pixels
                    .resize(cfg.source.frame_width, cfg.source.frame_height),
                ..frame
            }
        } else {
            frame
        };

        self.frames_total += 1;
        self.fps.tick(frame.timestamp);

        let every = cfg.pipeline.process_every.max(1);
        let full_cycle = (self.frames_total - 1) % every == 0;

        if full_cycle {
            let snapshot = self.references.snapshot();
            let started = Instant::now();
            let matches = self
                .matcher
                .match_frame(&frame.pixels.to_gray(), &snapshot, &cfg.matching);
            metrics::histogram!("match_time_us").record(started.elapsed().as_micros() as f64);

            for (slot, result) in &matches.slots {
                let count = result.count() as u32;
                self.latest_counts.insert(slot.clone(), count);
                *self.cumulative_counts.entry(slot.clone()).or_insert(0) += count;
                self.detected.insert(slot.clone(), result.detected);
            }

            let started = Instant::now();
            match annotate(&frame, &matches, &cfg.annotate) {
                Ok(jpeg) => {
                    metrics::histogram!("annotate_time_us")
                        .record(started.elapsed().as_micros() as f64);
                    self.last_encoded = Some(EncodedFrame {
                        jpeg,
                        sequence: self.frames_total,
                    });
                    metrics::counter!("frames_processed").increment(1);
                    self.publish();
                }
                Err(e) => {
                    // Skip this cycle's publish; readers keep the previous tuple
                    metrics::counter!("encode_failures").increment(1);
                    warn!(error = %e, sequence = self.frames_total, "annotation encode failed");
                }
            }
        } else {
            // Echo the previous annotation under a fresh sequence so stream
            // clients still receive a part for this frame
            if let Some(last) = &self.last_encoded {
                self.last_encoded = Some(EncodedFrame {
                    jpeg: last.jpeg.clone(),
                    sequence: self.frames_total,
                });
            }
            metrics::counter!("frames_skipped").increment(1);
            self.publish();
        }
    }

    /// Bounded recovery: one reopen attempt, then the loop is done.
    fn recover(&mut self, cause: CaptureError) -> Result<(), PipelineError> {
        self.transition(PipelineState::Recovering);
        self.publish();

        match self.source.reopen() {
            Ok(()) => {
                info!("capture source reopened");
                self.consecutive_failures = 0;
                self.transition(PipelineState::Running);
                self.publish();
                Ok(())
            }
            Err(reopen_err) => {
                warn!(cause = %cause, error = %reopen_err, "reopen failed, stopping");
                self.last_error = Some(reopen_err.to_string());
                Err(PipelineError::SourceLost(reopen_err))
            }
        }
    }

    fn transition(&mut self, state: PipelineState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "pipeline state change");
        }
        self.state = state;
        self.transitions.push(state);
    }

    fn publish(&mut self) {
        let cumulative = self.config.load().pipeline.cumulative_counts;
        let matches = if cumulative {
            self.cumulative_counts.clone()
        } else {
            self.latest_counts.clone()
        };
        let stats = Statistics {
            fps: self.fps.current(),
            matches,
            detected: self.detected.clone(),
            last_update: epoch_seconds(),
            frames_total: self.frames_total,
            state: self.state,
            last_error: self.last_error.clone(),
            mem_mb: rss_mb(),
        };
        self.shared.publish(self.last_encoded.clone(), stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelBuffer;
    use crate::matcher::features::tests::noise_image;
    use crate::matcher::{FeatureExtractor, FeatureSet, OrbExtractor};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn gray_to_rgb(gray: &crate::capture::GrayBuffer) -> PixelBuffer {
        let mut rgb = Vec::with_capacity(gray.data.len() * 3);
        for &v in &gray.data {
            rgb.extend_from_slice(&[v, v, v]);
        }
        PixelBuffer::from_rgb(rgb, gray.width as u32, gray.height as u32).unwrap()
    }

    /// Source that plays a script of reads, then repeats the last entry forever.
    #[derive(Debug)]
    struct ScriptedSource {
        script: Vec<Result<(), CaptureError>>,
        cursor: usize,
        pixels: PixelBuffer,
        sequence: u64,
        reopen_ok: bool,
        closed: Arc<AtomicBool>,
    }

    impl FrameSource for ScriptedSource {
        fn read(&mut self) -> Result<Frame, CaptureError> {
            let step = self
                .script
                .get(self.cursor)
                .or_else(|| self.script.last())
                .cloned()
                .unwrap_or(Err(CaptureError::EndOfStream));
            self.cursor += 1;
            step.map(|()| {
                self.sequence += 1;
                Frame {
                    pixels: self.pixels.clone(),
                    sequence: self.sequence,
                    timestamp: Instant::now(),
                }
            })
        }

        fn reopen(&mut self) -> Result<(), CaptureError> {
            if self.reopen_ok {
                Ok(())
            } else {
                Err(CaptureError::SourceUnavailable("scripted refusal".into()))
            }
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Wraps the real extractor and counts invocations.
    struct CountingExtractor {
        inner: OrbExtractor,
        calls: Arc<AtomicUsize>,
    }

    impl FeatureExtractor for CountingExtractor {
        fn extract(&self, image: &crate::capture::GrayBuffer) -> FeatureSet {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.extract(image)
        }
    }

    struct Rig {
        pipeline: ProcessingLoop,
        shared: Arc<SharedState>,
        closed: Arc<AtomicBool>,
        extract_calls: Arc<AtomicUsize>,
        stop_tx: watch::Sender<bool>,
    }

    fn template_pixels() -> PixelBuffer {
        gray_to_rgb(&noise_image(160, 120, 42))
    }

    fn flat_pixels() -> PixelBuffer {
        PixelBuffer::from_rgb(vec![90u8; 64 * 48 * 3], 64, 48).unwrap()
    }

    fn rig(
        script: Vec<Result<(), CaptureError>>,
        reopen_ok: bool,
        frame_pixels: PixelBuffer,
        config: Config,
    ) -> Rig {
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor: Arc<dyn FeatureExtractor> = Arc::new(CountingExtractor {
            inner: OrbExtractor::default(),
            calls: Arc::clone(&calls),
        });
        let references = Arc::new(ReferenceSet::new(Arc::clone(&extractor)));
        references.load("logo1", template_pixels()).unwrap();
        calls.store(0, Ordering::SeqCst);

        let closed = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource {
            script,
            cursor: 0,
            pixels: frame_pixels,
            sequence: 0,
            reopen_ok,
            closed: Arc::clone(&closed),
        };
        let shared = SharedState::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let pipeline = ProcessingLoop::new(
            Box::new(source),
            references,
            Matcher::new(extractor),
            Arc::clone(&shared),
            Arc::new(ArcSwap::from_pointee(config)),
            stop_rx,
        );
        Rig {
            pipeline,
            shared,
            closed,
            extract_calls: calls,
            stop_tx,
        }
    }

    fn small_frame_config() -> Config {
        let mut config = Config::default();
        config.source.frame_width = 64;
        config.source.frame_height = 48;
        config
    }

    #[test]
    fn timeouts_drive_running_recovering_stopped() {
        let script = vec![Ok(()), Ok(()), Err(CaptureError::ReadTimeout)];
        let mut r = rig(script, false, flat_pixels(), small_frame_config());

        let result = r.pipeline.run();
        assert!(matches!(result, Err(PipelineError::SourceLost(_))));
        assert!(r.closed.load(Ordering::SeqCst), "source must be closed");
        assert_eq!(
            r.pipeline.transitions,
            vec![
                PipelineState::Running,
                PipelineState::Recovering,
                PipelineState::Stopped
            ]
        );

        // Readers still see the last valid statistics, now marked stopped
        let stats = r.shared.read_stats();
        assert_eq!(stats.state, PipelineState::Stopped);
        assert_eq!(stats.frames_total, 2);
        assert!(stats.last_error.is_some());
        assert!(stats.matches.contains_key("logo1"));
        assert!(r.shared.read_frame().is_some());
    }

    #[test]
    fn reopen_returns_loop_to_running() {
        // Three timeouts trip recovery; reopen succeeds and frames flow again
        let script = vec![
            Ok(()),
            Err(CaptureError::ReadTimeout),
            Err(CaptureError::ReadTimeout),
            Err(CaptureError::ReadTimeout),
            Ok(()),
            Ok(()),
        ];
        let mut r = rig(script, true, flat_pixels(), small_frame_config());

        let stop_tx = r.stop_tx;
        let frames_seen = Arc::clone(&r.extract_calls);
        let watcher = std::thread::spawn(move || {
            for _ in 0..400 {
                if frames_seen.load(Ordering::SeqCst) >= 3 {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            let _ = stop_tx.send(true);
        });

        let result = r.pipeline.run();
        watcher.join().unwrap();

        assert!(result.is_ok());
        assert!(r
            .pipeline
            .transitions
            .windows(2)
            .any(|w| w == [PipelineState::Recovering, PipelineState::Running]));
        let stats = r.shared.read_stats();
        assert_eq!(stats.state, PipelineState::Stopped);
        assert!(stats.last_error.is_none());
    }

    #[test]
    fn decimation_processes_every_other_frame_but_publishes_all() {
        let mut script = vec![Ok(()); 10];
        script.push(Err(CaptureError::EndOfStream));
        let mut config = small_frame_config();
        config.pipeline.process_every = 2;
        let mut r = rig(script, false, flat_pixels(), config);

        let _ = r.pipeline.run();

        // 10 frames in, 5 full matcher cycles (frames 1, 3, 5, 7, 9)
        assert_eq!(r.extract_calls.load(Ordering::SeqCst), 5);
        let stats = r.shared.read_stats();
        assert_eq!(stats.frames_total, 10);
        // The echoed annotation carries the newest sequence
        assert_eq!(r.shared.read_frame().unwrap().sequence, 10);
    }

    #[test]
    fn cooperative_stop_closes_the_source() {
        let script = vec![Ok(()); 100_000];
        let mut r = rig(script, false, flat_pixels(), small_frame_config());
        let stop_tx = r.stop_tx;
        let shared = Arc::clone(&r.shared);

        let watcher = std::thread::spawn(move || {
            for _ in 0..400 {
                if shared.read_stats().frames_total >= 3 {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            let _ = stop_tx.send(true);
        });

        let result = r.pipeline.run();
        watcher.join().unwrap();

        assert!(result.is_ok());
        assert!(r.closed.load(Ordering::SeqCst));
        assert_eq!(r.shared.read_stats().state, PipelineState::Stopped);
    }

    #[test]
    fn cumulative_policy_accumulates_counts() {
        // Frames identical to the template: every processed frame adds its full
        // good-match count to the running total
        let mut script = vec![Ok(()); 4];
        script.push(Err(CaptureError::EndOfStream));
        let mut config = Config::default();
        config.source.frame_width = 160;
        config.source.frame_height = 120;
        config.pipeline.cumulative_counts = true;
        let mut r = rig(script, false, template_pixels(), config);

        let _ = r.pipeline.run();

        let stats = r.shared.read_stats();
        let total = *stats.matches.get("logo1").unwrap();
        assert!(
            total >= 4 * 20,
            "four identity frames should accumulate well past the threshold, got {total}"
        );
        assert_eq!(stats.detected.get("logo1"), Some(&true));
    }

    #[test]
    fn latest_policy_reports_per_frame_counts() {
        let mut script = vec![Ok(()); 4];
        script.push(Err(CaptureError::EndOfStream));
        let mut config = Config::default();
        config.source.frame_width = 160;
        config.source.frame_height = 120;
        let mut r = rig(script, false, template_pixels(), config);

        let _ = r.pipeline.run();

        // Identity frames: latest count stays at the per-frame value, well under
        // any 4-frame accumulation
        let stats = r.shared.read_stats();
        let latest = *stats.matches.get("logo1").unwrap();
        let descriptors = 500u32; // extractor keypoint cap
        assert!(latest > 20 && latest <= descriptors);
    }
}
