//! Live statistics derived from the processing loop

use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Where the loop currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Starting,
    Running,
    Recovering,
    Stopped,
}

/// Snapshot published once per frame. Consumers receive this as-is; the transport
/// layer serializes it (JSON) without further shaping.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    /// Smoothed processing rate, frames per second.
    pub fps: f64,
    /// Good-match count per slot. Latest per-frame value, or running totals when
    /// the cumulative policy is enabled.
    pub matches: BTreeMap<String, u32>,
    /// Slots whose latest count cleared the detection threshold.
    pub detected: BTreeMap<String, bool>,
    /// Epoch seconds of the last publish.
    pub last_update: f64,
    /// Frames published since startup (including echoed skips).
    pub frames_total: u64,
    pub state: PipelineState,
    /// Terminal failure, when the loop had one.
    pub last_error: Option<String>,
    /// Process resident set in MB; `None` when the host offers no introspection.
    pub mem_mb: Option<f64>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            fps: 0.0,
            matches: BTreeMap::new(),
            detected: BTreeMap::new(),
            last_update: 0.0,
            frames_total: 0,
            state: PipelineState::Starting,
            last_error: None,
            mem_mb: None,
        }
    }
}

/// Current wall-clock in epoch seconds.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Exponentially smoothed frames-per-second over inter-frame intervals.
///
/// Takes explicit instants so the smoothing is testable without sleeping.
pub struct FpsEstimator {
    alpha: f64,
    last: Option<Instant>,
    fps: f64,
}

impl FpsEstimator {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.01, 1.0),
            last: None,
            fps: 0.0,
        }
    }

    /// Record one frame at `now` and return the smoothed rate.
    pub fn tick(&mut self, now: Instant) -> f64 {
        if let Some(last) = self.last {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let instant_fps = 1.0 / dt;
                self.fps = if self.fps == 0.0 {
                    instant_fps
                } else {
                    self.alpha * instant_fps + (1.0 - self.alpha) * self.fps
                };
            }
        }
        self.last = Some(now);
        self.fps
    }

    pub fn current(&self) -> f64 {
        self.fps
    }
}

/// Resident set size in MB from `/proc/self/statm`. `None` off Linux or when the
/// proc file is unreadable.
#[cfg(target_os = "linux")]
pub fn rss_mb() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let bytes = resident_pages * page_size::get() as u64;
    Some(bytes as f64 / (1024.0 * 1024.0))
}

#[cfg(not(target_os = "linux"))]
pub fn rss_mb() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fps_converges_on_steady_input() {
        let mut est = FpsEstimator::new(0.3);
        let t0 = Instant::now();
        // 20 frames at exactly 50ms spacing = 20 fps
        let mut fps = 0.0;
        for i in 0..20 {
            fps = est.tick(t0 + Duration::from_millis(50 * i));
        }
        assert!((fps - 20.0).abs() < 0.5, "fps = {fps}");
    }

    #[test]
    fn fps_smooths_jitter() {
        let mut est = FpsEstimator::new(0.2);
        let t0 = Instant::now();
        let mut t = t0;
        for i in 0..40 {
            // Alternate 40ms and 60ms gaps; average cadence is 20 fps
            t += Duration::from_millis(if i % 2 == 0 { 40 } else { 60 });
            est.tick(t);
        }
        let fps = est.current();
        assert!(fps > 15.0 && fps < 27.0, "fps = {fps}");
    }

    #[test]
    fn first_tick_reports_zero() {
        let mut est = FpsEstimator::new(0.3);
        assert_eq!(est.tick(Instant::now()), 0.0);
    }

    #[test]
    fn statistics_serialize_with_lowercase_state() {
        let stats = Statistics {
            state: PipelineState::Running,
            ..Statistics::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["state"], "running");
        assert!(json["mem_mb"].is_null());
    }
}
