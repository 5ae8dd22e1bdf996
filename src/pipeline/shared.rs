//! Single-writer, many-reader exchange point for the latest frame and stats

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::watch;

use crate::stats::Statistics;

/// One encoded output frame.
#[derive(Clone)]
pub struct EncodedFrame {
    pub jpeg: Bytes,
    pub sequence: u64,
}

/// The (frame, stats) tuple, replaced wholesale on every publish so readers can
/// never see half of an update.
pub struct Published {
    pub frame: Option<EncodedFrame>,
    pub stats: Statistics,
}

/// Latest-value exchange between the processing loop and its readers.
///
/// Overwrite semantics, no queue: a slow reader observes whatever is current when
/// it gets around to looking, and never slows the writer beyond one atomic store.
pub struct SharedState {
    latest: ArcSwapOption<Published>,
    publish_tx: watch::Sender<u64>,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        let (publish_tx, _) = watch::channel(0);
        Arc::new(Self {
            latest: ArcSwapOption::from(None),
            publish_tx,
        })
    }

    /// Replace the current tuple. Single writer: the processing loop.
    pub fn publish(&self, frame: Option<EncodedFrame>, stats: Statistics) {
        let sequence = stats.frames_total;
        self.latest.store(Some(Arc::new(Published { frame, stats })));
        // Waiters wake on the sequence bump; send errors just mean no readers yet
        self.publish_tx.send_replace(sequence);
    }

    /// Latest encoded frame, if any cycle has published one.
    pub fn read_frame(&self) -> Option<EncodedFrame> {
        self.latest.load().as_ref()?.frame.clone()
    }

    /// Latest statistics; defaults before the first publish.
    pub fn read_stats(&self) -> Statistics {
        match self.latest.load().as_ref() {
            Some(published) => published.stats.clone(),
            None => Statistics::default(),
        }
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.publish_tx.subscribe()
    }
}

/// Read-only stats view handed to the transport layer.
#[derive(Clone)]
pub struct StatsReader {
    shared: Arc<SharedState>,
}

impl StatsReader {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    pub fn snapshot(&self) -> Statistics {
        self.shared.read_stats()
    }
}

/// Multipart boundary used by the published stream.
pub const STREAM_BOUNDARY: &str = "frame";

/// Per-client stream view: yields one boundary-delimited JPEG part per publish.
///
/// Each client owns its receiver, so pacing is independent; a stalled client
/// simply skips ahead to the newest frame when it resumes.
pub struct StreamPublisher {
    shared: Arc<SharedState>,
    publish_rx: watch::Receiver<u64>,
    last_sequence: Option<u64>,
}

impl StreamPublisher {
    pub fn new(shared: Arc<SharedState>) -> Self {
        let publish_rx = shared.subscribe();
        Self {
            shared,
            publish_rx,
            last_sequence: None,
        }
    }

    /// Wait for a frame this client has not sent yet and frame it as one
    /// multipart part. Returns `None` when the producer is gone for good.
    pub async fn next_part(&mut self) -> Option<Bytes> {
        loop {
            if let Some(frame) = self.shared.read_frame() {
                if self.last_sequence != Some(frame.sequence) {
                    self.last_sequence = Some(frame.sequence);
                    return Some(encode_part(&frame));
                }
            }
            if self.publish_rx.changed().await.is_err() {
                // Producer dropped; emit the final frame if it was never sent
                let frame = self.shared.read_frame()?;
                if self.last_sequence != Some(frame.sequence) {
                    self.last_sequence = Some(frame.sequence);
                    return Some(encode_part(&frame));
                }
                return None;
            }
        }
    }

    /// Non-blocking variant for transports that poll on their own clock.
    pub fn latest_part(&mut self) -> Option<Bytes> {
        let frame = self.shared.read_frame()?;
        self.last_sequence = Some(frame.sequence);
        Some(encode_part(&frame))
    }
}

/// `--<boundary>` framing with per-part headers, one JPEG per part.
fn encode_part(frame: &EncodedFrame) -> Bytes {
    let mut part = BytesMut::with_capacity(frame.jpeg.len() + 96);
    part.put_slice(b"--");
    part.put_slice(STREAM_BOUNDARY.as_bytes());
    part.put_slice(b"\r\nContent-Type: image/jpeg\r\n");
    part.put_slice(format!("Content-Length: {}\r\n\r\n", frame.jpeg.len()).as_bytes());
    part.put_slice(&frame.jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::PipelineState;

    fn stats_n(n: u64) -> Statistics {
        Statistics {
            frames_total: n,
            fps: n as f64,
            ..Statistics::default()
        }
    }

    fn frame_n(n: u64) -> EncodedFrame {
        EncodedFrame {
            jpeg: Bytes::from(vec![n as u8; 16]),
            sequence: n,
        }
    }

    #[test]
    fn empty_state_reads_defaults() {
        let shared = SharedState::new();
        assert!(shared.read_frame().is_none());
        let stats = shared.read_stats();
        assert_eq!(stats.state, PipelineState::Starting);
        assert_eq!(stats.frames_total, 0);
    }

    #[test]
    fn publish_overwrites_never_queues() {
        let shared = SharedState::new();
        for n in 1..=5 {
            shared.publish(Some(frame_n(n)), stats_n(n));
        }
        assert_eq!(shared.read_frame().unwrap().sequence, 5);
        assert_eq!(shared.read_stats().frames_total, 5);
    }

    #[test]
    fn readers_never_see_a_torn_tuple() {
        let shared = SharedState::new();
        shared.publish(Some(frame_n(0)), stats_n(0));

        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                for n in 1..=500u64 {
                    shared.publish(Some(frame_n(n)), stats_n(n));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    let mut last_seen = 0;
                    for _ in 0..500 {
                        let published = shared.latest.load();
                        let tuple = published.as_ref().unwrap();
                        // The swapped tuple must be internally consistent
                        assert_eq!(
                            tuple.frame.as_ref().unwrap().sequence,
                            tuple.stats.frames_total,
                            "torn publish observed"
                        );
                        // Monotonic: overwrite semantics never go backwards
                        assert!(tuple.stats.frames_total >= last_seen);
                        last_seen = tuple.stats.frames_total;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }

        // Final tuple is internally consistent
        let stats = shared.read_stats();
        let frame = shared.read_frame().unwrap();
        assert_eq!(frame.sequence, stats.frames_total);
    }

    #[test]
    fn multipart_part_is_well_formed() {
        let frame = EncodedFrame {
            jpeg: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
            sequence: 1,
        };
        let part = encode_part(&frame);
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-Length: 4\r\n\r\n"));
        assert!(part.ends_with(b"\xFF\xD9\r\n"));
    }

    #[tokio::test]
    async fn publisher_yields_each_new_frame_once() {
        let shared = SharedState::new();
        let mut publisher = StreamPublisher::new(Arc::clone(&shared));

        shared.publish(Some(frame_n(1)), stats_n(1));
        let part = publisher.next_part().await.unwrap();
        assert!(!part.is_empty());

        // No new publish yet: next_part waits until one arrives
        let shared_bg = Arc::clone(&shared);
        let waiter = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            shared_bg.publish(Some(frame_n(2)), stats_n(2));
        });
        let part = publisher.next_part().await.unwrap();
        assert!(!part.is_empty());
        waiter.await.unwrap();
        assert_eq!(publisher.last_sequence, Some(2));
    }

    #[tokio::test]
    async fn slow_reader_skips_to_latest() {
        let shared = SharedState::new();
        let mut publisher = StreamPublisher::new(Arc::clone(&shared));

        for n in 1..=10 {
            shared.publish(Some(frame_n(n)), stats_n(n));
        }
        // A reader that slept through 10 publishes sees only the newest
        publisher.next_part().await.unwrap();
        assert_eq!(publisher.last_sequence, Some(10));
    }
}
