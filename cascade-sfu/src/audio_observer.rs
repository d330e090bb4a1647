//! Active-speaker detection from RTP audio levels.
//!
//! Publishers attach the ssrc-audio-level extension to audio packets; the
//! ingest path feeds the dBov values here. Once per interval the observer
//! ranks streams by how often and how loudly they crossed the threshold and
//! emits the ordered id list, suppressing repeats.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
struct StreamLevel {
    /// Sum of dBov values that crossed the threshold (lower = louder)
    accumulated_level: u64,
    /// How many samples crossed the threshold this interval
    active_count: u64,
}

/// Text sink for the emitted JSON payload (a DataChannel in production).
pub type AudioLevelSink = Box<dyn Fn(String) + Send + Sync>;

pub struct AudioObserver {
    threshold: u8,
    interval_ms: u64,
    expected: u64,
    streams: DashMap<String, StreamLevel>,
    previous: Mutex<Vec<String>>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AudioObserver {
    /// `threshold` is a dBov bound (0 = loudest, 127 = silence); `filter` is
    /// the percentage of an interval a stream must be active to be reported.
    pub fn new(threshold: u8, interval_ms: u64, filter: u8) -> Self {
        let expected = interval_ms * u64::from(filter) / 2000;
        Self {
            threshold: threshold.min(127),
            interval_ms,
            expected,
            streams: DashMap::new(),
            previous: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Build from a validated [`SfuConfig`](crate::config::SfuConfig).
    pub fn from_config(config: &crate::config::SfuConfig) -> Self {
        Self::new(
            config.audio_level_threshold,
            config.audio_level_interval_ms,
            config.audio_level_filter,
        )
    }

    pub fn expected_count(&self) -> u64 {
        self.expected
    }

    pub fn add_stream(&self, stream_id: &str) {
        self.streams
            .entry(stream_id.to_owned())
            .or_default();
    }

    pub fn remove_stream(&self, stream_id: &str) {
        self.streams.remove(stream_id);
    }

    /// Account one audio-level sample for a known stream.
    pub fn observe(&self, stream_id: &str, dbov: u8) {
        if dbov > self.threshold {
            return;
        }
        if let Some(mut entry) = self.streams.get_mut(stream_id) {
            entry.accumulated_level += u64::from(dbov);
            entry.active_count += 1;
        }
    }

    /// Rank and emit the active speakers for the elapsed interval.
    ///
    /// Streams sort by activity count (desc) then accumulated level (asc,
    /// lower dBov is louder); only streams active at least the expected
    /// number of samples qualify. Returns `None` when the ordered list did
    /// not change since the previous call. Counters reset either way.
    pub fn calc(&self) -> Option<Vec<String>> {
        let mut ranked: Vec<(String, u64, u64)> = Vec::new();
        for mut entry in self.streams.iter_mut() {
            let (count, level) = (entry.active_count, entry.accumulated_level);
            if count >= self.expected && count > 0 {
                ranked.push((entry.key().clone(), count, level));
            }
            entry.active_count = 0;
            entry.accumulated_level = 0;
        }
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        let ids: Vec<String> = ranked.into_iter().map(|(id, _, _)| id).collect();

        let mut previous = self.previous.lock();
        if *previous == ids {
            return None;
        }
        *previous = ids.clone();
        Some(ids)
    }

    /// Periodically compute and push `{"method":"audioLevels",...}` payloads.
    pub fn start(self: &std::sync::Arc<Self>, sink: AudioLevelSink) {
        let token = self.token.clone();
        let interval = Duration::from_millis(self.interval_ms);
        let observer = std::sync::Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(observer) = observer.upgrade() else { break };
                        if let Some(ids) = observer.calc() {
                            let payload = serde_json::json!({
                                "method": "audioLevels",
                                "params": ids,
                            });
                            sink(payload.to_string());
                        }
                    }
                }
            }
            debug!("audio observer stopped");
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for AudioObserver {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
