//! Subscriber bandwidth estimation and layer allocation.
//!
//! Each subscriber owns a `BandwidthController`: a loss-based estimator
//! (optionally min-combined with an externally computed delay estimate), a
//! 500 ms allocation tick that splits the estimate across the subscriber's
//! simulcast tracks, and one `LayerSelector` per track to keep switches
//! honest about cooldowns.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::SfuConfig;
use crate::down_track::{DownTrack, DownTrackType};
use crate::util::monotonic_ms;

/// Fallback per-layer bitrates until live numbers are available.
const DEFAULT_LAYER_BITRATES: [u64; 3] = [150_000, 500_000, 2_500_000];
/// Allocation cadence.
const ALLOCATION_INTERVAL: Duration = Duration::from_millis(500);
/// Default per-track switch cooldown.
const SELECTOR_COOLDOWN_MS: u64 = 2_000;

/// Loss-driven bandwidth estimate, clamped into configured bounds.
#[derive(Debug)]
pub struct BandwidthEstimator {
    estimate: f64,
    min: f64,
    max: f64,
    delay_estimate: Option<f64>,
}

impl BandwidthEstimator {
    pub fn new(initial: u64, min: u64, max: u64) -> Self {
        Self {
            estimate: initial as f64,
            min: min as f64,
            max: max as f64,
            delay_estimate: None,
        }
    }

    /// Fold one observation window into the estimate.
    ///
    /// `loss` is a fraction in [0, 1]; `bytes_received` over `duration`
    /// floors the growth path so a healthy stream converges quickly.
    pub fn update(&mut self, bytes_received: u64, duration: Duration, loss: f64) -> u64 {
        let rate = if duration.as_secs_f64() > 0.0 {
            bytes_received as f64 * 8.0 / duration.as_secs_f64()
        } else {
            0.0
        };
        if loss > 0.10 {
            self.estimate *= 0.5;
        } else if loss > 0.02 {
            self.estimate *= 0.85;
        } else if loss < 0.01 {
            self.estimate = (self.estimate * 1.05).max(rate);
        }
        self.estimate = self.estimate.clamp(self.min, self.max);
        self.combined()
    }

    /// External delay-based estimate (from TWCC processing).
    pub fn set_delay_estimate(&mut self, bps: u64) {
        self.delay_estimate = Some(bps as f64);
    }

    /// Combined estimate: min of loss and delay paths, clamped.
    pub fn combined(&self) -> u64 {
        let combined = match self.delay_estimate {
            Some(delay) => self.estimate.min(delay),
            None => self.estimate,
        };
        combined.clamp(self.min, self.max) as u64
    }
}

/// Per-track switch state: what the allocator wants versus what the
/// receiver has committed, with a cooldown between transitions.
#[derive(Debug, Clone, Copy)]
pub struct LayerSelector {
    current: i32,
    target: i32,
    pending: bool,
    last_switch_ms: u64,
    cooldown_ms: u64,
}

impl LayerSelector {
    pub fn new(initial_layer: i32) -> Self {
        Self {
            current: initial_layer,
            target: initial_layer,
            pending: false,
            last_switch_ms: 0,
            cooldown_ms: SELECTOR_COOLDOWN_MS,
        }
    }

    pub fn with_cooldown(initial_layer: i32, cooldown_ms: u64) -> Self {
        Self {
            cooldown_ms,
            ..Self::new(initial_layer)
        }
    }

    pub fn current(&self) -> i32 {
        self.current
    }

    pub fn target(&self) -> i32 {
        self.target
    }

    pub fn needs_switch(&self) -> bool {
        self.pending && self.current != self.target
    }

    pub fn can_switch(&self, now_ms: u64) -> bool {
        self.last_switch_ms == 0
            || now_ms.saturating_sub(self.last_switch_ms) >= self.cooldown_ms
    }

    /// Register the allocator's wish without committing anything.
    pub fn request(&mut self, target: i32) {
        if target != self.current {
            self.target = target;
            self.pending = true;
        } else {
            self.target = target;
            self.pending = false;
        }
    }

    /// Commit the pending switch (called when the target layer produced a
    /// keyframe). Returns whether a switch happened.
    pub fn switch_to_target(&mut self, now_ms: u64) -> bool {
        if self.needs_switch() && self.can_switch(now_ms) {
            self.current = self.target;
            self.pending = false;
            self.last_switch_ms = now_ms;
            return true;
        }
        false
    }

    /// Immediate transition, used when the current layer disappears.
    pub fn force_switch(&mut self, layer: i32, now_ms: u64) {
        self.current = layer;
        self.target = layer;
        self.pending = false;
        self.last_switch_ms = now_ms;
    }
}

struct ControlledTrack {
    down_track: Arc<DownTrack>,
    selector: Arc<Mutex<LayerSelector>>,
    last_octets: u32,
}

type LayerChangeCallback = Box<dyn Fn(&str, i32) + Send + Sync>;

/// Drives target-layer selection for all simulcast tracks of one subscriber.
pub struct BandwidthController {
    estimator: Mutex<BandwidthEstimator>,
    tracks: Mutex<Vec<ControlledTrack>>,
    max_bandwidth: u64,
    on_layer_change: Mutex<Option<LayerChangeCallback>>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BandwidthController {
    pub fn new(config: &SfuConfig) -> Arc<Self> {
        Arc::new(Self {
            estimator: Mutex::new(BandwidthEstimator::new(
                config.twcc.initial_bitrate,
                config.twcc.min_bitrate,
                config.twcc.max_bitrate,
            )),
            tracks: Mutex::new(Vec::new()),
            max_bandwidth: config.max_bandwidth,
            on_layer_change: Mutex::new(None),
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    pub fn on_layer_change(&self, f: LayerChangeCallback) {
        *self.on_layer_change.lock() = Some(f);
    }

    /// Track a simulcast downtrack. The selector follows the receiver's
    /// committed switches through the downtrack's layer-change hook.
    pub fn add_track(&self, down_track: Arc<DownTrack>) {
        let selector = Arc::new(Mutex::new(LayerSelector::new(
            down_track.current_spatial_layer(),
        )));
        {
            let hooked = selector.clone();
            down_track.on_spatial_layer_change(Box::new(move |layer| {
                hooked.lock().force_switch(layer, monotonic_ms());
            }));
        }
        self.tracks.lock().push(ControlledTrack {
            down_track,
            selector,
            last_octets: 0,
        });
    }

    pub fn remove_track(&self, track_id: &str) {
        self.tracks
            .lock()
            .retain(|t| t.down_track.id() != track_id);
    }

    /// Feed the delay-based estimate computed from TWCC feedback.
    pub fn set_delay_estimate(&self, bps: u64) {
        self.estimator.lock().set_delay_estimate(bps);
    }

    pub fn estimate(&self) -> u64 {
        self.estimator.lock().combined()
    }

    /// Start the periodic allocation tick.
    pub fn start(self: &Arc<Self>) {
        let controller = Arc::downgrade(self);
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ALLOCATION_INTERVAL);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(c) = controller.upgrade() else { break };
                        c.allocate();
                    }
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    /// One allocation pass: refresh the estimate from observed loss and
    /// throughput, split the budget, and steer each track toward the highest
    /// layer its share affords.
    pub(crate) fn allocate(&self) {
        let mut tracks = self.tracks.lock();
        if tracks.is_empty() {
            return;
        }

        let mut worst_loss = 0u8;
        let mut delta_bytes = 0u64;
        for t in tracks.iter_mut() {
            worst_loss = worst_loss.max(t.down_track.fraction_lost());
            let octets = t.down_track.stats().octets_sent;
            delta_bytes += u64::from(octets.wrapping_sub(t.last_octets));
            t.last_octets = octets;
        }
        let loss = f64::from(worst_loss) / 255.0;
        let mut estimate = self
            .estimator
            .lock()
            .update(delta_bytes, ALLOCATION_INTERVAL, loss);
        if self.max_bandwidth > 0 {
            estimate = estimate.min(self.max_bandwidth);
        }

        let simulcast: Vec<&mut ControlledTrack> = tracks
            .iter_mut()
            .filter(|t| t.down_track.track_type() == DownTrackType::Simulcast)
            .collect();
        let count = simulcast.len() as u64;
        if count == 0 {
            return;
        }
        let budget = estimate / count;
        let now = monotonic_ms();

        for t in simulcast {
            let live = t.down_track.receiver_bitrates();
            let max_layer = t.down_track.max_spatial_layer().clamp(0, 2);
            let mut target = 0i32;
            for layer in 0..=max_layer {
                let typical = if live[layer as usize] > 0 {
                    live[layer as usize]
                } else {
                    DEFAULT_LAYER_BITRATES[layer as usize]
                };
                if typical <= budget {
                    target = layer;
                }
            }

            let current = t.down_track.current_spatial_layer();
            if target == current {
                continue;
            }
            let mut selector = t.selector.lock();
            if !selector.can_switch(now) {
                trace!(track_id = t.down_track.id(), target, "switch inside cooldown");
                continue;
            }
            match t.down_track.switch_spatial_layer(target, false) {
                Ok(()) => {
                    selector.request(target);
                    drop(selector);
                    debug!(
                        track_id = t.down_track.id(),
                        budget, target, "allocator requested layer change"
                    );
                    if let Some(f) = self.on_layer_change.lock().as_ref() {
                        f(t.down_track.id(), target);
                    }
                }
                Err(err) => {
                    trace!(track_id = t.down_track.id(), error = %err, "allocator switch rejected");
                }
            }
        }
    }
}

impl Drop for BandwidthController {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimator_halves_on_heavy_loss() {
        let mut e = BandwidthEstimator::new(1_000_000, 100_000, 10_000_000);
        let est = e.update(0, Duration::from_millis(500), 0.2);
        assert_eq!(est, 500_000);
    }

    #[test]
    fn estimator_decays_on_moderate_loss() {
        let mut e = BandwidthEstimator::new(1_000_000, 100_000, 10_000_000);
        let est = e.update(0, Duration::from_millis(500), 0.05);
        assert_eq!(est, 850_000);
    }

    #[test]
    fn estimator_grows_when_clean() {
        let mut e = BandwidthEstimator::new(1_000_000, 100_000, 10_000_000);
        let est = e.update(0, Duration::from_millis(500), 0.0);
        assert_eq!(est, 1_050_000);
    }

    #[test]
    fn estimator_holds_between_thresholds() {
        let mut e = BandwidthEstimator::new(1_000_000, 100_000, 10_000_000);
        let est = e.update(0, Duration::from_millis(500), 0.015);
        assert_eq!(est, 1_000_000);
    }

    #[test]
    fn estimator_clamps_to_bounds() {
        let mut e = BandwidthEstimator::new(150_000, 100_000, 10_000_000);
        for _ in 0..10 {
            e.update(0, Duration::from_millis(500), 0.5);
        }
        assert_eq!(e.combined(), 100_000);
    }

    #[test]
    fn combined_takes_min_with_delay_estimate() {
        let mut e = BandwidthEstimator::new(2_000_000, 100_000, 10_000_000);
        e.set_delay_estimate(900_000);
        assert_eq!(e.combined(), 900_000);
    }

    #[test]
    fn observed_rate_floors_growth() {
        let mut e = BandwidthEstimator::new(200_000, 100_000, 10_000_000);
        // 250 KB over 500 ms = 4 Mbps observed
        let est = e.update(250_000, Duration::from_millis(500), 0.0);
        assert_eq!(est, 4_000_000);
    }

    #[test]
    fn selector_respects_cooldown() {
        let mut s = LayerSelector::with_cooldown(0, 2_000);
        s.request(2);
        assert!(s.needs_switch());
        // first switch is allowed (no prior switch)
        assert!(s.switch_to_target(100));
        assert_eq!(s.current(), 2);

        s.request(1);
        assert!(!s.switch_to_target(1_000)); // inside cooldown
        assert!(s.switch_to_target(2_100));
        assert_eq!(s.current(), 1);
    }

    #[test]
    fn selector_force_switch_bypasses_cooldown() {
        let mut s = LayerSelector::with_cooldown(2, 2_000);
        s.request(1);
        s.switch_to_target(10);
        s.force_switch(0, 20);
        assert_eq!(s.current(), 0);
        assert!(!s.needs_switch());
    }

    #[test]
    fn selector_request_to_current_clears_pending() {
        let mut s = LayerSelector::new(1);
        s.request(2);
        assert!(s.needs_switch());
        s.request(1);
        assert!(!s.needs_switch());
    }
}
