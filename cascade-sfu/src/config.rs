//! SFU configuration

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the media routing core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Advisory outbound bandwidth cap per subscriber (bps, 0 = unlimited)
    pub max_bandwidth: u64,
    /// Ring size for the packet buffer and sequencer
    pub max_packet_track: usize,
    /// Interval between active-speaker computations (ms)
    pub audio_level_interval_ms: u64,
    /// dBov threshold below which a sample counts as speech (0-127)
    pub audio_level_threshold: u8,
    /// Fraction of an interval a stream must be active to be reported (0-100)
    pub audio_level_filter: u8,
    /// Allow a peer to subscribe to its own published tracks
    pub allow_self_subscribe: bool,
    /// Simulcast behavior
    pub simulcast: SimulcastConfig,
    /// Transport-wide congestion control
    pub twcc: TwccConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulcastConfig {
    /// New subscribers start on the highest available layer instead of the lowest
    pub best_quality_first: bool,
    /// Rewrite VP8 temporal scalability fields and gate by temporal layer
    pub enable_temporal_layer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwccConfig {
    /// Starting estimate for the subscriber bandwidth controller (bps)
    pub initial_bitrate: u64,
    /// Lower clamp for the estimate (bps)
    pub min_bitrate: u64,
    /// Upper clamp for the estimate (bps)
    pub max_bitrate: u64,
    /// How often transport-wide feedback is flushed to the publisher (ms)
    pub feedback_interval_ms: u64,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_bandwidth: 0,
            max_packet_track: 500,
            audio_level_interval_ms: 1000,
            audio_level_threshold: 40,
            audio_level_filter: 20,
            allow_self_subscribe: false,
            simulcast: SimulcastConfig::default(),
            twcc: TwccConfig::default(),
        }
    }
}

impl Default for SimulcastConfig {
    fn default() -> Self {
        Self {
            best_quality_first: false,
            enable_temporal_layer: true,
        }
    }
}

impl Default for TwccConfig {
    fn default() -> Self {
        Self {
            initial_bitrate: 1_000_000,
            min_bitrate: 100_000,
            max_bitrate: 20_000_000,
            feedback_interval_ms: 100,
        }
    }
}

impl SfuConfig {
    /// Normalize and validate the configuration.
    ///
    /// Out-of-range values that have an obvious intent are clamped;
    /// contradictory ones are rejected.
    pub fn validate(&mut self) -> Result<()> {
        if self.audio_level_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "audio_level_interval_ms must be non-zero".into(),
            ));
        }
        self.audio_level_interval_ms = self.audio_level_interval_ms.clamp(10, 10_000);
        self.audio_level_threshold = self.audio_level_threshold.min(127);
        self.audio_level_filter = self.audio_level_filter.min(100);

        if self.max_packet_track == 0 {
            return Err(Error::InvalidConfig(
                "max_packet_track must be non-zero".into(),
            ));
        }

        if self.twcc.min_bitrate > self.twcc.max_bitrate {
            return Err(Error::InvalidConfig(
                "twcc.min_bitrate exceeds twcc.max_bitrate".into(),
            ));
        }
        self.twcc.initial_bitrate = self
            .twcc
            .initial_bitrate
            .clamp(self.twcc.min_bitrate, self.twcc.max_bitrate);
        if self.twcc.feedback_interval_ms == 0 {
            self.twcc.feedback_interval_ms = TwccConfig::default().feedback_interval_ms;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let mut cfg = SfuConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_packet_track, 500);
    }

    #[test]
    fn zero_audio_interval_rejected() {
        let mut cfg = SfuConfig {
            audio_level_interval_ms: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn audio_interval_clamped() {
        let mut cfg = SfuConfig {
            audio_level_interval_ms: 3,
            ..Default::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.audio_level_interval_ms, 10);

        cfg.audio_level_interval_ms = 60_000;
        cfg.validate().unwrap();
        assert_eq!(cfg.audio_level_interval_ms, 10_000);
    }

    #[test]
    fn initial_bitrate_clamped_into_bounds() {
        let mut cfg = SfuConfig::default();
        cfg.twcc.initial_bitrate = 1;
        cfg.validate().unwrap();
        assert_eq!(cfg.twcc.initial_bitrate, cfg.twcc.min_bitrate);
    }
}
