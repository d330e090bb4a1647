//! Simulcast layer bookkeeping: RID mapping, per-downtrack reference bases
//! for VP8 re-basing, and the loss/bandwidth-driven layer-change decision.

/// Lowest spatial layer (quarter resolution).
pub const LAYER_LOW: i32 = 0;
/// Middle spatial layer (half resolution).
pub const LAYER_MID: i32 = 1;
/// Highest spatial layer (full resolution).
pub const LAYER_HIGH: i32 = 2;

/// Loss fraction (out of 255) below which the network counts as clean.
const LOSS_LOW: u8 = 5;
/// Loss fraction (out of 255) above which the network counts as congested.
const LOSS_HIGH: u8 = 25;
/// Raise a temporal layer when the estimate covers this share of the current bitrate.
const UPGRADE_TEMPORAL_RATIO: f64 = 0.75;
/// Raise a spatial layer when the estimate covers this multiple of the current bitrate.
const UPGRADE_SPATIAL_RATIO: f64 = 1.5;
/// Drop a layer when the estimate falls to this share of the current bitrate.
const DOWNGRADE_RATIO: f64 = 0.625;

/// Cooldown after a temporal change.
pub const SWITCH_DELAY_TEMPORAL_MS: u64 = 3_000;
/// Cooldown after a spatial upgrade.
pub const SWITCH_DELAY_SPATIAL_UP_MS: u64 = 5_000;
/// Cooldown after a spatial downgrade.
pub const SWITCH_DELAY_SPATIAL_DOWN_MS: u64 = 10_000;

/// Map an RTP stream id to a spatial layer index.
pub fn layer_from_rid(rid: &str) -> Option<usize> {
    match rid.to_lowercase().as_str() {
        "q" | "low" | "l" | "r0" | "0" => Some(0),
        "h" | "mid" | "m" | "r1" | "1" => Some(1),
        "f" | "full" | "high" | "hi" | "r2" | "2" => Some(2),
        _ => None,
    }
}

/// Per-downtrack simulcast state: VP8 reference bases for the current
/// encoding, the last emitted values, and the switch cooldown deadline.
#[derive(Debug, Default)]
pub struct SimulcastTrackHelpers {
    /// No further layer changes before this instant (monotonic ms)
    pub switch_delay_until_ms: u64,
    /// The stream carries VP8 temporal scalability fields
    pub temporal_supported: bool,
    /// PictureID of the first packet seen on the current encoding
    pub ref_pic_id: u16,
    /// Last PictureID emitted before the switch to the current encoding
    pub p_ref_pic_id: u16,
    /// Last PictureID emitted
    pub l_pic_id: u16,
    /// TL0PICIDX of the first packet seen on the current encoding
    pub ref_tlz_idx: u8,
    /// Last TL0PICIDX emitted before the switch
    pub p_ref_tlz_idx: u8,
    /// Last TL0PICIDX emitted
    pub l_tlz_idx: u8,
    /// Arrival time of the last forwarded packet (monotonic ns)
    pub last_ts_calc_ns: u64,
}

/// Rebase a PictureID onto the local sequence: continue one past the last
/// emitted id, offset by the packet's distance from its encoding's reference.
pub fn rebase_picture_id(pic_id: u16, ref_pic_id: u16, p_ref_pic_id: u16) -> u16 {
    pic_id
        .wrapping_sub(ref_pic_id)
        .wrapping_add(p_ref_pic_id)
        .wrapping_add(1)
        & 0x7FFF
}

/// Same re-basing for the 8-bit TL0PICIDX.
pub fn rebase_tl0_idx(tlz: u8, ref_tlz: u8, p_ref_tlz: u8) -> u8 {
    tlz.wrapping_sub(ref_tlz).wrapping_add(p_ref_tlz).wrapping_add(1)
}

/// What the feedback loop decided to do with the layers of one downtrack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerAction {
    RaiseTemporal(i32),
    LowerTemporal(i32),
    RaiseSpatial(i32),
    LowerSpatial(i32),
}

/// Inputs to the layer-change decision, gathered from the downtrack, its
/// receiver, and the subscriber's RTCP feedback.
#[derive(Debug, Clone, Copy)]
pub struct LayerChangeContext {
    pub current_spatial: i32,
    pub target_spatial: i32,
    pub current_temporal: i32,
    pub target_temporal: i32,
    pub max_spatial: i32,
    pub max_temporal: i32,
    /// Live receive bitrate per spatial layer (bps, 0 = unknown/absent)
    pub bitrates: [u64; 3],
    /// Highest temporal layer each spatial layer carries
    pub max_temporal_per_layer: [i32; 3],
    /// Subscriber bandwidth estimate (bps)
    pub estimate: u64,
    /// Worst fraction lost reported by the subscriber (out of 255)
    pub loss: u8,
}

/// Decide the next layer transition, if any.
///
/// Returns the action together with the cooldown to arm. Callers gate on the
/// mid-switch condition and the previous cooldown before invoking this.
pub fn decide_layer_change(ctx: &LayerChangeContext) -> Option<(LayerAction, u64)> {
    let current_bitrate = ctx.bitrates[ctx.current_spatial as usize];
    if current_bitrate == 0 {
        return None;
    }
    let estimate = ctx.estimate as f64;
    let current = current_bitrate as f64;
    let layer_max_temporal =
        ctx.max_temporal_per_layer[ctx.current_spatial as usize].min(ctx.max_temporal);

    if ctx.loss <= LOSS_LOW {
        if ctx.current_temporal < layer_max_temporal
            && estimate >= current * UPGRADE_TEMPORAL_RATIO
        {
            return Some((
                LayerAction::RaiseTemporal(ctx.current_temporal + 1),
                SWITCH_DELAY_TEMPORAL_MS,
            ));
        }
        if ctx.current_temporal >= layer_max_temporal
            && ctx.current_spatial < ctx.max_spatial
            && ctx.current_spatial < LAYER_HIGH
            && estimate >= current * UPGRADE_SPATIAL_RATIO
        {
            return Some((
                LayerAction::RaiseSpatial(ctx.current_spatial + 1),
                SWITCH_DELAY_SPATIAL_UP_MS,
            ));
        }
        return None;
    }

    if ctx.loss >= LOSS_HIGH {
        let starved = estimate <= current * DOWNGRADE_RATIO || ctx.current_temporal == 0;
        if starved
            && ctx.current_spatial > LAYER_LOW
            && ctx.bitrates[(ctx.current_spatial - 1) as usize] != 0
        {
            return Some((
                LayerAction::LowerSpatial(ctx.current_spatial - 1),
                SWITCH_DELAY_SPATIAL_DOWN_MS,
            ));
        }
        if ctx.current_temporal > 0 {
            return Some((
                LayerAction::LowerTemporal(ctx.current_temporal - 1),
                SWITCH_DELAY_TEMPORAL_MS,
            ));
        }
    }
    None
}
