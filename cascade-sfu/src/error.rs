use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no receiver found for requested layer")]
    NoReceiverFound,

    #[error("spatial layers are not supported on simple tracks")]
    SpatialNotSupported,

    #[error("a spatial layer change is already in progress")]
    SpatialLayerBusy,

    #[error("packet is too short to carry an rtp header")]
    ShortPacket,

    #[error("empty packet")]
    NilPacket,

    #[error("no codec in the haystack matches the offered capability")]
    CodecNotFound,

    #[error("packet is no longer in the buffer window")]
    PacketNotFound,

    #[error("operation on a closed track")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("webrtc error: {0}")]
    WebRTC(#[from] webrtc::Error),

    #[error("malformed packet: {0}")]
    Marshal(#[from] webrtc::util::Error),
}
