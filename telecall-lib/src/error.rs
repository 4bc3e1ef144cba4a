use thiserror::Error;

use crate::signaling::ConnectionLabel;

/// Failures of the signaling channel. Terminal for the channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Room response error: {0}")]
    RoomResponse(String),
    #[error("Room IO error: {0}")]
    RoomFetch(String),
    #[error("Room is full")]
    RoomFull,
    #[error("Loopback room is busy.")]
    LoopbackBusy,
    #[error("Signaling transport error: {0}")]
    Transport(String),
    #[error("Malformed signaling message: {0}")]
    Malformed(String),
    #[error("Sending {0} in non connected state.")]
    NotConnected(&'static str),
}

/// Failures of a single peer session. The other label is unaffected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Multiple SDP create.")]
    MultipleSdpCreate,
    #[error("createSDP error: {0}")]
    CreateSdp(String),
    #[error("setSDP error: {0}")]
    SetSdp(String),
    #[error("ICE connection failed.")]
    IceFailed,
    #[error("data channel error: {0}")]
    DataChannel(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {len} bytes")]
    TooShort { len: usize },
    #[error("invalid {field} value: {value}")]
    InvalidField { field: &'static str, value: i8 },
    #[error("frame is a {0}")]
    UnexpectedKind(&'static str),
}

/// Capability failures. Fatal to the whole call.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("peer connection factory unavailable: {0}")]
    FactoryUnavailable(#[source] anyhow::Error),
    #[error("failed to create peer connection for {label}: {source}")]
    PeerConnection {
        label: ConnectionLabel,
        #[source]
        source: anyhow::Error,
    },
    #[error("session for {0} already exists")]
    DuplicateSession(ConnectionLabel),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("unsupported api code: {0}")]
    Unsupported(u8),
    #[error("telemetry unavailable: {0}")]
    Unavailable(String),
}
