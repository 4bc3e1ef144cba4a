pub mod client;
pub mod envelope;
pub mod room;
pub mod socket;

use std::fmt;

use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::{
    connection::{IceCandidate, IceServer, MediaConstraints, SessionDescription},
    error::ChannelError,
};

/// Identifies which of the independent peer connections a message belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionLabel {
    #[default]
    Media,
    Data,
}

impl fmt::Display for ConnectionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionLabel::Media => write!(f, "MEDIA"),
            ConnectionLabel::Data => write!(f, "DATA"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, new)]
pub struct RoomConnectionParameters {
    pub room_url: String,
    pub room_id: String,
    pub loopback: bool,
}

/// Result of joining a room.
#[derive(Clone, Debug, PartialEq, new)]
pub struct SignalingParameters {
    pub ice_servers: Vec<IceServer>,
    pub initiator: bool,
    pub client_id: String,
    pub wss_url: String,
    pub wss_post_url: String,
    pub offer_sdp: Option<SessionDescription>,
    pub ice_candidates: Vec<IceCandidate>,
    pub media_constraints: MediaConstraints,
}

impl SignalingParameters {
    /// Copy for another label: messages queued by the room belong to the
    /// media connection only.
    pub fn without_queued_messages(&self, media_constraints: MediaConstraints) -> Self {
        Self {
            offer_sdp: None,
            ice_candidates: Vec::new(),
            media_constraints,
            ..self.clone()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Connected,
    Closed,
    Error,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SignalingEvent {
    ConnectedToRoom {
        params: SignalingParameters,
        label: ConnectionLabel,
    },
    RemoteDescription {
        sdp: SessionDescription,
        constraints: MediaConstraints,
        label: ConnectionLabel,
    },
    RemoteIceCandidate {
        candidate: IceCandidate,
        label: ConnectionLabel,
    },
    RemoteIceCandidatesRemoved {
        candidates: Vec<IceCandidate>,
        label: ConnectionLabel,
    },
    /// The peer left. `None` closes every label.
    ChannelClose { label: Option<ConnectionLabel> },
    ChannelError(ChannelError),
}
