//! JSON envelopes exchanged with the signaling server.
//!
//! Every message is `{"type": .., "payload": ..}`. Messages that concern
//! one peer connection carry routing fields in their payload so the server
//! can demultiplex them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ConnectionLabel;
use crate::{
    connection::{IceCandidate, SessionDescription},
    error::ChannelError,
};

pub const PEER_TYPE_MOBILE: &str = "mobile";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Routing {
    pub peer: String,
    #[serde(rename = "type")]
    pub peer_type: String,
    pub label: ConnectionLabel,
    #[serde(rename = "connectionID")]
    pub connection_id: String,
}

impl Routing {
    pub fn is_empty(&self) -> bool {
        self.peer.is_empty() && self.connection_id.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaInfo {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundSdp {
    pub sdp: SessionDescription,
    #[serde(flatten)]
    pub routing: Routing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    #[serde(flatten)]
    pub routing: Routing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemovalPayload {
    pub candidates: Vec<IceCandidate>,
    #[serde(flatten)]
    pub routing: Routing,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outbound {
    CreateOrJoin {
        #[serde(rename = "roomID")]
        room_id: String,
    },
    MediaInfo {
        media: MediaInfo,
    },
    SessionDescriptionOffer(OutboundSdp),
    SessionDescriptionAnswer(OutboundSdp),
    IceCandidate(CandidatePayload),
    RemoveCandidates(RemovalPayload),
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::CreateOrJoin { .. } => "CREATE_OR_JOIN",
            Outbound::MediaInfo { .. } => "MEDIA_INFO",
            Outbound::SessionDescriptionOffer(_) => "offer SDP",
            Outbound::SessionDescriptionAnswer(_) => "answer SDP",
            Outbound::IceCandidate(_) => "ICE candidate",
            Outbound::RemoveCandidates(_) => "ICE candidate removals",
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Deserialize)]
struct SdpBody {
    sdp: String,
}

#[derive(Deserialize)]
struct InboundSdp {
    sdp: SdpBody,
    #[serde(flatten)]
    routing: Routing,
}

#[derive(Default, Deserialize)]
struct JoinedPayload {
    #[serde(default)]
    peer: Option<String>,
}

#[derive(Deserialize)]
struct MediaInfoPayload {
    media: MediaInfo,
}

#[derive(Default, Deserialize)]
struct ByePayload {
    #[serde(default)]
    label: Option<ConnectionLabel>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Created,
    Joined { peer: Option<String> },
    RoomFull,
    IceCandidate(CandidatePayload),
    Offer { sdp: String, routing: Routing },
    Answer { sdp: String, routing: Routing },
    RemoveCandidates(RemovalPayload),
    MediaInfo(MediaInfo),
    Bye { label: Option<ConnectionLabel> },
    Unknown(String),
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, payload: Option<Value>) -> Result<T, ChannelError> {
    let payload = payload.ok_or_else(|| ChannelError::Malformed(format!("{} without payload", kind)))?;
    serde_json::from_value(payload).map_err(|err| ChannelError::Malformed(format!("{}: {}", kind, err)))
}

fn optional_payload<T: serde::de::DeserializeOwned + Default>(
    kind: &str,
    value: Option<Value>,
) -> Result<T, ChannelError> {
    match value {
        None | Some(Value::Null) => Ok(T::default()),
        value => payload(kind, value),
    }
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, ChannelError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|err| ChannelError::Malformed(err.to_string()))?;
        let kind = raw.kind.as_str();
        Ok(match kind {
            "CREATED" => Inbound::Created,
            "JOINED" => {
                let joined: JoinedPayload = optional_payload(kind, raw.payload)?;
                Inbound::Joined { peer: joined.peer }
            }
            "ROOM_FULL" => Inbound::RoomFull,
            "ICE_CANDIDATE" => Inbound::IceCandidate(payload(kind, raw.payload)?),
            "SESSION_DESCRIPTION_OFFER" => {
                let inbound: InboundSdp = payload(kind, raw.payload)?;
                Inbound::Offer {
                    sdp: inbound.sdp.sdp,
                    routing: inbound.routing,
                }
            }
            "SESSION_DESCRIPTION_ANSWER" => {
                let inbound: InboundSdp = payload(kind, raw.payload)?;
                Inbound::Answer {
                    sdp: inbound.sdp.sdp,
                    routing: inbound.routing,
                }
            }
            "REMOVE_CANDIDATES" => Inbound::RemoveCandidates(payload(kind, raw.payload)?),
            "MEDIA_INFO" => {
                let info: MediaInfoPayload = payload(kind, raw.payload)?;
                Inbound::MediaInfo(info.media)
            }
            "BYE" => {
                let bye: ByePayload = optional_payload(kind, raw.payload)?;
                Inbound::Bye { label: bye.label }
            }
            _ => Inbound::Unknown(raw.kind),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn routing() -> Routing {
        Routing {
            peer: "web-1".to_owned(),
            peer_type: PEER_TYPE_MOBILE.to_owned(),
            label: ConnectionLabel::Data,
            connection_id: "c0ffee".to_owned(),
        }
    }

    #[test]
    fn outbound_offer_carries_routing() {
        let msg = Outbound::SessionDescriptionOffer(OutboundSdp {
            sdp: SessionDescription::offer("v=0\r\n"),
            routing: routing(),
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "SESSION_DESCRIPTION_OFFER",
                "payload": {
                    "sdp": {"type": "offer", "sdp": "v=0\r\n"},
                    "peer": "web-1",
                    "type": "mobile",
                    "label": "DATA",
                    "connectionID": "c0ffee",
                }
            })
        );
    }

    #[test]
    fn outbound_create_or_join() {
        let msg = Outbound::CreateOrJoin {
            room_id: "10010".to_owned(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "CREATE_OR_JOIN", "payload": {"roomID": "10010"}})
        );
    }

    #[test]
    fn parses_candidate_with_routing() {
        let text = json!({
            "type": "ICE_CANDIDATE",
            "payload": {
                "candidate": {"sdpMid": "0", "sdpMLineIndex": 0, "candidate": "candidate:1"},
                "peer": "web-1",
                "type": "mobile",
                "label": "DATA",
                "connectionID": "c0ffee",
            }
        })
        .to_string();
        let Inbound::IceCandidate(payload) = Inbound::parse(&text).unwrap() else {
            panic!("not a candidate");
        };
        assert_eq!(payload.candidate.candidate, "candidate:1");
        assert_eq!(payload.routing, routing());
    }

    #[test]
    fn offer_without_routing_defaults_to_media() {
        let text = r#"{"type":"SESSION_DESCRIPTION_OFFER","payload":{"sdp":{"sdp":"v=0","type":"offer"}}}"#;
        let Inbound::Offer { sdp, routing } = Inbound::parse(text).unwrap() else {
            panic!("not an offer");
        };
        assert_eq!(sdp, "v=0");
        assert_eq!(routing.label, ConnectionLabel::Media);
        assert!(routing.is_empty());
    }

    #[test]
    fn unknown_and_malformed() {
        assert_eq!(
            Inbound::parse(r#"{"type":"PING"}"#).unwrap(),
            Inbound::Unknown("PING".to_owned())
        );
        assert!(matches!(
            Inbound::parse("not json"),
            Err(ChannelError::Malformed(_))
        ));
        assert!(matches!(
            Inbound::parse(r#"{"type":"ICE_CANDIDATE"}"#),
            Err(ChannelError::Malformed(_))
        ));
        assert_eq!(
            Inbound::parse(r#"{"type":"JOINED"}"#).unwrap(),
            Inbound::Joined { peer: None }
        );
    }
}
