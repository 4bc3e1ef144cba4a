use anyhow::Result;
use async_trait::async_trait;
use derive_new::new;
use http::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{RoomConnectionParameters, SignalingParameters};
use crate::{
    connection::{IceCandidate, IceServer, MediaConstraints, SessionDescription},
    error::ChannelError,
};

pub fn join_url(room: &RoomConnectionParameters) -> String {
    format!("{}/join/{}", room.room_url.trim_end_matches('/'), room.room_id)
}

pub fn leave_url(room: &RoomConnectionParameters, client_id: &str) -> String {
    format!(
        "{}/leave/{}/{}",
        room.room_url.trim_end_matches('/'),
        room.room_id,
        client_id
    )
}

/// Produces the parameters of a room before the signaling channel opens.
#[async_trait]
pub trait RoomParametersSource: Send + Sync {
    async fn fetch(
        &self,
        room: &RoomConnectionParameters,
    ) -> Result<SignalingParameters, ChannelError>;

    /// Tells the room server that `client_id` left.
    async fn leave(&self, _room: &RoomConnectionParameters, _client_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Uses the room URL itself as the channel URL. The server decides the
/// roles, so this side never initiates.
#[derive(new)]
pub struct StaticRoomParameters {
    ice_servers: Vec<IceServer>,
    initiator: bool,
}

#[async_trait]
impl RoomParametersSource for StaticRoomParameters {
    async fn fetch(
        &self,
        room: &RoomConnectionParameters,
    ) -> Result<SignalingParameters, ChannelError> {
        Ok(SignalingParameters::new(
            self.ice_servers.clone(),
            self.initiator,
            String::new(),
            room.room_url.clone(),
            room.room_url.clone(),
            None,
            Vec::new(),
            MediaConstraints::receive(true, true),
        ))
    }
}

/// Parsed body of a successful room-join request.
#[derive(Debug)]
pub struct RoomJoin {
    pub params: SignalingParameters,
    pub ice_server_url: Option<String>,
}

impl RoomJoin {
    pub fn needs_turn(&self) -> bool {
        !self
            .params
            .ice_servers
            .iter()
            .flat_map(|server| server.urls.iter())
            .any(|url| url.starts_with("turn:"))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Urls {
    One(String),
    Many(Vec<String>),
}

impl From<Urls> for Vec<String> {
    fn from(urls: Urls) -> Self {
        match urls {
            Urls::One(url) => vec![url],
            Urls::Many(urls) => urls,
        }
    }
}

#[derive(Deserialize)]
struct RawIceServer {
    urls: Urls,
    #[serde(default)]
    username: String,
    #[serde(default)]
    credential: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIceConfig {
    #[serde(default)]
    ice_servers: Vec<RawIceServer>,
}

impl From<RawIceConfig> for Vec<IceServer> {
    fn from(config: RawIceConfig) -> Self {
        config
            .ice_servers
            .into_iter()
            .map(|server| IceServer::new(server.urls.into(), server.username, server.credential))
            .collect()
    }
}

/// Some servers send nested objects as JSON text.
fn unwrap_json_text(value: Value) -> Result<Value, ChannelError> {
    match value {
        Value::String(text) => serde_json::from_str(&text).map_err(malformed),
        value => Ok(value),
    }
}

fn malformed(err: serde_json::Error) -> ChannelError {
    ChannelError::Malformed(err.to_string())
}

fn string_field(params: &Value, key: &str) -> Result<String, ChannelError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ChannelError::Malformed(format!("missing {}", key)))
}

fn bool_field(params: &Value, key: &str) -> Result<bool, ChannelError> {
    match params.get(key) {
        Some(Value::Bool(value)) => Ok(*value),
        Some(Value::String(value)) if value == "true" => Ok(true),
        Some(Value::String(value)) if value == "false" => Ok(false),
        _ => Err(ChannelError::Malformed(format!("missing {}", key))),
    }
}

fn parse_queued_messages(
    messages: Option<&Value>,
) -> Result<(Option<SessionDescription>, Vec<IceCandidate>), ChannelError> {
    let mut offer = None;
    let mut candidates = Vec::new();
    let Some(messages) = messages else {
        return Ok((offer, candidates));
    };
    let messages = match unwrap_json_text(messages.clone())? {
        Value::Array(messages) => messages,
        _ => return Err(ChannelError::Malformed("messages is not an array".to_owned())),
    };
    for message in messages {
        let message = unwrap_json_text(message)?;
        match message.get("type").and_then(Value::as_str) {
            Some("offer" | "SESSION_DESCRIPTION_OFFER") => {
                offer = Some(SessionDescription::offer(string_field(&message, "sdp")?));
            }
            Some("candidate" | "ICE_CANDIDATE") => {
                let sdp_m_line_index = message
                    .get("label")
                    .and_then(Value::as_u64)
                    .and_then(|label| u16::try_from(label).ok())
                    .ok_or_else(|| ChannelError::Malformed("candidate without label".to_owned()))?;
                candidates.push(IceCandidate::new(
                    string_field(&message, "id")?,
                    sdp_m_line_index,
                    string_field(&message, "candidate")?,
                ));
            }
            _ => warn!("Unknown message: {}", message),
        }
    }
    Ok((offer, candidates))
}

impl RoomJoin {
    pub fn parse(status: StatusCode, text: &str) -> Result<Self, ChannelError> {
        if !status.is_success() {
            return Err(ChannelError::RoomFetch(format!(
                "Non-200 response to room request: {}",
                status
            )));
        }
        debug!("Room response: {}", text);
        let body: Value = serde_json::from_str(text).map_err(malformed)?;
        let result = string_field(&body, "result")?;
        if result != "SUCCESS" {
            return Err(ChannelError::RoomResponse(result));
        }
        let params = unwrap_json_text(
            body.get("params")
                .cloned()
                .ok_or_else(|| ChannelError::Malformed("missing params".to_owned()))?,
        )?;

        let client_id = string_field(&params, "client_id")?;
        let wss_url = string_field(&params, "wss_url")?;
        let wss_post_url = string_field(&params, "wss_post_url")?;
        let initiator = bool_field(&params, "is_initiator")?;
        let (offer_sdp, ice_candidates) = if initiator {
            (None, Vec::new())
        } else {
            parse_queued_messages(params.get("messages"))?
        };
        let ice_servers: Vec<IceServer> = match params.get("pc_config") {
            Some(pc_config) => {
                let config: RawIceConfig =
                    serde_json::from_value(unwrap_json_text(pc_config.clone())?)
                        .map_err(malformed)?;
                config.into()
            }
            None => Vec::new(),
        };
        debug!(
            "RoomId: {}. ClientId: {}. Initiator: {}",
            params.get("room_id").unwrap_or(&serde_json::Value::Null),
            client_id,
            initiator
        );

        Ok(Self {
            params: SignalingParameters::new(
                ice_servers,
                initiator,
                client_id,
                wss_url,
                wss_post_url,
                offer_sdp,
                ice_candidates,
                MediaConstraints::receive(true, true),
            ),
            ice_server_url: params
                .get("ice_server_url")
                .and_then(Value::as_str)
                .filter(|url| !url.is_empty())
                .map(str::to_owned),
        })
    }
}

/// Parses the answer of the TURN server request.
pub fn parse_turn_response(status: StatusCode, text: &str) -> Result<Vec<IceServer>, ChannelError> {
    if !status.is_success() {
        return Err(ChannelError::RoomFetch(format!(
            "Non-200 response when requesting TURN server: {}",
            status
        )));
    }
    let config: RawIceConfig = serde_json::from_str(text).map_err(malformed)?;
    Ok(config.into())
}
