use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::REFERER;
use telecall_lib::{
    connection::IceServer,
    error::ChannelError,
    signaling::{
        room::{join_url, leave_url, parse_turn_response, RoomJoin, RoomParametersSource},
        RoomConnectionParameters, SignalingParameters,
    },
};
use tokio::time::timeout;
use tracing::{info, warn};

const TURN_TIMEOUT: Duration = Duration::from_secs(5);

/// Joins rooms over HTTP.
pub struct HttpRoomFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRoomFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn join(&self, url: &str) -> Result<RoomJoin, ChannelError> {
        info!("POST {}", url);
        let res = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|err| ChannelError::RoomFetch(err.to_string()))?;
        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|err| ChannelError::RoomFetch(err.to_string()))?;
        RoomJoin::parse(status, &text)
    }

    async fn request_turn_servers(
        &self,
        url: &str,
        referer: &str,
    ) -> Result<Vec<IceServer>, ChannelError> {
        info!("Request TURN from: {}", url);
        let res = self
            .client
            .post(url)
            .header(REFERER, referer)
            .timeout(TURN_TIMEOUT)
            .send()
            .await
            .map_err(|err| ChannelError::RoomFetch(err.to_string()))?;
        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|err| ChannelError::RoomFetch(err.to_string()))?;
        parse_turn_response(status, &text)
    }

    async fn fetch_inner(
        &self,
        room: &RoomConnectionParameters,
    ) -> Result<SignalingParameters, ChannelError> {
        let join = self.join(&join_url(room)).await?;
        let needs_turn = join.needs_turn();
        let RoomJoin {
            mut params,
            ice_server_url,
        } = join;
        if let (true, Some(url)) = (needs_turn, ice_server_url) {
            let servers = self.request_turn_servers(&url, &room.room_url).await?;
            params.ice_servers.extend(servers);
        }
        Ok(params)
    }
}

#[async_trait]
impl RoomParametersSource for HttpRoomFetcher {
    async fn fetch(
        &self,
        room: &RoomConnectionParameters,
    ) -> Result<SignalingParameters, ChannelError> {
        timeout(self.timeout, self.fetch_inner(room))
            .await
            .map_err(|_| ChannelError::RoomFetch("room request timed out".to_owned()))?
    }

    async fn leave(&self, room: &RoomConnectionParameters, client_id: &str) -> Result<()> {
        let url = leave_url(room, client_id);
        info!("POST {}", url);
        let res = self.client.post(&url).timeout(self.timeout).send().await?;
        if !res.status().is_success() {
            warn!("leave room: {}", res.status());
        }
        Ok(())
    }
}
