use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{self, mpsc};
use tracing::{debug, info, trace, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder, API,
    },
    data_channel::data_channel_init::RTCDataChannelInit,
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_connection_state::RTCIceConnectionState,
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration,
        policy::{bundle_policy::RTCBundlePolicy, rtcp_mux_policy::RTCRtcpMuxPolicy},
        sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiverInit,
    },
};

use super::{
    data_channel::DataChannel, IceCandidate, IceConnectionState, MediaConstraints,
    PeerConnection, PeerConnectionConfig, PeerConnectionEvent, PeerConnectionFactory, SdpType,
    SessionDescription, StatsReport,
};

fn create_config(config: &PeerConnectionConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect(),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn create_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_ice_connection_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

/// webrtc-rs backed factory. The API object is built on initialize and
/// dropped on dispose.
#[derive(Default)]
pub struct RtcPeerConnectionFactory {
    api: Mutex<Option<Arc<API>>>,
}

impl RtcPeerConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn api(&self) -> Result<Arc<API>> {
        self.api
            .lock()
            .map_err(|_| anyhow!("factory lock poisoned"))?
            .clone()
            .ok_or_else(|| anyhow!("factory is not initialized"))
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    fn initialize(&self) -> Result<()> {
        let api = create_api()?;
        *self.api.lock().map_err(|_| anyhow!("factory lock poisoned"))? = Some(Arc::new(api));
        Ok(())
    }

    async fn create_peer_connection(
        &self,
        config: PeerConnectionConfig,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let api = self.api()?;
        let rtc = api.new_peer_connection(create_config(&config)).await?;
        Ok(Arc::new(
            RtcPeerConnection::new(rtc, config.data_channel_label, events).await,
        ))
    }

    fn dispose(&self) {
        if let Ok(mut api) = self.api.lock() {
            *api = None;
        }
    }
}

pub struct RtcPeerConnection {
    rtc: RTCPeerConnection,
    data_channel_label: String,
    data_channel: Arc<sync::Mutex<Option<DataChannel>>>,
    events: mpsc::UnboundedSender<PeerConnectionEvent>,
    audio_receiver: AtomicBool,
    video_receiver: AtomicBool,
}

impl RtcPeerConnection {
    async fn new(
        rtc: RTCPeerConnection,
        data_channel_label: String,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Self {
        let data_channel = Arc::new(sync::Mutex::new(None));
        {
            let data_channel = data_channel.clone();
            let events = events.clone();
            rtc.on_data_channel(Box::new(move |rtc_data_channel| {
                let data_channel = data_channel.clone();
                let events = events.clone();
                Box::pin(async move {
                    info!("remote data channel {}", rtc_data_channel.label());
                    let channel = DataChannel::new(rtc_data_channel, events).await;
                    *data_channel.lock().await = Some(channel);
                })
            }));
        }
        {
            let events = events.clone();
            rtc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        debug!("ICE gathering complete");
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate::new(
                                init.sdp_mid.unwrap_or_default(),
                                init.sdp_mline_index.unwrap_or_default(),
                                init.candidate,
                            );
                            let _ = events.send(PeerConnectionEvent::IceCandidate(candidate));
                        }
                        Err(err) => warn!("failed to serialize ICE candidate: {}", err),
                    }
                })
            }));
        }
        {
            let events = events.clone();
            rtc.on_ice_connection_state_change(Box::new(move |state| {
                trace!("ICE connection state: {}", state);
                if let Some(state) = to_ice_connection_state(state) {
                    let _ = events.send(PeerConnectionEvent::IceConnectionChange(state));
                }
                Box::pin(async {})
            }));
        }

        Self {
            rtc,
            data_channel_label,
            data_channel,
            events,
            audio_receiver: AtomicBool::new(false),
            video_receiver: AtomicBool::new(false),
        }
    }

    async fn add_receiver(&self, kind: RTPCodecType) -> Result<()> {
        self.rtc
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn ensure_receivers(&self, constraints: MediaConstraints) -> Result<()> {
        if constraints.offer_to_receive_audio && !self.audio_receiver.swap(true, Ordering::SeqCst) {
            self.add_receiver(RTPCodecType::Audio).await?;
        }
        if constraints.offer_to_receive_video && !self.video_receiver.swap(true, Ordering::SeqCst) {
            self.add_receiver(RTPCodecType::Video).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self, constraints: MediaConstraints) -> Result<SessionDescription> {
        self.ensure_receivers(constraints).await?;
        let offer = self.rtc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self, _constraints: MediaConstraints) -> Result<SessionDescription> {
        let answer = self.rtc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        Ok(self
            .rtc
            .set_local_description(to_rtc_description(desc)?)
            .await?)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        Ok(self
            .rtc
            .set_remote_description(to_rtc_description(desc)?)
            .await?)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        Ok(self
            .rtc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: Some(candidate.sdp_mid),
                sdp_mline_index: Some(candidate.sdp_m_line_index),
                username_fragment: None,
            })
            .await?)
    }

    async fn remove_ice_candidates(&self, candidates: Vec<IceCandidate>) -> Result<()> {
        // webrtc-rs has no candidate removal; the agent prunes dead pairs itself.
        debug!("ignore removal of {} remote candidates", candidates.len());
        Ok(())
    }

    async fn create_data_channel(&self) -> Result<()> {
        let rtc_data_channel = self
            .rtc
            .create_data_channel(
                &self.data_channel_label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        let channel = DataChannel::new(rtc_data_channel, self.events.clone()).await;
        *self.data_channel.lock().await = Some(channel);
        Ok(())
    }

    async fn send_data(&self, data: Bytes) -> Result<()> {
        let data_channel = self.data_channel.lock().await;
        let Some(data_channel) = data_channel.as_ref() else {
            bail!("data channel is not ready");
        };
        data_channel.send(data).await
    }

    async fn stats(&self) -> Result<StatsReport> {
        let report = self.rtc.get_stats().await;
        let mut report_ids: Vec<String> = report.reports.into_keys().collect();
        report_ids.sort();
        Ok(StatsReport { report_ids })
    }

    async fn close(&self) -> Result<()> {
        if let Some(data_channel) = self.data_channel.lock().await.take() {
            if let Err(err) = data_channel.close().await {
                warn!("failed to close data channel {}: {}", data_channel.label(), err);
            }
        }
        Ok(self.rtc.close().await?)
    }
}
