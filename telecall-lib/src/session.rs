pub mod registry;

use std::{future::pending, mem, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    spawn,
    sync::{mpsc, oneshot},
    time::{interval, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    connection::{
        IceCandidate, IceConnectionState, IceServer, MediaConstraints, PeerConnection,
        PeerConnectionConfig, PeerConnectionEvent, SdpType, SessionDescription, SharedFactory,
        StatsReport,
    },
    error::{NegotiationError, ResourceError},
    sdp::{prefer_codec, set_start_bitrate},
    signaling::ConnectionLabel,
};

const AUDIO_BITRATE_CODEC: &str = "opus";
const DEFAULT_VIDEO_CODEC: &str = "VP8";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Negotiating,
    Connected,
    Disconnected,
    Closed,
}

/// Remote candidates that arrived before both descriptions were applied.
/// Drained once, then every candidate goes straight to the connection.
#[derive(Debug, PartialEq, Eq)]
pub enum CandidateQueue {
    Buffering(Vec<IceCandidate>),
    Drained,
}

impl Default for CandidateQueue {
    fn default() -> Self {
        CandidateQueue::Buffering(Vec::new())
    }
}

impl CandidateQueue {
    /// Buffers `candidate`, or hands it back if the queue is already drained.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        match self {
            CandidateQueue::Buffering(items) => {
                items.push(candidate);
                None
            }
            CandidateQueue::Drained => Some(candidate),
        }
    }

    /// Empties the buffer in insertion order. Later calls return nothing.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        match mem::replace(self, CandidateQueue::Drained) {
            CandidateQueue::Buffering(items) => items,
            CandidateQueue::Drained => Vec::new(),
        }
    }

    /// Drops buffered candidates that match `candidates`. Returns the ones
    /// that must be removed from the connection instead.
    pub fn remove(&mut self, candidates: Vec<IceCandidate>) -> Vec<IceCandidate> {
        match self {
            CandidateQueue::Buffering(items) => {
                items.retain(|item| !candidates.contains(item));
                Vec::new()
            }
            CandidateQueue::Drained => candidates,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CandidateQueue::Buffering(items) => items.len(),
            CandidateQueue::Drained => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    pub preferred_video_codec: Option<String>,
    pub preferred_audio_codec: Option<String>,
    pub video_start_bitrate_kbps: Option<u32>,
    pub audio_start_bitrate_kbps: Option<u32>,
    pub data_channel_label: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    LocalDescription {
        label: ConnectionLabel,
        sdp: SessionDescription,
    },
    IceCandidate {
        label: ConnectionLabel,
        candidate: IceCandidate,
    },
    IceCandidatesRemoved {
        label: ConnectionLabel,
        candidates: Vec<IceCandidate>,
    },
    IceConnected {
        label: ConnectionLabel,
    },
    IceDisconnected {
        label: ConnectionLabel,
    },
    StatsReady {
        label: ConnectionLabel,
        report: StatsReport,
    },
    DataChannelOpen {
        label: ConnectionLabel,
    },
    DataMessage {
        label: ConnectionLabel,
        data: Bytes,
    },
    DataChannelClosed {
        label: ConnectionLabel,
    },
    Error {
        label: ConnectionLabel,
        error: NegotiationError,
    },
    Closed {
        label: ConnectionLabel,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub is_error: bool,
    pub has_local_description: bool,
    pub buffered_candidates: usize,
}

enum SessionCommand {
    CreateDescription(SdpType, MediaConstraints),
    SetRemoteDescription(SessionDescription),
    AddRemoteIceCandidate(IceCandidate),
    RemoveRemoteIceCandidates(Vec<IceCandidate>),
    EnableStatsEvents(bool, Duration),
    SendData(Bytes),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Close(oneshot::Sender<()>),
}

/// Handle to a running [`PeerSession`]. Calls are queued and handled in
/// order. Once the session is closed every call is a no-op.
#[derive(Clone)]
pub struct PeerSessionHandle {
    label: ConnectionLabel,
    is_initiator: bool,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl PeerSessionHandle {
    pub fn label(&self) -> ConnectionLabel {
        self.label
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    fn enqueue(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            debug!("session {} is closed", self.label);
        }
    }

    pub fn create_offer(&self, constraints: MediaConstraints) {
        self.enqueue(SessionCommand::CreateDescription(SdpType::Offer, constraints));
    }

    pub fn create_answer(&self, constraints: MediaConstraints) {
        self.enqueue(SessionCommand::CreateDescription(SdpType::Answer, constraints));
    }

    pub fn set_remote_description(&self, sdp: SessionDescription) {
        self.enqueue(SessionCommand::SetRemoteDescription(sdp));
    }

    pub fn add_remote_ice_candidate(&self, candidate: IceCandidate) {
        self.enqueue(SessionCommand::AddRemoteIceCandidate(candidate));
    }

    pub fn remove_remote_ice_candidates(&self, candidates: Vec<IceCandidate>) {
        self.enqueue(SessionCommand::RemoveRemoteIceCandidates(candidates));
    }

    pub fn enable_stats_events(&self, enable: bool, period: Duration) {
        self.enqueue(SessionCommand::EnableStatsEvents(enable, period));
    }

    pub fn send_data(&self, data: Bytes) {
        self.enqueue(SessionCommand::SendData(data));
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (reply, wait) = oneshot::channel();
        self.enqueue(SessionCommand::Snapshot(reply));
        wait.await.ok()
    }

    /// Closes the session and waits until the connection is released.
    pub async fn close(&self) {
        let (done, wait) = oneshot::channel();
        self.enqueue(SessionCommand::Close(done));
        let _ = wait.await;
    }
}

async fn tick(stats: &mut Option<(Duration, Interval)>) {
    match stats {
        Some((_, interval)) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

enum Side {
    Local,
    Remote,
}

/// Negotiation state of one peer connection.
pub struct PeerSession {
    label: ConnectionLabel,
    is_initiator: bool,
    config: SessionConfig,
    peer_connection: Arc<dyn PeerConnection>,
    factory: SharedFactory,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: SessionState,
    is_error: bool,
    local_sdp: Option<SessionDescription>,
    local_applied: bool,
    remote_applied: bool,
    local_sent: bool,
    candidates: CandidateQueue,
    stats: Option<(Duration, Interval)>,
}

impl PeerSession {
    /// Acquires the factory, creates the connection and starts the session
    /// task.
    pub async fn spawn(
        label: ConnectionLabel,
        is_initiator: bool,
        ice_servers: Vec<IceServer>,
        config: SessionConfig,
        factory: SharedFactory,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<PeerSessionHandle, ResourceError> {
        factory.acquire()?;
        let (pc_events_tx, pc_events_rx) = mpsc::unbounded_channel();
        let pc_config = PeerConnectionConfig::new(ice_servers, config.data_channel_label.clone());
        let peer_connection = match factory.create_peer_connection(pc_config, pc_events_tx).await {
            Ok(peer_connection) => peer_connection,
            Err(source) => {
                factory.release();
                return Err(ResourceError::PeerConnection { label, source });
            }
        };
        info!(
            "Create peer connection for {}. Initiator: {}",
            label, is_initiator
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        let session = PeerSession {
            label,
            is_initiator,
            config,
            peer_connection,
            factory,
            events,
            state: SessionState::Created,
            is_error: false,
            local_sdp: None,
            local_applied: false,
            remote_applied: false,
            local_sent: false,
            candidates: CandidateQueue::default(),
            stats: None,
        };
        spawn(session.run(command_rx, pc_events_rx));
        Ok(PeerSessionHandle {
            label,
            is_initiator,
            commands,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut pc_events: mpsc::UnboundedReceiver<PeerConnectionEvent>,
    ) {
        if self.label == ConnectionLabel::Data && self.is_initiator {
            if let Err(err) = self.peer_connection.create_data_channel().await {
                self.report_error(NegotiationError::DataChannel(err.to_string()));
            }
        }
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Close(done)) => {
                        self.close().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.close().await;
                        break;
                    }
                },
                Some(event) = pc_events.recv() => self.on_peer_connection_event(event),
                _ = tick(&mut self.stats) => self.poll_stats().await,
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::CreateDescription(sdp_type, constraints) => {
                self.create_description(sdp_type, constraints).await
            }
            SessionCommand::SetRemoteDescription(sdp) => self.set_remote_description(sdp).await,
            SessionCommand::AddRemoteIceCandidate(candidate) => {
                if self.is_error {
                    return;
                }
                if let Some(candidate) = self.candidates.push(candidate) {
                    self.add_ice_candidate(candidate).await;
                }
            }
            SessionCommand::RemoveRemoteIceCandidates(candidates) => {
                if self.is_error {
                    return;
                }
                let candidates = self.candidates.remove(candidates);
                if candidates.is_empty() {
                    return;
                }
                if let Err(err) = self.peer_connection.remove_ice_candidates(candidates).await {
                    warn!("{}: failed to remove candidates: {}", self.label, err);
                }
            }
            SessionCommand::EnableStatsEvents(enable, period) => self.enable_stats(enable, period),
            SessionCommand::SendData(data) => {
                if let Err(err) = self.peer_connection.send_data(data).await {
                    warn!("{}: failed to send data: {}", self.label, err);
                }
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(SessionSnapshot {
                    state: self.state,
                    is_error: self.is_error,
                    has_local_description: self.local_sdp.is_some(),
                    buffered_candidates: self.candidates.len(),
                });
            }
            SessionCommand::Close(_) => unreachable!(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("{}: no one listens to session events", self.label);
        }
    }

    fn report_error(&mut self, error: NegotiationError) {
        if self.is_error {
            return;
        }
        error!("Peerconnection error for {}: {}", self.label, error);
        self.is_error = true;
        self.emit(SessionEvent::Error {
            label: self.label,
            error,
        });
    }

    fn prefer_codecs(&self, sdp: &str) -> String {
        let mut sdp = sdp.to_owned();
        if let Some(codec) = &self.config.preferred_video_codec {
            sdp = prefer_codec(&sdp, codec, false);
        }
        if let Some(codec) = &self.config.preferred_audio_codec {
            sdp = prefer_codec(&sdp, codec, true);
        }
        sdp
    }

    async fn create_description(&mut self, sdp_type: SdpType, constraints: MediaConstraints) {
        if self.is_error {
            warn!("{}: create {} in error state", self.label, sdp_type);
            return;
        }
        let result = match sdp_type {
            SdpType::Offer => self.peer_connection.create_offer(constraints).await,
            SdpType::Answer => self.peer_connection.create_answer(constraints).await,
        };
        let desc = match result {
            Ok(desc) => desc,
            Err(err) => {
                self.report_error(NegotiationError::CreateSdp(err.to_string()));
                return;
            }
        };
        if self.local_sdp.is_some() {
            self.report_error(NegotiationError::MultipleSdpCreate);
            return;
        }
        let desc = desc.with_sdp(self.prefer_codecs(&desc.sdp));
        self.local_sdp = Some(desc.clone());
        debug!("{}: set local {}", self.label, desc.sdp_type);
        if let Err(err) = self.peer_connection.set_local_description(desc).await {
            self.report_error(NegotiationError::SetSdp(err.to_string()));
            return;
        }
        self.on_description_applied(Side::Local).await;
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) {
        if self.is_error {
            return;
        }
        let mut sdp = self.prefer_codecs(&desc.sdp);
        if self.label == ConnectionLabel::Media {
            if let Some(kbps) = self.config.video_start_bitrate_kbps {
                let codec = self
                    .config
                    .preferred_video_codec
                    .as_deref()
                    .unwrap_or(DEFAULT_VIDEO_CODEC);
                sdp = set_start_bitrate(codec, true, &sdp, kbps);
            }
            if let Some(kbps) = self.config.audio_start_bitrate_kbps {
                sdp = set_start_bitrate(AUDIO_BITRATE_CODEC, false, &sdp, kbps);
            }
        }
        debug!("{}: set remote {}", self.label, desc.sdp_type);
        if let Err(err) = self
            .peer_connection
            .set_remote_description(desc.with_sdp(sdp))
            .await
        {
            self.report_error(NegotiationError::SetSdp(err.to_string()));
            return;
        }
        self.on_description_applied(Side::Remote).await;
    }

    /// Surfaces the local description the first time it is applied and
    /// drains the candidates the first time both sides are applied.
    async fn on_description_applied(&mut self, side: Side) {
        if self.state == SessionState::Created {
            self.state = SessionState::Negotiating;
        }
        match side {
            Side::Local => {
                self.local_applied = true;
                if !self.local_sent {
                    if let Some(sdp) = self.local_sdp.clone() {
                        self.local_sent = true;
                        self.emit(SessionEvent::LocalDescription {
                            label: self.label,
                            sdp,
                        });
                    }
                }
            }
            Side::Remote => self.remote_applied = true,
        }
        if self.local_applied && self.remote_applied {
            self.drain_candidates().await;
        }
    }

    async fn drain_candidates(&mut self) {
        let candidates = self.candidates.drain();
        if candidates.is_empty() {
            return;
        }
        debug!("{}: add {} remote candidates", self.label, candidates.len());
        for candidate in candidates {
            self.add_ice_candidate(candidate).await;
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) {
        if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
            warn!("{}: failed to add candidate: {}", self.label, err);
        }
    }

    fn enable_stats(&mut self, enable: bool, period: Duration) {
        if !enable {
            if self.stats.take().is_some() {
                debug!("{}: stats disabled", self.label);
            }
            return;
        }
        if period.is_zero() {
            warn!("{}: zero stats period", self.label);
            return;
        }
        if matches!(&self.stats, Some((current, _)) if *current == period) {
            return;
        }
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.stats = Some((period, timer));
        debug!("{}: stats every {:?}", self.label, period);
    }

    async fn poll_stats(&mut self) {
        if self.is_error {
            return;
        }
        match self.peer_connection.stats().await {
            Ok(report) => self.emit(SessionEvent::StatsReady {
                label: self.label,
                report,
            }),
            Err(err) => warn!("{}: failed to get stats: {}", self.label, err),
        }
    }

    fn on_peer_connection_event(&mut self, event: PeerConnectionEvent) {
        let label = self.label;
        match event {
            PeerConnectionEvent::IceCandidate(candidate) => {
                self.emit(SessionEvent::IceCandidate { label, candidate })
            }
            PeerConnectionEvent::IceCandidatesRemoved(candidates) => {
                self.emit(SessionEvent::IceCandidatesRemoved { label, candidates })
            }
            PeerConnectionEvent::IceConnectionChange(state) => {
                debug!("{}: ICE connection state {:?}", label, state);
                match state {
                    IceConnectionState::Connected => {
                        self.state = SessionState::Connected;
                        self.emit(SessionEvent::IceConnected { label });
                    }
                    IceConnectionState::Disconnected => {
                        self.state = SessionState::Disconnected;
                        self.emit(SessionEvent::IceDisconnected { label });
                    }
                    IceConnectionState::Failed => {
                        self.state = SessionState::Disconnected;
                        self.report_error(NegotiationError::IceFailed);
                    }
                    _ => {}
                }
            }
            PeerConnectionEvent::DataChannelOpen => {
                self.emit(SessionEvent::DataChannelOpen { label })
            }
            PeerConnectionEvent::DataChannelMessage(data) => {
                self.emit(SessionEvent::DataMessage { label, data })
            }
            PeerConnectionEvent::DataChannelClosed => {
                self.emit(SessionEvent::DataChannelClosed { label })
            }
        }
    }

    async fn close(&mut self) {
        self.stats = None;
        if let Err(err) = self.peer_connection.close().await {
            warn!("{}: failed to close peer connection: {}", self.label, err);
        }
        self.state = SessionState::Closed;
        self.factory.release();
        info!("{}: peer connection closed", self.label);
        self.emit(SessionEvent::Closed { label: self.label });
    }
}
