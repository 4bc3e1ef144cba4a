//! Wires the signaling channel, the peer sessions and the data-channel
//! router into one call.

use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    spawn,
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::CallConfig,
    connection::{IceServer, SdpType, SharedFactory, StatsReport},
    error::NegotiationError,
    frame::Role,
    router::{DataChannelRouter, TelemetryService},
    session::{registry::SessionRegistry, SessionEvent},
    signaling::{
        client::{ChannelOptions, SignalingClient},
        envelope::MediaInfo,
        room::RoomParametersSource,
        socket::SocketConnector,
        ConnectionLabel, RoomConnectionParameters, SignalingEvent, SignalingParameters,
    },
};

#[derive(Clone, Debug, PartialEq)]
pub enum CallEvent {
    Connected { label: ConnectionLabel },
    Disconnected { label: ConnectionLabel },
    Stats {
        label: ConnectionLabel,
        report: StatsReport,
    },
    /// One label failed. The other label keeps running.
    SessionFailed {
        label: ConnectionLabel,
        error: NegotiationError,
    },
    /// Fatal to the call. Followed by `Closed`.
    Error(String),
    Closed,
}

enum ControlCommand {
    Hangup(oneshot::Sender<()>),
}

/// Handle of a running call.
#[derive(Clone)]
pub struct CallControl {
    commands: mpsc::UnboundedSender<ControlCommand>,
}

impl CallControl {
    /// Tears the call down and waits until every session is released.
    pub async fn hangup(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(ControlCommand::Hangup(done)).is_err() {
            return;
        }
        let _ = wait.await;
    }
}

/// The external collaborators of a call.
pub struct CallDeps {
    pub rooms: Arc<dyn RoomParametersSource>,
    pub connector: Arc<dyn SocketConnector>,
    pub factory: SharedFactory,
    pub telemetry: Arc<dyn TelemetryService>,
}

pub struct CallOrchestrator {
    config: CallConfig,
    signaling: SignalingClient,
    sessions: SessionRegistry,
    telemetry: Arc<dyn TelemetryService>,
    router: Option<DataChannelRouter>,
    data_sender: mpsc::UnboundedSender<Bytes>,
    ice_servers: Vec<IceServer>,
    events: mpsc::UnboundedSender<CallEvent>,
    closed: bool,
}

impl CallOrchestrator {
    /// Joins `room` and drives the call until hangup or a fatal error.
    pub fn start(
        room: RoomConnectionParameters,
        config: CallConfig,
        deps: CallDeps,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> CallControl {
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let signaling = SignalingClient::spawn(
            deps.rooms,
            deps.connector,
            ChannelOptions::new(
                config.labels.clone(),
                MediaInfo {
                    video: config.video,
                    audio: config.audio,
                },
            ),
            signaling_tx,
        );
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let sessions = SessionRegistry::new(deps.factory, config.session_config(), session_tx);
        let (data_sender, data_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();

        signaling.connect(room);
        let orchestrator = CallOrchestrator {
            config,
            signaling,
            sessions,
            telemetry: deps.telemetry,
            router: None,
            data_sender,
            ice_servers: Vec::new(),
            events,
            closed: false,
        };
        spawn(orchestrator.run(command_rx, signaling_rx, session_rx, data_rx));
        CallControl { commands }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ControlCommand>,
        mut signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut data_rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        while !self.closed {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(ControlCommand::Hangup(done)) => {
                            info!("hang up");
                            self.teardown().await;
                            let _ = done.send(());
                        }
                        None => self.teardown().await,
                    }
                }
                Some(event) = signaling_rx.recv() => self.on_signaling_event(event).await,
                Some(event) = session_rx.recv() => self.on_session_event(event).await,
                Some(frame) = data_rx.recv() => {
                    match self.sessions.get(ConnectionLabel::Data) {
                        Some(session) => session.send_data(frame),
                        None => debug!("drop data frame without a data session"),
                    }
                }
            }
        }
        debug!("call task finished");
    }

    fn emit(&self, event: CallEvent) {
        if self.events.send(event).is_err() {
            debug!("no one listens to call events");
        }
    }

    async fn fail(&mut self, message: String) {
        error!("{}", message);
        self.emit(CallEvent::Error(message));
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut router) = self.router.take() {
            router.close();
        }
        self.sessions.close_all().await;
        self.signaling.disconnect_from_room().await;
        self.emit(CallEvent::Closed);
    }

    /// Closes one label. The call ends with its last session.
    async fn close_session(&mut self, label: ConnectionLabel) {
        self.sessions.close(label).await;
        debug!("{} closed, {} sessions left", label, self.sessions.len());
        if label == ConnectionLabel::Data {
            if let Some(mut router) = self.router.take() {
                router.close();
            }
        }
        if self.sessions.is_empty() {
            self.teardown().await;
        }
    }

    async fn on_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::ConnectedToRoom { params, label } => {
                self.on_connected_to_room(params, label).await
            }
            SignalingEvent::RemoteDescription {
                sdp,
                constraints,
                label,
            } => {
                if self.sessions.get(label).is_none() {
                    if sdp.sdp_type != SdpType::Offer {
                        warn!("{}: answer without a session", label);
                        return;
                    }
                    let ice_servers = self.ice_servers.clone();
                    if let Err(err) = self.sessions.create(label, false, ice_servers).await {
                        self.fail(err.to_string()).await;
                        return;
                    }
                }
                let Some(session) = self.sessions.get(label) else {
                    return;
                };
                let is_offer = sdp.sdp_type == SdpType::Offer;
                session.set_remote_description(sdp);
                if is_offer && !session.is_initiator() {
                    session.create_answer(constraints);
                }
            }
            SignalingEvent::RemoteIceCandidate { candidate, label } => {
                match self.sessions.get(label) {
                    Some(session) => session.add_remote_ice_candidate(candidate),
                    None => warn!("{}: candidate without a session", label),
                }
            }
            SignalingEvent::RemoteIceCandidatesRemoved { candidates, label } => {
                match self.sessions.get(label) {
                    Some(session) => session.remove_remote_ice_candidates(candidates),
                    None => warn!("{}: candidate removal without a session", label),
                }
            }
            SignalingEvent::ChannelClose { label: Some(label) } => {
                info!("remote end hung up {}", label);
                self.close_session(label).await;
            }
            SignalingEvent::ChannelClose { label: None } => {
                info!("remote end hung up");
                self.teardown().await;
            }
            SignalingEvent::ChannelError(err) => self.fail(err.to_string()).await,
        }
    }

    async fn on_connected_to_room(&mut self, params: SignalingParameters, label: ConnectionLabel) {
        self.ice_servers = params.ice_servers.clone();
        let session = match self
            .sessions
            .create(label, params.initiator, params.ice_servers)
            .await
        {
            Ok(session) => session,
            Err(err) => {
                self.fail(err.to_string()).await;
                return;
            }
        };
        if params.initiator {
            info!("{}: creating offer", label);
            session.create_offer(params.media_constraints);
            return;
        }
        if let Some(offer) = params.offer_sdp {
            info!("{}: creating answer", label);
            session.set_remote_description(offer);
            session.create_answer(params.media_constraints);
        }
        for candidate in params.ice_candidates {
            session.add_remote_ice_candidate(candidate);
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::LocalDescription { label, sdp } => match sdp.sdp_type {
                SdpType::Offer => self.signaling.send_offer_sdp(sdp.sdp, label),
                SdpType::Answer => self.signaling.send_answer_sdp(sdp.sdp, label),
            },
            SessionEvent::IceCandidate { label, candidate } => {
                self.signaling.send_local_ice_candidate(candidate, label)
            }
            SessionEvent::IceCandidatesRemoved { label, candidates } => self
                .signaling
                .send_local_ice_candidate_removals(candidates, label),
            SessionEvent::IceConnected { label } => {
                info!("{}: ICE connected", label);
                if label == ConnectionLabel::Media {
                    if let Some(session) = self.sessions.get(label) {
                        session.enable_stats_events(true, self.config.stats_period());
                    }
                }
                self.emit(CallEvent::Connected { label });
            }
            SessionEvent::IceDisconnected { label } => {
                info!("{}: ICE disconnected", label);
                self.emit(CallEvent::Disconnected { label });
                self.close_session(label).await;
            }
            SessionEvent::StatsReady { label, report } => {
                self.emit(CallEvent::Stats { label, report })
            }
            SessionEvent::DataChannelOpen { label } => {
                info!("{}: data channel open", label);
                self.router();
            }
            SessionEvent::DataMessage { data, .. } => self.router().on_message(&data),
            SessionEvent::DataChannelClosed { label } => {
                info!("{}: data channel closed", label);
                if let Some(mut router) = self.router.take() {
                    router.close();
                }
            }
            SessionEvent::Error { label, error } => {
                self.emit(CallEvent::SessionFailed { label, error });
                self.close_session(label).await;
            }
            SessionEvent::Closed { label } => debug!("{}: session closed", label),
        }
    }

    fn router(&mut self) -> &mut DataChannelRouter {
        let telemetry = &self.telemetry;
        let data_sender = &self.data_sender;
        self.router.get_or_insert_with(|| {
            DataChannelRouter::new(Role::Mobile, telemetry.clone(), data_sender.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::{
        connection::{
            mock::{Call, MockFactory},
            IceConnectionState, PeerConnectionEvent,
        },
        error::TelemetryError,
        frame::{ApiCode, DcFrame, DcRequest, DcResponse, ResponseCode},
        router::TelemetryPayload,
        signaling::{
            room::StaticRoomParameters,
            socket::{ChannelSocketConnector, ChannelSocketPeer, SocketEvent},
        },
    };

    const OFFER: &str = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96 98\r\na=rtpmap:96 VP8/90000\r\na=rtpmap:98 VP9/90000\r\n";

    struct TestTelemetry;

    #[async_trait]
    impl TelemetryService for TestTelemetry {
        async fn handle(
            &self,
            api: ApiCode,
            _request: &DcRequest,
        ) -> Result<TelemetryPayload, TelemetryError> {
            match api {
                ApiCode::DeviceInfo => Ok(TelemetryPayload::text("{}")),
                ApiCode::DeviceState => {
                    sleep(Duration::from_secs(10)).await;
                    Ok(TelemetryPayload::text("{}"))
                }
                _ => Err(TelemetryError::Unsupported(api.to_byte())),
            }
        }

        fn subscribe(
            &self,
            api: ApiCode,
        ) -> Result<mpsc::UnboundedReceiver<TelemetryPayload>, TelemetryError> {
            Err(TelemetryError::Unsupported(api.to_byte()))
        }
    }

    struct TestCall {
        control: CallControl,
        events: mpsc::UnboundedReceiver<CallEvent>,
        factory: Arc<MockFactory>,
        server: ChannelSocketPeer,
    }

    async fn start(initiator: bool) -> TestCall {
        let factory = Arc::new(MockFactory::default());
        let (connector, mut peers) = ChannelSocketConnector::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let config = CallConfig {
            stats_period_ms: 20,
            ..Default::default()
        };
        let control = CallOrchestrator::start(
            RoomConnectionParameters::new("ws://localhost/ws".to_owned(), "1".to_owned(), false),
            config,
            CallDeps {
                rooms: Arc::new(StaticRoomParameters::new(vec![], initiator)),
                connector: Arc::new(connector),
                factory: SharedFactory::new(factory.clone()),
                telemetry: Arc::new(TestTelemetry),
            },
            events_tx,
        );
        let mut server = timeout(Duration::from_secs(1), peers.recv())
            .await
            .unwrap()
            .unwrap();
        let hello: Value = serde_json::from_str(&server.outgoing.recv().await.unwrap()).unwrap();
        assert_eq!(hello["type"], "CREATE_OR_JOIN");
        TestCall {
            control,
            events,
            factory,
            server,
        }
    }

    impl TestCall {
        fn push(&self, message: Value) {
            self.server
                .incoming
                .send(SocketEvent::Message(message.to_string()))
                .unwrap();
        }

        async fn next_sent(&mut self) -> Value {
            let text = timeout(Duration::from_secs(1), self.server.outgoing.recv())
                .await
                .unwrap()
                .unwrap();
            serde_json::from_str(&text).unwrap()
        }

        async fn next_event(&mut self) -> CallEvent {
            timeout(Duration::from_secs(1), self.events.recv())
                .await
                .unwrap()
                .unwrap()
        }

        async fn created(&self, count: usize) {
            for _ in 0..100 {
                if self.factory.created_count() >= count {
                    return;
                }
                sleep(Duration::from_millis(5)).await;
            }
            panic!("{} connections were not created", count);
        }
    }

    #[tokio::test]
    async fn answerer_call_end_to_end() {
        let mut call = start(false).await;
        call.push(json!({"type": "JOINED", "payload": {"peer": "web-1"}}));
        assert_eq!(call.next_sent().await["type"], "MEDIA_INFO");
        call.created(2).await;

        call.push(json!({
            "type": "SESSION_DESCRIPTION_OFFER",
            "payload": {
                "sdp": {"type": "offer", "sdp": OFFER},
                "peer": "web-1",
                "type": "web",
                "label": "MEDIA",
                "connectionID": "c1",
            }
        }));
        let answer = call.next_sent().await;
        assert_eq!(answer["type"], "SESSION_DESCRIPTION_ANSWER");
        assert_eq!(answer["payload"]["sdp"]["type"], "answer");
        assert_eq!(answer["payload"]["label"], "MEDIA");
        assert_eq!(answer["payload"]["type"], "mobile");
        assert_eq!(answer["payload"]["connectionID"], "c1");

        let (media, media_events) = call.factory.connection(0);
        media_events
            .send(PeerConnectionEvent::IceCandidate(crate::connection::IceCandidate::new(
                "0".to_owned(),
                0,
                "candidate:local".to_owned(),
            )))
            .unwrap();
        let candidate = call.next_sent().await;
        assert_eq!(candidate["type"], "ICE_CANDIDATE");
        assert_eq!(candidate["payload"]["candidate"]["candidate"], "candidate:local");

        media_events
            .send(PeerConnectionEvent::IceConnectionChange(
                IceConnectionState::Connected,
            ))
            .unwrap();
        assert_eq!(
            call.next_event().await,
            CallEvent::Connected {
                label: ConnectionLabel::Media
            }
        );
        assert!(matches!(
            call.next_event().await,
            CallEvent::Stats {
                label: ConnectionLabel::Media,
                ..
            }
        ));

        let (data, data_events) = call.factory.connection(1);
        data_events.send(PeerConnectionEvent::DataChannelOpen).unwrap();
        let request = DcRequest::builder()
            .from(Role::Web)
            .api_code(ApiCode::DeviceInfo.to_byte())
            .session_id(9)
            .build();
        data_events
            .send(PeerConnectionEvent::DataChannelMessage(request.encode()))
            .unwrap();
        let mut sent = None;
        for _ in 0..100 {
            sent = data.calls().into_iter().find_map(|call| match call {
                Call::SendData(bytes) => Some(bytes),
                _ => None,
            });
            if sent.is_some() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        let response = DcResponse::try_from(DcFrame::decode(&sent.unwrap()).unwrap()).unwrap();
        assert_eq!(response.session_id(), 9);
        assert_eq!(response.response_code(), ResponseCode::Success);

        call.control.hangup().await;
        loop {
            match call.next_event().await {
                CallEvent::Closed => break,
                CallEvent::Stats { .. } => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(media.calls().last(), Some(&Call::Close));
        assert_eq!(data.calls().last(), Some(&Call::Close));
        assert_eq!(
            call.factory
                .disposed
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert!(call.server.outgoing.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_telemetry_does_not_hold_signaling() {
        let mut call = start(false).await;
        call.push(json!({"type": "JOINED", "payload": {"peer": "web-1"}}));
        assert_eq!(call.next_sent().await["type"], "MEDIA_INFO");
        call.created(2).await;
        call.push(json!({
            "type": "SESSION_DESCRIPTION_OFFER",
            "payload": {
                "sdp": {"type": "offer", "sdp": OFFER},
                "peer": "web-1",
                "type": "web",
                "label": "MEDIA",
                "connectionID": "c1",
            }
        }));
        assert_eq!(call.next_sent().await["type"], "SESSION_DESCRIPTION_ANSWER");

        let (_, data_events) = call.factory.connection(1);
        data_events.send(PeerConnectionEvent::DataChannelOpen).unwrap();
        let request = DcRequest::builder()
            .from(Role::Web)
            .api_code(ApiCode::DeviceState.to_byte())
            .session_id(4)
            .build();
        data_events
            .send(PeerConnectionEvent::DataChannelMessage(request.encode()))
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        let (_, media_events) = call.factory.connection(0);
        media_events
            .send(PeerConnectionEvent::IceCandidate(crate::connection::IceCandidate::new(
                "0".to_owned(),
                0,
                "candidate:late".to_owned(),
            )))
            .unwrap();
        let candidate = call.next_sent().await;
        assert_eq!(candidate["type"], "ICE_CANDIDATE");
        assert_eq!(candidate["payload"]["candidate"]["candidate"], "candidate:late");
        call.control.hangup().await;
    }

    #[tokio::test]
    async fn initiator_offers_on_both_labels() {
        let mut call = start(true).await;
        call.push(json!({"type": "JOINED", "payload": {"peer": "web-1"}}));
        assert_eq!(call.next_sent().await["type"], "MEDIA_INFO");

        let mut labels = vec![];
        for _ in 0..2 {
            let offer = call.next_sent().await;
            assert_eq!(offer["type"], "SESSION_DESCRIPTION_OFFER");
            labels.push(offer["payload"]["label"].as_str().unwrap().to_owned());
        }
        labels.sort();
        assert_eq!(labels, vec!["DATA", "MEDIA"]);

        let (data, _) = call.factory.connection(1);
        assert_eq!(data.calls()[0], Call::CreateDataChannel);
        call.control.hangup().await;
    }

    #[tokio::test]
    async fn failed_label_leaves_the_other_running() {
        let mut call = start(false).await;
        call.push(json!({"type": "JOINED", "payload": {"peer": "web-1"}}));
        assert_eq!(call.next_sent().await["type"], "MEDIA_INFO");
        call.created(2).await;

        let (data, data_events) = call.factory.connection(1);
        data_events
            .send(PeerConnectionEvent::IceConnectionChange(
                IceConnectionState::Failed,
            ))
            .unwrap();
        assert_eq!(
            call.next_event().await,
            CallEvent::SessionFailed {
                label: ConnectionLabel::Data,
                error: NegotiationError::IceFailed,
            }
        );

        call.push(json!({"type": "BYE", "payload": {"label": "MEDIA"}}));
        assert_eq!(call.next_event().await, CallEvent::Closed);
        assert_eq!(data.calls().last(), Some(&Call::Close));
        let (media, _) = call.factory.connection(0);
        assert_eq!(media.calls().last(), Some(&Call::Close));
    }

    #[tokio::test]
    async fn room_full_ends_the_call() {
        let mut call = start(false).await;
        call.push(json!({"type": "ROOM_FULL"}));
        assert_eq!(
            call.next_event().await,
            CallEvent::Error("Room is full".to_owned())
        );
        assert_eq!(call.next_event().await, CallEvent::Closed);
        assert_eq!(call.factory.created_count(), 0);
        call.control.hangup().await;
    }
}
