use std::{collections::HashMap, future::pending, sync::Arc};

use derive_new::new;
use tokio::{
    spawn,
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    envelope::{
        CandidatePayload, Inbound, MediaInfo, Outbound, OutboundSdp, RemovalPayload, Routing,
        PEER_TYPE_MOBILE,
    },
    room::RoomParametersSource,
    socket::{SocketConnector, SocketEvent},
    ChannelState, ConnectionLabel, RoomConnectionParameters, SignalingEvent, SignalingParameters,
};
use crate::{
    connection::{IceCandidate, MediaConstraints, SdpType, SessionDescription},
    error::ChannelError,
};

#[derive(Clone, Debug, new)]
pub struct ChannelOptions {
    /// Labels announced by `ConnectedToRoom` after the room is joined.
    pub labels: Vec<ConnectionLabel>,
    pub local_media: MediaInfo,
}

enum Command {
    Connect(RoomConnectionParameters),
    SendSdp(SessionDescription, ConnectionLabel),
    SendCandidate(IceCandidate, ConnectionLabel),
    SendRemovals(Vec<IceCandidate>, ConnectionLabel),
    Disconnect(oneshot::Sender<()>),
    State(oneshot::Sender<ChannelState>),
}

/// Handle to the signaling channel task. Every call is queued and handled
/// in order; results arrive as [`SignalingEvent`]s.
#[derive(Clone)]
pub struct SignalingClient {
    commands: mpsc::UnboundedSender<Command>,
}

impl SignalingClient {
    pub fn spawn(
        rooms: Arc<dyn RoomParametersSource>,
        connector: Arc<dyn SocketConnector>,
        options: ChannelOptions,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Self {
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let channel = SignalingChannel {
            state: ChannelState::New,
            rooms,
            connector,
            options,
            events,
            room: None,
            pending_params: None,
            client_id: None,
            socket: None,
            socket_rx: None,
            routes: HashMap::new(),
            remote_media: MediaInfo::default(),
        };
        spawn(channel.run(command_receiver));
        Self { commands }
    }

    fn enqueue(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("signaling channel task is gone");
        }
    }

    pub fn connect(&self, params: RoomConnectionParameters) {
        self.enqueue(Command::Connect(params));
    }

    pub fn send_offer_sdp(&self, sdp: String, label: ConnectionLabel) {
        self.enqueue(Command::SendSdp(SessionDescription::offer(sdp), label));
    }

    pub fn send_answer_sdp(&self, sdp: String, label: ConnectionLabel) {
        self.enqueue(Command::SendSdp(SessionDescription::answer(sdp), label));
    }

    pub fn send_local_ice_candidate(&self, candidate: IceCandidate, label: ConnectionLabel) {
        self.enqueue(Command::SendCandidate(candidate, label));
    }

    pub fn send_local_ice_candidate_removals(
        &self,
        candidates: Vec<IceCandidate>,
        label: ConnectionLabel,
    ) {
        self.enqueue(Command::SendRemovals(candidates, label));
    }

    pub async fn disconnect_from_room(&self) {
        let (done, wait) = oneshot::channel();
        self.enqueue(Command::Disconnect(done));
        let _ = wait.await;
    }

    pub async fn state(&self) -> ChannelState {
        let (reply, wait) = oneshot::channel();
        self.enqueue(Command::State(reply));
        wait.await.unwrap_or(ChannelState::Closed)
    }
}

async fn recv_socket(
    socket_rx: &mut Option<mpsc::UnboundedReceiver<SocketEvent>>,
) -> Option<SocketEvent> {
    match socket_rx {
        Some(socket_rx) => socket_rx.recv().await,
        None => pending().await,
    }
}

struct SignalingChannel {
    state: ChannelState,
    rooms: Arc<dyn RoomParametersSource>,
    connector: Arc<dyn SocketConnector>,
    options: ChannelOptions,
    events: mpsc::UnboundedSender<SignalingEvent>,
    room: Option<RoomConnectionParameters>,
    /// Held from the room fetch until the server confirms JOINED.
    pending_params: Option<SignalingParameters>,
    client_id: Option<String>,
    socket: Option<mpsc::UnboundedSender<String>>,
    socket_rx: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    routes: HashMap<ConnectionLabel, Routing>,
    remote_media: MediaInfo,
}

impl SignalingChannel {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command).await;
                }
                event = recv_socket(&mut self.socket_rx) => {
                    match event {
                        Some(event) => self.handle_socket_event(event),
                        None => self.socket_rx = None,
                    }
                }
            }
        }
        debug!("signaling channel task finished");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(room) => self.connect(room).await,
            Command::SendSdp(sdp, label) => {
                let payload = OutboundSdp {
                    sdp,
                    routing: self.route(label),
                };
                let message = match payload.sdp.sdp_type {
                    SdpType::Offer => Outbound::SessionDescriptionOffer(payload),
                    SdpType::Answer => Outbound::SessionDescriptionAnswer(payload),
                };
                self.send(message);
            }
            Command::SendCandidate(candidate, label) => {
                let routing = self.route(label);
                self.send(Outbound::IceCandidate(CandidatePayload { candidate, routing }));
            }
            Command::SendRemovals(candidates, label) => {
                let routing = self.route(label);
                self.send(Outbound::RemoveCandidates(RemovalPayload {
                    candidates,
                    routing,
                }));
            }
            Command::Disconnect(done) => {
                self.disconnect().await;
                let _ = done.send(());
            }
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
        }
    }

    async fn connect(&mut self, room: RoomConnectionParameters) {
        if self.state != ChannelState::New {
            warn!("connect in {:?} state is ignored", self.state);
            return;
        }
        info!("Connect to room: {} {}", room.room_url, room.room_id);
        self.room = Some(room.clone());

        let params = match self.rooms.fetch(&room).await {
            Ok(params) => params,
            Err(err) => {
                self.report_error(err);
                return;
            }
        };
        if room.loopback && (!params.initiator || params.offer_sdp.is_some()) {
            self.report_error(ChannelError::LoopbackBusy);
            return;
        }

        let socket = match self.connector.connect(&params.wss_url).await {
            Ok(socket) => socket,
            Err(err) => {
                self.report_error(ChannelError::Transport(err.to_string()));
                return;
            }
        };
        self.state = ChannelState::Connected;
        self.client_id = Some(params.client_id.clone()).filter(|id| !id.is_empty());
        self.pending_params = Some(params);
        self.socket = Some(socket.sender);
        self.socket_rx = Some(socket.receiver);
        self.send(Outbound::CreateOrJoin {
            room_id: room.room_id,
        });
    }

    async fn disconnect(&mut self) {
        match self.state {
            ChannelState::Closed | ChannelState::Error => {
                self.socket = None;
                return;
            }
            ChannelState::New | ChannelState::Connected => {}
        }
        info!("Disconnect. Room state: {:?}", self.state);
        let was_connected = self.state == ChannelState::Connected;
        self.state = ChannelState::Closed;
        self.socket = None;
        self.pending_params = None;
        if !was_connected {
            return;
        }
        if let (Some(room), Some(client_id)) = (&self.room, &self.client_id) {
            if let Err(err) = self.rooms.leave(room, client_id).await {
                warn!("failed to leave room: {}", err);
            }
        }
    }

    fn route(&mut self, label: ConnectionLabel) -> Routing {
        self.routes
            .entry(label)
            .or_insert_with(|| Routing {
                peer_type: PEER_TYPE_MOBILE.to_owned(),
                label,
                ..Default::default()
            })
            .clone()
    }

    fn update_route(&mut self, routing: &Routing) {
        if routing.is_empty() {
            return;
        }
        let label = routing.label;
        let route = self.routes.entry(label).or_insert_with(|| Routing {
            peer_type: PEER_TYPE_MOBILE.to_owned(),
            label,
            ..Default::default()
        });
        if !routing.peer.is_empty() {
            route.peer = routing.peer.clone();
        }
        if !routing.connection_id.is_empty() {
            route.connection_id = routing.connection_id.clone();
        }
    }

    fn remote_constraints(&self, label: ConnectionLabel) -> MediaConstraints {
        match label {
            ConnectionLabel::Media => {
                MediaConstraints::receive(self.remote_media.audio, self.remote_media.video)
            }
            ConnectionLabel::Data => MediaConstraints::none(),
        }
    }

    fn send(&mut self, message: Outbound) {
        match self.state {
            ChannelState::Connected => {}
            ChannelState::New => {
                self.report_error(ChannelError::NotConnected(message.kind()));
                return;
            }
            ChannelState::Error | ChannelState::Closed => {
                debug!("drop {} in {:?} state", message.kind(), self.state);
                return;
            }
        }
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(err) => {
                error!("failed to serialize {}: {}", message.kind(), err);
                return;
            }
        };
        let sent = self
            .socket
            .as_ref()
            .map_or(false, |socket| socket.send(text).is_ok());
        if !sent {
            self.report_error(ChannelError::Transport("socket is closed".to_owned()));
        }
    }

    fn emit(&self, event: SignalingEvent) {
        if self.events.send(event).is_err() {
            debug!("no one listens to signaling events");
        }
    }

    fn report_error(&mut self, err: ChannelError) {
        if self.state == ChannelState::Error {
            debug!("suppressed signaling error: {}", err);
            return;
        }
        error!("{}", err);
        self.state = ChannelState::Error;
        self.socket = None;
        self.pending_params = None;
        self.emit(SignalingEvent::ChannelError(err));
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Message(text) => self.on_message(&text),
            SocketEvent::Closed => {
                self.socket_rx = None;
                if self.state == ChannelState::Connected {
                    self.report_error(ChannelError::Transport(
                        "closed by signaling server".to_owned(),
                    ));
                }
            }
            SocketEvent::Error(err) => {
                self.socket_rx = None;
                self.report_error(ChannelError::Transport(err));
            }
        }
    }

    fn on_message(&mut self, text: &str) {
        if self.state != ChannelState::Connected {
            debug!("drop message in {:?} state", self.state);
            return;
        }
        let message = match Inbound::parse(text) {
            Ok(message) => message,
            Err(err) => {
                self.report_error(err);
                return;
            }
        };
        match message {
            Inbound::Created => info!("room created, waiting for the peer"),
            Inbound::Joined { peer } => self.on_joined(peer),
            Inbound::RoomFull => self.report_error(ChannelError::RoomFull),
            Inbound::IceCandidate(payload) => {
                self.update_route(&payload.routing);
                self.emit(SignalingEvent::RemoteIceCandidate {
                    candidate: payload.candidate,
                    label: payload.routing.label,
                });
            }
            Inbound::Offer { sdp, routing } => {
                self.update_route(&routing);
                self.emit(SignalingEvent::RemoteDescription {
                    sdp: SessionDescription::offer(sdp),
                    constraints: self.remote_constraints(routing.label),
                    label: routing.label,
                });
            }
            Inbound::Answer { sdp, routing } => {
                self.update_route(&routing);
                self.emit(SignalingEvent::RemoteDescription {
                    sdp: SessionDescription::answer(sdp),
                    constraints: self.remote_constraints(routing.label),
                    label: routing.label,
                });
            }
            Inbound::RemoveCandidates(payload) => {
                self.update_route(&payload.routing);
                self.emit(SignalingEvent::RemoteIceCandidatesRemoved {
                    candidates: payload.candidates,
                    label: payload.routing.label,
                });
            }
            Inbound::MediaInfo(media) => {
                debug!("remote media: {:?}", media);
                self.remote_media = media;
            }
            Inbound::Bye { label } => self.emit(SignalingEvent::ChannelClose { label }),
            Inbound::Unknown(kind) => warn!("Unexpected message type: {}", kind),
        }
    }

    fn on_joined(&mut self, peer: Option<String>) {
        let Some(params) = self.pending_params.take() else {
            warn!("JOINED again, ignored");
            return;
        };
        self.send(Outbound::MediaInfo {
            media: self.options.local_media,
        });
        let peer = peer.unwrap_or_default();
        for label in self.options.labels.clone() {
            self.routes.insert(
                label,
                Routing {
                    peer: peer.clone(),
                    peer_type: PEER_TYPE_MOBILE.to_owned(),
                    label,
                    connection_id: Uuid::new_v4().to_string(),
                },
            );
            let constraints = self.remote_constraints(label);
            let params = match label {
                ConnectionLabel::Media => SignalingParameters {
                    media_constraints: constraints,
                    ..params.clone()
                },
                ConnectionLabel::Data => params.without_queued_messages(constraints),
            };
            info!("connected to room, label {}", label);
            self.emit(SignalingEvent::ConnectedToRoom { params, label });
        }
    }
}
