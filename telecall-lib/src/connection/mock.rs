use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{
    IceCandidate, MediaConstraints, PeerConnection, PeerConnectionConfig, PeerConnectionEvent,
    PeerConnectionFactory, SessionDescription, StatsReport,
};

pub const LOCAL_SDP: &str = "v=0\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 96 98\r\n\
    a=rtpmap:96 VP8/90000\r\n\
    a=rtpmap:98 VP9/90000\r\n";

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    RemoveCandidates(Vec<IceCandidate>),
    CreateDataChannel,
    SendData(Bytes),
    Stats,
    Close,
}

/// Records every call it receives.
#[derive(Default)]
pub struct MockPeerConnection {
    calls: Mutex<Vec<Call>>,
    pub fail_set_remote: AtomicBool,
}

impl MockPeerConnection {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::AddCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self, _constraints: MediaConstraints) -> Result<SessionDescription> {
        self.record(Call::CreateOffer);
        Ok(SessionDescription::offer(LOCAL_SDP))
    }

    async fn create_answer(&self, _constraints: MediaConstraints) -> Result<SessionDescription> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer(LOCAL_SDP))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(Call::SetLocal(desc));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(Call::SetRemote(desc));
        if self.fail_set_remote.load(Ordering::SeqCst) {
            bail!("rejected remote description");
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(Call::AddCandidate(candidate));
        Ok(())
    }

    async fn remove_ice_candidates(&self, candidates: Vec<IceCandidate>) -> Result<()> {
        self.record(Call::RemoveCandidates(candidates));
        Ok(())
    }

    async fn create_data_channel(&self) -> Result<()> {
        self.record(Call::CreateDataChannel);
        Ok(())
    }

    async fn send_data(&self, data: Bytes) -> Result<()> {
        self.record(Call::SendData(data));
        Ok(())
    }

    async fn stats(&self) -> Result<StatsReport> {
        self.record(Call::Stats);
        Ok(StatsReport {
            report_ids: vec!["RTCPeerConnection".to_owned()],
        })
    }

    async fn close(&self) -> Result<()> {
        self.record(Call::Close);
        Ok(())
    }
}

pub struct CreatedConnection {
    pub config: PeerConnectionConfig,
    pub connection: Arc<MockPeerConnection>,
    pub events: mpsc::UnboundedSender<PeerConnectionEvent>,
}

#[derive(Default)]
pub struct MockFactory {
    pub created: Mutex<Vec<CreatedConnection>>,
    pub initialized: AtomicUsize,
    pub disposed: AtomicUsize,
    pub fail_initialize: AtomicBool,
}

impl MockFactory {
    pub fn connection(&self, index: usize) -> (Arc<MockPeerConnection>, mpsc::UnboundedSender<PeerConnectionEvent>) {
        let created = self.created.lock().unwrap();
        (created[index].connection.clone(), created[index].events.clone())
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    fn initialize(&self) -> Result<()> {
        if self.fail_initialize.load(Ordering::SeqCst) {
            bail!("no media engine");
        }
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_peer_connection(
        &self,
        config: PeerConnectionConfig,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(MockPeerConnection::default());
        self.created.lock().unwrap().push(CreatedConnection {
            config,
            connection: connection.clone(),
            events,
        });
        Ok(connection)
    }

    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}
