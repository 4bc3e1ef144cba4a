pub mod data_channel;
#[cfg(test)]
pub mod mock;
pub mod rtc;

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use derive_new::new;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::ResourceError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: u16,
    pub candidate: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Offer, sdp.into())
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Answer, sdp.into())
    }

    pub fn with_sdp(&self, sdp: String) -> Self {
        Self::new(self.sdp_type, sdp)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaConstraints {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

impl MediaConstraints {
    pub fn receive(audio: bool, video: bool) -> Self {
        Self {
            offer_to_receive_audio: audio,
            offer_to_receive_video: video,
        }
    }

    pub fn none() -> Self {
        Self::receive(false, false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Opaque statistics snapshot. Only report ids are carried.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub report_ids: Vec<String>,
}

/// Callbacks of a peer connection, delivered in order on the owning
/// session's queue.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerConnectionEvent {
    IceCandidate(IceCandidate),
    IceCandidatesRemoved(Vec<IceCandidate>),
    IceConnectionChange(IceConnectionState),
    DataChannelOpen,
    DataChannelMessage(Bytes),
    DataChannelClosed,
}

#[derive(Clone, Debug, new)]
pub struct PeerConnectionConfig {
    pub ice_servers: Vec<IceServer>,
    pub data_channel_label: String,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, constraints: MediaConstraints) -> Result<SessionDescription>;
    async fn create_answer(&self, constraints: MediaConstraints) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn remove_ice_candidates(&self, candidates: Vec<IceCandidate>) -> Result<()>;
    async fn create_data_channel(&self) -> Result<()>;
    async fn send_data(&self, data: Bytes) -> Result<()>;
    async fn stats(&self) -> Result<StatsReport>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Prepares the underlying engine. Called when the first user acquires.
    fn initialize(&self) -> Result<()>;

    async fn create_peer_connection(
        &self,
        config: PeerConnectionConfig,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;

    /// Releases the underlying engine. Called when the last user releases.
    fn dispose(&self);
}

struct SharedFactoryInner {
    factory: Arc<dyn PeerConnectionFactory>,
    users: Mutex<usize>,
}

/// Reference-counted handle to a [`PeerConnectionFactory`].
///
/// Every session calls [`SharedFactory::acquire`] once when it is created
/// and [`SharedFactory::release`] once when it is closed. The factory is
/// initialized on the first acquire and disposed on the last release.
#[derive(Clone)]
pub struct SharedFactory {
    inner: Arc<SharedFactoryInner>,
}

impl SharedFactory {
    pub fn new(factory: Arc<dyn PeerConnectionFactory>) -> Self {
        Self {
            inner: Arc::new(SharedFactoryInner {
                factory,
                users: Mutex::new(0),
            }),
        }
    }

    pub fn acquire(&self) -> Result<(), ResourceError> {
        let mut users = self
            .inner
            .users
            .lock()
            .map_err(|_| ResourceError::FactoryUnavailable(anyhow!("factory lock poisoned")))?;
        if *users == 0 {
            info!("initialize peer connection factory");
            self.inner
                .factory
                .initialize()
                .map_err(ResourceError::FactoryUnavailable)?;
        }
        *users += 1;
        debug!("factory users: {}", *users);
        Ok(())
    }

    pub fn release(&self) {
        let Ok(mut users) = self.inner.users.lock() else {
            return;
        };
        if *users == 0 {
            return;
        }
        *users -= 1;
        debug!("factory users: {}", *users);
        if *users == 0 {
            info!("dispose peer connection factory");
            self.inner.factory.dispose();
        }
    }

    pub fn users(&self) -> usize {
        self.inner.users.lock().map(|users| *users).unwrap_or(0)
    }

    pub async fn create_peer_connection(
        &self,
        config: PeerConnectionConfig,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        self.inner
            .factory
            .create_peer_connection(config, events)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingFactory {
        initialized: AtomicUsize,
        disposed: AtomicUsize,
    }

    #[async_trait]
    impl PeerConnectionFactory for CountingFactory {
        fn initialize(&self) -> Result<()> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn create_peer_connection(
            &self,
            _config: PeerConnectionConfig,
            _events: mpsc::UnboundedSender<PeerConnectionEvent>,
        ) -> Result<Arc<dyn PeerConnection>> {
            Err(anyhow!("unused"))
        }

        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn factory_lives_while_acquired() {
        let counting = Arc::new(CountingFactory::default());
        let shared = SharedFactory::new(counting.clone());

        shared.acquire().unwrap();
        shared.clone().acquire().unwrap();
        assert_eq!(counting.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(shared.users(), 2);

        shared.release();
        assert_eq!(counting.disposed.load(Ordering::SeqCst), 0);
        shared.release();
        assert_eq!(counting.disposed.load(Ordering::SeqCst), 1);

        shared.release();
        assert_eq!(counting.disposed.load(Ordering::SeqCst), 1);

        shared.acquire().unwrap();
        assert_eq!(counting.initialized.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn candidate_wire_names() {
        let candidate = IceCandidate::new("0".to_owned(), 1, "candidate:1 1 udp".to_owned());
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"sdpMid": "0", "sdpMLineIndex": 1, "candidate": "candidate:1 1 udp"})
        );
    }
}
