mod websocket;

pub use websocket::WebSocketConnector;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    Message(String),
    Closed,
    Error(String),
}

/// Message-oriented connection to the signaling server.
///
/// Dropping `sender` closes the connection after queued messages are
/// flushed. `receiver` ends after `Closed` or `Error`.
pub struct SignalingSocket {
    pub sender: mpsc::UnboundedSender<String>,
    pub receiver: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SignalingSocket>;
}

/// The server end of a [`ChannelSocketConnector`] connection.
pub struct ChannelSocketPeer {
    pub url: String,
    pub outgoing: mpsc::UnboundedReceiver<String>,
    pub incoming: mpsc::UnboundedSender<SocketEvent>,
}

/// In-process connector. Every connection is handed to the receiver
/// returned by [`ChannelSocketConnector::new`].
pub struct ChannelSocketConnector {
    peer_sender: mpsc::UnboundedSender<ChannelSocketPeer>,
}

impl ChannelSocketConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelSocketPeer>) {
        let (peer_sender, peer_receiver) = mpsc::unbounded_channel();
        (Self { peer_sender }, peer_receiver)
    }
}

#[async_trait]
impl SocketConnector for ChannelSocketConnector {
    async fn connect(&self, url: &str) -> Result<SignalingSocket> {
        let (sender, outgoing) = mpsc::unbounded_channel();
        let (incoming, receiver) = mpsc::unbounded_channel();
        self.peer_sender.send(ChannelSocketPeer {
            url: url.to_owned(),
            outgoing,
            incoming,
        })
        .map_err(|_| anyhow!("connector is closed"))?;
        Ok(SignalingSocket { sender, receiver })
    }
}
