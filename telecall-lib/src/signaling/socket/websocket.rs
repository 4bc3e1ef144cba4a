use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{spawn, sync::mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{SignalingSocket, SocketConnector, SocketEvent};

pub struct WebSocketConnector;

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<SignalingSocket> {
        info!("connect {}", url);
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (sender, mut outgoing) = mpsc::unbounded_channel::<String>();
        let (incoming, receiver) = mpsc::unbounded_channel();

        spawn(async move {
            while let Some(text) = outgoing.recv().await {
                debug!("C->WSS: {}", text);
                if let Err(err) = write.send(Message::Text(text)).await {
                    warn!("failed to send to signaling server: {}", err);
                    return;
                }
            }
            let _ = write.close().await;
        });

        spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        debug!("WSS->C: {}", text);
                        if incoming.send(SocketEvent::Message(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("closed by server: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = incoming.send(SocketEvent::Error(err.to_string()));
                        return;
                    }
                }
            }
            let _ = incoming.send(SocketEvent::Closed);
        });

        Ok(SignalingSocket { sender, receiver })
    }
}
