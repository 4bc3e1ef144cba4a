use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::{spawn, sync::mpsc};
use tracing::{debug, warn};
use webrtc::data_channel::RTCDataChannel;

use super::PeerConnectionEvent;

pub struct DataChannel {
    rtc: Arc<RTCDataChannel>,
    message_sender: mpsc::Sender<Bytes>,
}

impl DataChannel {
    pub async fn new(
        rtc: Arc<RTCDataChannel>,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Self {
        let (message_sender, mut outgoing_message_receiver) = mpsc::channel::<Bytes>(16);
        {
            let events = events.clone();
            let label = rtc.label().to_owned();
            rtc.on_open(Box::new(move || {
                debug!("data channel {} open", label);
                let _ = events.send(PeerConnectionEvent::DataChannelOpen);
                Box::pin(async {})
            }));
        }
        {
            let events = events.clone();
            rtc.on_message(Box::new(move |msg| {
                let _ = events.send(PeerConnectionEvent::DataChannelMessage(msg.data));
                Box::pin(async {})
            }));
        }
        rtc.on_error(Box::new(|err| {
            warn!("data channel error: {}", err);
            Box::pin(async {})
        }));
        rtc.on_close(Box::new(move || {
            let _ = events.send(PeerConnectionEvent::DataChannelClosed);
            Box::pin(async {})
        }));

        {
            // Sends are serialized on one task; ErrClosedPipe ends it.
            let rtc = rtc.clone();
            spawn(async move {
                while let Some(data) = outgoing_message_receiver.recv().await {
                    let result = rtc.send(&data).await;
                    if let Err(webrtc::Error::ErrClosedPipe) = result {
                        return;
                    } else if let Err(err) = result {
                        warn!("failed to send on data channel: {}", err);
                    }
                }
            });
        }

        Self {
            rtc,
            message_sender,
        }
    }

    pub fn label(&self) -> &str {
        self.rtc.label()
    }

    pub async fn send(&self, data: Bytes) -> Result<()> {
        Ok(self.message_sender.send(data).await?)
    }

    pub async fn close(&self) -> Result<()> {
        Ok(self.rtc.close().await?)
    }
}
