mod room_fetcher;
mod settings;
mod telemetry;
mod tracing_helper;

use std::{env::args, sync::Arc};

use anyhow::Result;
use telecall_lib::{
    connection::{rtc::RtcPeerConnectionFactory, SharedFactory},
    orchestrator::{CallDeps, CallEvent, CallOrchestrator},
    signaling::{
        room::{RoomParametersSource, StaticRoomParameters},
        socket::WebSocketConnector,
    },
};
use tokio::{signal::ctrl_c, sync::mpsc};
use tracing::{error, info, warn};

use crate::{room_fetcher::HttpRoomFetcher, settings::SettingsRepo, telemetry::HostTelemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = tracing_helper::init_tracing("./", concat!(env!("CARGO_PKG_NAME"), ".log"), true)?;

    let mut args = args().skip(1);
    let settings_path = args
        .next()
        .unwrap_or_else(|| concat!(env!("CARGO_PKG_NAME"), ".toml").to_owned());
    let mut settings = SettingsRepo::new(settings_path).load().await?;
    if let Some(room_id) = args.next() {
        settings.room.id = room_id;
    }

    let rooms: Arc<dyn RoomParametersSource> = if settings.room.is_direct_channel() {
        Arc::new(StaticRoomParameters::new(
            settings.call.ice_servers.clone(),
            false,
        ))
    } else {
        Arc::new(HttpRoomFetcher::new(settings.room.fetch_timeout()))
    };
    let deps = CallDeps {
        rooms,
        connector: Arc::new(WebSocketConnector),
        factory: SharedFactory::new(Arc::new(RtcPeerConnectionFactory::new())),
        telemetry: Arc::new(HostTelemetry::new(settings.call.device_state_period())),
    };

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let control = CallOrchestrator::start(
        settings.room.to_parameters(),
        settings.call,
        deps,
        events_tx,
    );

    loop {
        tokio::select! {
            _ = ctrl_c() => {
                info!("interrupted");
                control.hangup().await;
            }
            event = events.recv() => {
                match event {
                    Some(CallEvent::Connected { label }) => info!("{} connected", label),
                    Some(CallEvent::Disconnected { label }) => warn!("{} disconnected", label),
                    Some(CallEvent::Stats { label, report }) => {
                        info!("{} stats: {} reports", label, report.report_ids.len())
                    }
                    Some(CallEvent::SessionFailed { label, error }) => {
                        error!("{} failed: {}", label, error)
                    }
                    Some(CallEvent::Error(message)) => error!("call failed: {}", message),
                    Some(CallEvent::Closed) | None => break,
                }
            }
        }
    }
    info!("bye");
    Ok(())
}
