use std::{
    thread::available_parallelism,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::json;
use telecall_lib::{
    error::TelemetryError,
    frame::{ApiCode, DcRequest},
    router::{TelemetryPayload, TelemetryService},
};
use time::OffsetDateTime;
use tokio::{fs::read_to_string, spawn, sync::mpsc, time::interval};
use tracing::{debug, warn};

/// Telemetry of the machine this process runs on.
pub struct HostTelemetry {
    state_period: Duration,
    started: Instant,
}

impl HostTelemetry {
    pub fn new(state_period: Duration) -> Self {
        Self {
            state_period,
            started: Instant::now(),
        }
    }
}

fn device_info() -> TelemetryPayload {
    let cpus = available_parallelism().map(|n| n.get()).unwrap_or(1);
    TelemetryPayload::text(
        json!({
            "app": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "cpus": cpus,
        })
        .to_string(),
    )
}

async fn load_average() -> Result<f64, TelemetryError> {
    let text = read_to_string("/proc/loadavg")
        .await
        .map_err(|err| TelemetryError::Unavailable(format!("load average: {}", err)))?;
    text.split_whitespace()
        .next()
        .and_then(|load| load.parse().ok())
        .ok_or_else(|| TelemetryError::Unavailable(format!("load average: {}", text.trim())))
}

async fn device_state(started: Instant) -> Result<TelemetryPayload, TelemetryError> {
    let load = load_average().await?;
    Ok(TelemetryPayload::text(
        json!({
            "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
            "uptime_secs": started.elapsed().as_secs(),
            "load": load,
        })
        .to_string(),
    ))
}

#[async_trait]
impl TelemetryService for HostTelemetry {
    async fn handle(
        &self,
        api: ApiCode,
        _request: &DcRequest,
    ) -> Result<TelemetryPayload, TelemetryError> {
        match api {
            ApiCode::DeviceInfo => Ok(device_info()),
            ApiCode::DeviceState => device_state(self.started).await,
            ApiCode::DevicePhoto => Err(TelemetryError::Unsupported(api.to_byte())),
        }
    }

    fn subscribe(
        &self,
        api: ApiCode,
    ) -> Result<mpsc::UnboundedReceiver<TelemetryPayload>, TelemetryError> {
        if api != ApiCode::DeviceState {
            return Err(TelemetryError::Unsupported(api.to_byte()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut timer = interval(self.state_period);
        let started = self.started;
        spawn(async move {
            loop {
                timer.tick().await;
                let state = match device_state(started).await {
                    Ok(state) => state,
                    Err(err) => {
                        warn!("skip device state: {}", err);
                        continue;
                    }
                };
                if tx.send(state).is_err() {
                    debug!("device state subscription ended");
                    return;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[tokio::test]
    async fn info_is_json_and_photo_is_rejected() {
        let telemetry = HostTelemetry::new(Duration::from_millis(10));
        let request = DcRequest::builder().build();
        let info = telemetry.handle(ApiCode::DeviceInfo, &request).await.unwrap();
        let value: Value = serde_json::from_slice(&info.data).unwrap();
        assert_eq!(value["os"], std::env::consts::OS);
        assert_eq!(
            telemetry.handle(ApiCode::DevicePhoto, &request).await,
            Err(TelemetryError::Unsupported(2))
        );
        assert!(telemetry.subscribe(ApiCode::DeviceInfo).is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn state_stream_ticks() {
        let telemetry = HostTelemetry::new(Duration::from_millis(10));
        let mut states = telemetry.subscribe(ApiCode::DeviceState).unwrap();
        for _ in 0..2 {
            let state = states.recv().await.unwrap();
            let value: Value = serde_json::from_slice(&state.data).unwrap();
            assert!(value["timestamp"].is_i64());
            assert!(value["uptime_secs"].is_u64());
            assert!(value["load"].as_f64().unwrap() >= 0.0);
        }
    }
}
