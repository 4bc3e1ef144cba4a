use std::{io::ErrorKind, time::Duration};

use anyhow::Result;
use derive_new::new;
use serde::Deserialize;
use telecall_lib::{config::CallConfig, signaling::RoomConnectionParameters};
use tokio::fs::read_to_string;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    pub url: String,
    pub id: String,
    pub loopback: bool,
    pub fetch_timeout_ms: u64,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            url: "https://appr.tc".to_owned(),
            id: String::new(),
            loopback: false,
            fetch_timeout_ms: 5000,
        }
    }
}

impl RoomSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Channel URLs are used as they are. Anything else is a room server.
    pub fn is_direct_channel(&self) -> bool {
        self.url.starts_with("ws://") || self.url.starts_with("wss://")
    }

    pub fn to_parameters(&self) -> RoomConnectionParameters {
        RoomConnectionParameters::new(self.url.clone(), self.id.clone(), self.loopback)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub room: RoomSettings,
    pub call: CallConfig,
}

#[derive(new)]
pub struct SettingsRepo {
    path: String,
}

impl SettingsRepo {
    pub async fn load(&self) -> Result<Settings> {
        match read_to_string(&self.path).await {
            Ok(text) => Ok(toml::from_str(&text)?),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("{} not found, using defaults", self.path);
                Ok(Settings::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use telecall_lib::signaling::ConnectionLabel;

    use super::*;

    #[tokio::test]
    async fn missing_file_is_default() {
        let repo = SettingsRepo::new("./no-such-telecall.toml".to_owned());
        assert_eq!(repo.load().await.unwrap(), Settings::default());
    }

    #[tokio::test]
    async fn loads_room_and_call_sections() {
        let path = std::env::temp_dir().join(format!("telecall-{}.toml", std::process::id()));
        tokio::fs::write(
            &path,
            r#"
            [room]
            url = "wss://signal.example.org/ws"
            id = "10010"

            [call]
            labels = ["DATA"]
            preferred_audio_codec = "ISAC"
            "#,
        )
        .await
        .unwrap();
        let settings = SettingsRepo::new(path.to_string_lossy().into_owned())
            .load()
            .await
            .unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert!(settings.room.is_direct_channel());
        assert_eq!(settings.room.fetch_timeout(), Duration::from_secs(5));
        assert_eq!(settings.room.to_parameters().room_id, "10010");
        assert_eq!(settings.call.labels, vec![ConnectionLabel::Data]);
        assert_eq!(settings.call.preferred_audio_codec.as_deref(), Some("ISAC"));
        assert!(settings.call.video);
    }

    #[tokio::test]
    async fn broken_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("telecall-bad-{}.toml", std::process::id()));
        tokio::fs::write(&path, "[room\n").await.unwrap();
        let result = SettingsRepo::new(path.to_string_lossy().into_owned())
            .load()
            .await;
        tokio::fs::remove_file(&path).await.unwrap();
        assert!(result.is_err());
    }
}
