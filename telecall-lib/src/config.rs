use std::time::Duration;

use serde::Deserialize;

use crate::{connection::IceServer, session::SessionConfig, signaling::ConnectionLabel};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub labels: Vec<ConnectionLabel>,
    pub video: bool,
    pub audio: bool,
    pub preferred_video_codec: Option<String>,
    pub preferred_audio_codec: Option<String>,
    pub video_start_bitrate_kbps: Option<u32>,
    pub audio_start_bitrate_kbps: Option<u32>,
    pub stats_period_ms: u64,
    pub device_state_period_ms: u64,
    pub ice_servers: Vec<IceServer>,
    pub data_channel_label: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            labels: vec![ConnectionLabel::Media, ConnectionLabel::Data],
            video: true,
            audio: true,
            preferred_video_codec: Some("VP9".to_owned()),
            preferred_audio_codec: None,
            video_start_bitrate_kbps: None,
            audio_start_bitrate_kbps: None,
            stats_period_ms: 1000,
            device_state_period_ms: 5000,
            ice_servers: Vec::new(),
            data_channel_label: "MobileDC".to_owned(),
        }
    }
}

impl CallConfig {
    pub fn stats_period(&self) -> Duration {
        Duration::from_millis(self.stats_period_ms)
    }

    pub fn device_state_period(&self) -> Duration {
        Duration::from_millis(self.device_state_period_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            preferred_video_codec: self.preferred_video_codec.clone(),
            preferred_audio_codec: self.preferred_audio_codec.clone(),
            video_start_bitrate_kbps: self.video_start_bitrate_kbps,
            audio_start_bitrate_kbps: self.audio_start_bitrate_kbps,
            data_channel_label: self.data_channel_label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: CallConfig = toml::from_str(
            r#"
            labels = ["MEDIA"]
            video = false
            video_start_bitrate_kbps = 1700
            device_state_period_ms = 250

            [[ice_servers]]
            urls = ["stun:stun.example.org"]
            "#,
        )
        .unwrap();
        assert_eq!(config.labels, vec![ConnectionLabel::Media]);
        assert!(!config.video);
        assert!(config.audio);
        assert_eq!(config.preferred_video_codec.as_deref(), Some("VP9"));
        assert_eq!(config.video_start_bitrate_kbps, Some(1700));
        assert_eq!(config.stats_period(), Duration::from_secs(1));
        assert_eq!(config.device_state_period(), Duration::from_millis(250));
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.example.org"]);
        assert_eq!(config.ice_servers[0].username, "");
        assert_eq!(config.session_config().data_channel_label, "MobileDC");
    }
}
