use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::video::capture::CaptureConfig;
use crate::webrtc::config::WebRtcConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Device identity
    pub device: DeviceConfig,
    /// Backend endpoints
    pub server: ServerConfig,
    /// Camera capture and encoding
    pub camera: CaptureConfig,
    /// Media directories and cleanup
    pub storage: StorageConfig,
    /// Motion sensor channel
    pub sensor: SensorConfig,
    /// ICE servers and gathering
    pub webrtc: WebRtcConfig,
}

/// Device identity, filled in by provisioning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub uuid: Option<String>,
    pub name: String,
    pub location: String,
    /// Key issued by the backend on registration
    pub api_key: Option<String>,
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP API base, with trailing slash
    pub api_uri: String,
    /// WebSocket base, with trailing slash
    pub ws_uri: String,
    /// Delay between signaling redial attempts
    pub reconnect_delay_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_uri: "http://localhost:8000/".to_string(),
            ws_uri: "ws://localhost:8000/".to_string(),
            reconnect_delay_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub video_dir: PathBuf,
    pub image_dir: PathBuf,
    /// Hours between media sweeps, 0 disables
    pub cleanup_interval_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            video_dir: PathBuf::from("/var/lib/pirtc/videos"),
            image_dir: PathBuf::from("/var/lib/pirtc/images"),
            cleanup_interval_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub enabled: bool,
    pub socket_path: PathBuf,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket_path: PathBuf::from("/tmp/pir.sock"),
        }
    }
}
