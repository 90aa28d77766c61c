//! WebRTC configuration

use serde::{Deserialize, Serialize};

/// Public STUN server used when nothing else is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Upper bound on ICE candidate gathering before the answer is sent (ms)
    pub gathering_timeout_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_servers: vec![],
            gathering_timeout_ms: 5000,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs; several allow fallback between UDP and TCP
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_public_stun() {
        let config = WebRtcConfig::default();
        assert_eq!(config.stun_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert!(config.turn_servers.is_empty());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: WebRtcConfig = serde_json::from_str(r#"{"gathering_timeout_ms": 800}"#).unwrap();
        assert_eq!(config.gathering_timeout_ms, 800);
        assert_eq!(config.stun_servers.len(), 1);
    }
}
