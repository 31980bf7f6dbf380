//! Runtime configuration of the relay. Loaded from `ServerConfig.json`
//! next to the binary; a missing file means defaults, a broken file is a
//! startup error. One process serves exactly one room, scaling out means
//! running one process per room on its own port.

use protocol::DEFAULT_PORT;
use serde::Deserialize;
use std::io::ErrorKind;
use tokio::fs;

/// The file the relay reads its settings from.
pub const CONFIG_FILE: &str = "ServerConfig.json";

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the listener binds to.
    pub bind_addr: String,
    /// Port of this room.
    pub port: u16,
    /// Address the room is advertised under towards the profile service.
    pub room_addr: String,
    /// Base URL of the profile/leaderboard service.
    pub profile_base_url: String,
    /// Read timeout while a match runs. A participant silent for longer
    /// than this forfeits the match.
    pub read_timeout_ms: u64,
    /// Maximum amount of players in the room (0 = no limit).
    pub max_players: u16,
    /// Depth of the fire-and-forget profile report queue.
    pub report_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            room_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            profile_base_url: "http://127.0.0.1:8000".to_string(),
            read_timeout_ms: 2000,
            max_players: 0,
            report_queue: 64,
        }
    }
}

/// Reads the configuration file. An absent file falls back to defaults so
/// the relay can run out of the box.
pub async fn load_config() -> Result<RelayConfig, String> {
    let json_content = match fs::read_to_string(CONFIG_FILE).await {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::info!("No {} found, using defaults.", CONFIG_FILE);
            return Ok(RelayConfig::default());
        }
        Err(err) => return Err(format!("Failed to read {}: {}", CONFIG_FILE, err)),
    };
    serde_json::from_str(&json_content).map_err(|e| format!("Failed to parse {}: {}", CONFIG_FILE, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: RelayConfig = serde_json::from_str(r#"{ "port": 5555 }"#).unwrap();
        assert_eq!(config.port, 5555);
        assert_eq!(config.read_timeout_ms, 2000);
        assert_eq!(config.max_players, 0);
    }
}
